// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! One external tool server: spec, lifecycle and the MCP stdio connection.
//!
//! Every server is an independent OS subprocess speaking MCP over stdio.
//! The transport, framing and initialize handshake are delegated to `rmcp`;
//! this module only decides *when* to spawn, probe and tear down, and maps
//! wire types into the crate's own descriptors.  Child processes are spawned
//! kill-on-drop, so no exit path leaves an orphaned subprocess.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use rmcp::{
    model::{CallToolRequestParam, ClientCapabilities, ClientInfo, Implementation, ProtocolVersion},
    service::{DynService, RunningService, ServerSink},
    transport::child_process::TokioChildProcess,
    RoleClient, ServiceExt,
};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, warn};

use parley_config::ToolServerConfig;

use crate::error::ToolError;

/// Who may see a server's tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerScope {
    /// Visible to every agent.
    Global,
    /// Visible only to the named agent.
    Agent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Ready,
    Unhealthy,
}

/// Everything needed to spawn (and re-spawn) one tool server.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    /// Registry key.  Agent-scoped servers are prefixed with the agent id so
    /// two agents can declare the same base name without colliding.
    pub name: String,
    pub scope: ServerScope,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Deadline for the initialize handshake.
    pub startup_deadline: Duration,
    /// Time a stopping server gets before force-termination.
    pub grace_period: Duration,
}

impl ServerSpec {
    pub fn global(cfg: &ToolServerConfig, startup_deadline: Duration, grace_period: Duration) -> Self {
        Self {
            name: cfg.name.clone(),
            scope: ServerScope::Global,
            command: cfg.command.clone(),
            args: cfg.args.clone(),
            env: cfg.env.clone(),
            startup_deadline,
            grace_period,
        }
    }

    /// An agent-scoped server is registered as `{agent_id}_{base_name}`.
    pub fn agent_scoped(
        agent_id: &str,
        cfg: &ToolServerConfig,
        startup_deadline: Duration,
        grace_period: Duration,
    ) -> Self {
        Self {
            name: format!("{agent_id}_{}", cfg.name),
            scope: ServerScope::Agent(agent_id.to_string()),
            command: cfg.command.clone(),
            args: cfg.args.clone(),
            env: cfg.env.clone(),
            startup_deadline,
            grace_period,
        }
    }
}

/// One tool as enumerated from a server.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object, passed through verbatim.
    pub input_schema: serde_json::Value,
}

/// The result of a completed tool call.  `is_error` mirrors the server's own
/// error flag; transport-level failures are [`ToolError`]s instead.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub content: String,
    pub is_error: bool,
}

/// A live MCP connection to one subprocess server.
pub(crate) struct ServerConnection {
    service: RunningService<RoleClient, Box<dyn DynService<RoleClient>>>,
}

impl ServerConnection {
    /// Spawn the subprocess and run the initialize handshake, bounded by the
    /// spec's `startup_deadline`.
    pub(crate) async fn spawn(spec: &ServerSpec) -> Result<Self, ToolError> {
        let client_info =
            ClientInfo::new(ClientCapabilities::default(), Implementation::from_build_env())
                .with_protocol_version(ProtocolVersion::default());

        let mut cmd = tokio::process::Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let transport = TokioChildProcess::new(cmd).map_err(|e| ToolError::Startup {
            name: spec.name.clone(),
            detail: format!("spawn failed: {e}"),
        })?;

        let service = timeout(spec.startup_deadline, client_info.into_dyn().serve(transport))
            .await
            .map_err(|_| ToolError::Startup {
                name: spec.name.clone(),
                detail: format!(
                    "initialize handshake exceeded {:?}",
                    spec.startup_deadline
                ),
            })?
            .map_err(|e| ToolError::Startup {
                name: spec.name.clone(),
                detail: format!("initialize handshake failed: {e}"),
            })?;

        debug!(server = %spec.name, peer = ?service.peer_info(), "tool server ready");
        Ok(Self { service })
    }

    /// A cloneable handle for request dispatch.  Round-trips made through the
    /// sink do not borrow the connection, so the registry lock never spans a
    /// subprocess exchange.
    pub(crate) fn sink(&self) -> ServerSink {
        self.service.peer().clone()
    }

    /// Graceful shutdown bounded by the grace period; the subprocess is
    /// force-terminated on drop if it ignores the cancellation.
    pub(crate) async fn shutdown(self, grace_period: Duration) {
        if timeout(grace_period, self.service.cancel()).await.is_err() {
            warn!("tool server ignored shutdown; force-terminating");
        }
    }
}

/// Enumerate a server's tools through its sink, bounded by `deadline`.
pub(crate) async fn list_tools(
    sink: &ServerSink,
    deadline: Duration,
) -> Result<Vec<ToolDescriptor>, ToolError> {
    let tools = timeout(deadline, sink.list_all_tools())
        .await
        .map_err(|_| ToolError::Timeout(deadline))?
        .map_err(|e| ToolError::Transport(e.to_string()))?;

    Ok(tools
        .into_iter()
        .map(|t| ToolDescriptor {
            name: t.name.into_owned(),
            description: t.description.map(|d| d.into_owned()).unwrap_or_default(),
            input_schema: serde_json::Value::Object(t.input_schema.as_ref().clone()),
        })
        .collect())
}

/// Execute one tool call through a server sink, bounded by `deadline`.
pub(crate) async fn call_tool(
    sink: &ServerSink,
    tool_name: &str,
    args: serde_json::Value,
    deadline: Duration,
) -> Result<ToolCallResult, ToolError> {
    let arguments = match args {
        serde_json::Value::Object(map) => Some(map),
        serde_json::Value::Null => None,
        other => {
            return Err(ToolError::Protocol(format!(
                "tool arguments must be a JSON object, got: {other}"
            )))
        }
    };

    let mut request = CallToolRequestParam::new(tool_name.to_string());
    if let Some(arguments) = arguments {
        request = request.with_arguments(arguments);
    }

    let result = timeout(deadline, sink.call_tool(request))
        .await
        .map_err(|_| ToolError::Timeout(deadline))?
        .map_err(|e| ToolError::Transport(e.to_string()))?;

    let content = result
        .content
        .iter()
        .filter_map(|c| c.as_text().map(|t| t.text.clone()))
        .collect::<Vec<_>>()
        .join("\n");

    Ok(ToolCallResult {
        content,
        is_error: result.is_error.unwrap_or(false),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str) -> ToolServerConfig {
        ToolServerConfig {
            name: name.into(),
            command: "server-bin".into(),
            args: vec!["--stdio".into()],
            env: HashMap::new(),
        }
    }

    #[test]
    fn agent_scoped_spec_is_prefixed_with_agent_id() {
        let spec = ServerSpec::agent_scoped(
            "alice",
            &cfg("calc"),
            Duration::from_secs(2),
            Duration::from_secs(2),
        );
        assert_eq!(spec.name, "alice_calc");
        assert_eq!(spec.scope, ServerScope::Agent("alice".into()));
        assert_eq!(spec.command, "server-bin");
    }

    #[test]
    fn global_spec_keeps_base_name() {
        let spec = ServerSpec::global(&cfg("calc"), Duration::from_secs(2), Duration::from_secs(2));
        assert_eq!(spec.name, "calc");
        assert_eq!(spec.scope, ServerScope::Global);
    }

    #[test]
    fn two_agents_with_same_base_name_do_not_collide() {
        let a = ServerSpec::agent_scoped("a", &cfg("calc"), Duration::ZERO, Duration::ZERO);
        let b = ServerSpec::agent_scoped("b", &cfg("calc"), Duration::ZERO, Duration::ZERO);
        assert_ne!(a.name, b.name);
    }

    #[tokio::test]
    async fn spawn_of_missing_binary_fails_with_startup_error() {
        let spec = ServerSpec {
            name: "ghost".into(),
            scope: ServerScope::Global,
            command: "/nonexistent/parley-test-tool-server".into(),
            args: vec![],
            env: HashMap::new(),
            startup_deadline: Duration::from_millis(500),
            grace_period: Duration::from_millis(100),
        };
        let err = ServerConnection::spawn(&spec).await.err().unwrap();
        assert!(matches!(err, ToolError::Startup { name, .. } if name == "ghost"));
    }
}
