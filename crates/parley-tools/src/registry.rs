// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Registry of tool servers with per-agent routing and health monitoring.
//!
//! The registry owns every running server subprocess.  The internal map is
//! guarded by an async mutex held only for bookkeeping: dispatching a call
//! resolves the owning server and clones its sink under the lock, then
//! performs the subprocess round-trip without it, so one slow tool cannot
//! stall registration, health probes, or other agents' calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ToolError;
use crate::events::{ServerEvent, ServerEventSender};
use crate::server::{
    call_tool, list_tools, ServerConnection, ServerScope, ServerSpec, ServerStatus, ToolCallResult,
    ToolDescriptor,
};

/// Health probes back off exponentially after consecutive failures, capped
/// here; once the failure count reaches [`MAX_HEALTH_FAILURES`] the server is
/// left `unhealthy` until an explicit restart.
const HEALTH_BACKOFF_CAP: Duration = Duration::from_secs(60);
const MAX_HEALTH_FAILURES: u32 = 6;
/// Deadline for the lightweight list-tools health probe.
const HEALTH_PROBE_DEADLINE: Duration = Duration::from_secs(5);

struct ServerEntry {
    spec: ServerSpec,
    status: ServerStatus,
    last_health_check: Option<DateTime<Utc>>,
    tools: Vec<ToolDescriptor>,
    conn: Option<ServerConnection>,
    consecutive_failures: u32,
    next_probe_after: Option<DateTime<Utc>>,
}

/// The set of tools one server exposes to one agent.
#[derive(Debug, Clone, Serialize)]
pub struct ToolHandle {
    pub server: String,
    pub scope: ServerScope,
    pub tools: Vec<ToolDescriptor>,
}

/// Point-in-time description of one server, for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub scope: ServerScope,
    pub status: ServerStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub tool_names: Vec<String>,
}

pub struct ToolRegistry {
    servers: Mutex<HashMap<String, ServerEntry>>,
    events: ServerEventSender,
}

impl ToolRegistry {
    pub fn new(events: ServerEventSender) -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Spawn a server from its spec, run the handshake, and enumerate its
    /// tools.  On failure the server is recorded as `stopped` and excluded
    /// from routing; tool availability is advisory, so the caller surfaces a
    /// warning rather than aborting.
    pub async fn start(&self, spec: ServerSpec) -> Result<ToolHandle, ToolError> {
        let name = spec.name.clone();
        {
            let mut map = self.servers.lock().await;
            map.insert(
                name.clone(),
                ServerEntry {
                    spec: spec.clone(),
                    status: ServerStatus::Starting,
                    last_health_check: None,
                    tools: vec![],
                    conn: None,
                    consecutive_failures: 0,
                    next_probe_after: None,
                },
            );
        }

        // Handshake and enumeration happen outside the map lock.
        let startup = async {
            let conn = ServerConnection::spawn(&spec).await?;
            let tools = list_tools(&conn.sink(), spec.startup_deadline).await?;
            Ok::<_, ToolError>((conn, tools))
        }
        .await;

        let mut map = self.servers.lock().await;
        let entry = map
            .get_mut(&name)
            .ok_or_else(|| ToolError::UnknownServer(name.clone()))?;
        match startup {
            Ok((conn, tools)) => {
                debug!(server = %name, tools = tools.len(), "tool server started");
                entry.status = ServerStatus::Ready;
                entry.tools = tools.clone();
                entry.conn = Some(conn);
                entry.last_health_check = Some(Utc::now());
                let _ = self.events.send(ServerEvent::Ready {
                    server: name.clone(),
                    tool_count: tools.len(),
                });
                Ok(ToolHandle {
                    server: name,
                    scope: spec.scope,
                    tools,
                })
            }
            Err(e) => {
                warn!(server = %name, error = %e, "tool server failed to start");
                entry.status = ServerStatus::Stopped;
                Err(e)
            }
        }
    }

    /// Gracefully stop a server and remove it from the registry.
    pub async fn stop(&self, name: &str) -> Result<(), ToolError> {
        let entry = {
            let mut map = self.servers.lock().await;
            map.remove(name)
                .ok_or_else(|| ToolError::UnknownServer(name.to_string()))?
        };
        if let Some(conn) = entry.conn {
            conn.shutdown(entry.spec.grace_period).await;
        }
        let _ = self.events.send(ServerEvent::Stopped {
            server: name.to_string(),
        });
        Ok(())
    }

    /// Stop then start with the original spec.  Also the recovery path for a
    /// server the health monitor has given up on.
    pub async fn restart(&self, name: &str) -> Result<ToolHandle, ToolError> {
        let spec = {
            let map = self.servers.lock().await;
            map.get(name)
                .map(|e| e.spec.clone())
                .ok_or_else(|| ToolError::UnknownServer(name.to_string()))?
        };
        self.stop(name).await?;
        self.start(spec).await
    }

    /// Stop every server.  Called on conversation end and process shutdown.
    pub async fn stop_all(&self) {
        let names: Vec<String> = {
            let map = self.servers.lock().await;
            map.keys().cloned().collect()
        };
        for name in names {
            let _ = self.stop(&name).await;
        }
    }

    /// The tool handles visible to `agent_id`: every ready global server plus
    /// the servers scoped to that agent.
    pub async fn tools_for_agent(&self, agent_id: &str) -> Vec<ToolHandle> {
        let map = self.servers.lock().await;
        let mut handles: Vec<ToolHandle> = map
            .values()
            .filter(|e| e.status == ServerStatus::Ready && visible_to(&e.spec.scope, agent_id))
            .map(|e| ToolHandle {
                server: e.spec.name.clone(),
                scope: e.spec.scope.clone(),
                tools: e.tools.clone(),
            })
            .collect();
        handles.sort_by(|a, b| a.server.cmp(&b.server));
        handles
    }

    /// Route a tool call to the owning server and execute it under `deadline`.
    ///
    /// Name collisions between a global and an agent-scoped server resolve in
    /// favour of the agent-scoped one.
    pub async fn call(
        &self,
        agent_id: &str,
        tool_name: &str,
        args: serde_json::Value,
        deadline: Duration,
    ) -> Result<ToolCallResult, ToolError> {
        let sink = {
            let map = self.servers.lock().await;
            let owner = resolve_owner(&map, agent_id, tool_name)
                .ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;
            let entry = &map[&owner];
            match &entry.conn {
                Some(conn) => conn.sink(),
                None => return Err(ToolError::NotReady(owner)),
            }
        };
        // The subprocess round-trip runs without the registry lock.
        call_tool(&sink, tool_name, args, deadline).await
    }

    /// Current descriptors for every registered server.
    pub async fn statuses(&self) -> Vec<ServerDescriptor> {
        let map = self.servers.lock().await;
        let mut out: Vec<ServerDescriptor> = map
            .values()
            .map(|e| ServerDescriptor {
                name: e.spec.name.clone(),
                scope: e.spec.scope.clone(),
                status: e.status,
                last_health_check: e.last_health_check,
                tool_names: e.tools.iter().map(|t| t.name.clone()).collect(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Spawn the periodic health monitor.  Probes every `ready` server with a
    /// lightweight list-tools request; failures mark the server `unhealthy`
    /// and back off exponentially, leaving it `unhealthy` after the retry cap
    /// until an explicit restart.  The task holds the registry lock only to
    /// snapshot sinks and to write results, never across a probe.
    pub fn spawn_health_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.probe_all().await;
            }
        })
    }

    async fn probe_all(&self) {
        let now = Utc::now();
        // Snapshot (name, sink) pairs of servers due for a probe.
        let due: Vec<(String, rmcp::service::ServerSink)> = {
            let map = self.servers.lock().await;
            map.values()
                .filter(|e| match e.status {
                    ServerStatus::Ready => true,
                    ServerStatus::Unhealthy => {
                        e.consecutive_failures < MAX_HEALTH_FAILURES
                            && e.next_probe_after.map(|t| now >= t).unwrap_or(true)
                    }
                    _ => false,
                })
                .filter_map(|e| e.conn.as_ref().map(|c| (e.spec.name.clone(), c.sink())))
                .collect()
        };

        for (name, sink) in due {
            let result = list_tools(&sink, HEALTH_PROBE_DEADLINE).await;
            let mut map = self.servers.lock().await;
            let entry = match map.get_mut(&name) {
                Some(e) => e,
                None => continue, // stopped while probing
            };
            entry.last_health_check = Some(Utc::now());
            match result {
                Ok(tools) => {
                    if entry.status == ServerStatus::Unhealthy {
                        debug!(server = %name, "tool server recovered");
                        let _ = self.events.send(ServerEvent::Recovered { server: name });
                    }
                    entry.status = ServerStatus::Ready;
                    entry.tools = tools;
                    entry.consecutive_failures = 0;
                    entry.next_probe_after = None;
                }
                Err(e) => {
                    entry.consecutive_failures += 1;
                    let backoff = health_backoff(entry.consecutive_failures);
                    entry.next_probe_after = Some(
                        Utc::now()
                            + chrono::Duration::from_std(backoff)
                                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                    );
                    if entry.status == ServerStatus::Ready {
                        warn!(server = %name, error = %e, "tool server unhealthy");
                        let _ = self.events.send(ServerEvent::Unhealthy {
                            server: name,
                            detail: e.to_string(),
                        });
                    }
                    entry.status = ServerStatus::Unhealthy;
                }
            }
        }
    }
}

fn visible_to(scope: &ServerScope, agent_id: &str) -> bool {
    match scope {
        ServerScope::Global => true,
        ServerScope::Agent(owner) => owner == agent_id,
    }
}

/// Find the server owning `tool_name` from `agent_id`'s point of view.
/// Agent-scoped servers shadow global ones; the shadowing is logged once at
/// resolution time.
fn resolve_owner(
    map: &HashMap<String, ServerEntry>,
    agent_id: &str,
    tool_name: &str,
) -> Option<String> {
    let mut global_owner: Option<&str> = None;
    let mut agent_owner: Option<&str> = None;
    for entry in map.values() {
        if entry.status != ServerStatus::Ready {
            continue;
        }
        if !entry.tools.iter().any(|t| t.name == tool_name) {
            continue;
        }
        match &entry.spec.scope {
            ServerScope::Global => global_owner = Some(&entry.spec.name),
            ServerScope::Agent(owner) if owner == agent_id => agent_owner = Some(&entry.spec.name),
            ServerScope::Agent(_) => {}
        }
    }
    if let (Some(a), Some(g)) = (agent_owner, global_owner) {
        warn!(
            tool = tool_name,
            agent_server = a,
            global_server = g,
            "tool name provided by both scopes; agent-scoped server wins"
        );
    }
    agent_owner.or(global_owner).map(str::to_string)
}

/// Exponential backoff: 2^(n-1) seconds, capped.
fn health_backoff(failures: u32) -> Duration {
    let secs = 1u64 << failures.saturating_sub(1).min(10);
    Duration::from_secs(secs).min(HEALTH_BACKOFF_CAP)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
