// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_max_cycles() -> u32 {
    5
}
fn default_turn_timeout_secs() -> u64 {
    120
}
fn default_max_tool_iterations() -> u32 {
    8
}
fn default_tool_call_timeout_secs() -> u64 {
    30
}
fn default_server_startup_deadline_ms() -> u64 {
    2_000
}
fn default_server_grace_period_ms() -> u64 {
    2_000
}
fn default_health_interval_secs() -> u64 {
    10
}
fn default_cancellation_grace_ms() -> u64 {
    500
}
fn default_silence_len_cutoff() -> usize {
    20
}
fn default_event_queue_capacity() -> usize {
    256
}

/// Validation failures raised by [`Config::validate`].
///
/// These reject a `start` before any conversation state is built; they are
/// never produced mid-run.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("at least two agents are required, found {0}")]
    TooFewAgents(usize),
    #[error("duplicate agent id: {0:?}")]
    DuplicateAgentId(String),
    #[error("no scenario defined: add a `conversation` block or a `conversations` list")]
    NoScenario,
    #[error("scenario {scenario:?} names unknown agent {agent:?}")]
    UnknownAgent { scenario: String, agent: String },
    #[error("scenario {0:?} needs at least two participating agents")]
    TooFewParticipants(String),
    #[error("scenario {scenario:?}: starting agent {agent:?} is not a participant")]
    StartingAgentNotParticipant { scenario: String, agent: String },
    #[error("scenario {0:?}: max_cycles must be at least 1")]
    ZeroCycles(String),
    #[error("scenario {0:?} has no opening message (set `first_message` on the scenario or under `init`)")]
    MissingFirstMessage(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Configured agents.  At least two are required.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    /// Legacy single-scenario shape.  Ignored when `conversations` is
    /// non-empty; otherwise treated as one anonymous scenario.
    #[serde(default)]
    pub conversation: Option<ScenarioConfig>,
    /// Multi-scenario shape.  Takes precedence over `conversation` when both
    /// are present.
    #[serde(default)]
    pub conversations: Vec<ScenarioConfig>,
    #[serde(default)]
    pub init: InitConfig,
    /// Globally scoped tool servers, shared by every agent.
    #[serde(default)]
    pub tool_servers: Vec<ToolServerConfig>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Config {
    /// The effective scenario list: `conversations` when non-empty, else the
    /// legacy `conversation` block as a single anonymous scenario.
    pub fn scenarios(&self) -> Vec<&ScenarioConfig> {
        if !self.conversations.is_empty() {
            self.conversations.iter().collect()
        } else {
            self.conversation.iter().collect()
        }
    }

    pub fn agent(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Resolve the agents participating in `scenario`: the explicit
    /// `agents_involved` list when given, otherwise all configured agents.
    pub fn participants<'a>(&'a self, scenario: &'a ScenarioConfig) -> Vec<&'a str> {
        if scenario.agents_involved.is_empty() {
            self.agents.iter().map(|a| a.id.as_str()).collect()
        } else {
            scenario.agents_involved.iter().map(String::as_str).collect()
        }
    }

    /// The opening message for `scenario`: per-scenario override first, then
    /// the global `init.first_message`.
    pub fn first_message<'a>(&'a self, scenario: &'a ScenarioConfig) -> Option<&'a str> {
        scenario
            .first_message
            .as_deref()
            .or(self.init.first_message.as_deref())
    }

    /// Structural validation.  Called by the host before `start`; the core
    /// assumes a validated configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.len() < 2 {
            return Err(ConfigError::TooFewAgents(self.agents.len()));
        }
        let mut seen = std::collections::HashSet::new();
        for a in &self.agents {
            if !seen.insert(a.id.as_str()) {
                return Err(ConfigError::DuplicateAgentId(a.id.clone()));
            }
        }

        let scenarios = self.scenarios();
        if scenarios.is_empty() {
            return Err(ConfigError::NoScenario);
        }

        for sc in scenarios {
            let label = sc.display_name().to_string();
            if sc.max_cycles == 0 {
                return Err(ConfigError::ZeroCycles(label));
            }
            for agent in &sc.agents_involved {
                if self.agent(agent).is_none() {
                    return Err(ConfigError::UnknownAgent {
                        scenario: label,
                        agent: agent.clone(),
                    });
                }
            }
            let participants = self.participants(sc);
            if participants.len() < 2 {
                return Err(ConfigError::TooFewParticipants(label));
            }
            if let Some(start) = &sc.starting_agent {
                if !participants.contains(&start.as_str()) {
                    return Err(ConfigError::StartingAgentNotParticipant {
                        scenario: label,
                        agent: start.clone(),
                    });
                }
            }
            if self.first_message(sc).is_none() {
                return Err(ConfigError::MissingFirstMessage(label));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable identifier used in scenario references and event attribution.
    pub id: String,
    /// Human-facing name shown to observers.  Defaults to `id`.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Persona text injected into the system prompt template.
    #[serde(default)]
    pub persona: String,
    /// When true, delimited thinking regions in this agent's output are
    /// streamed to observers as thoughts; when false they are stripped.
    #[serde(default)]
    pub thinking: bool,
    pub model: ModelEndpoint,
    /// Tool servers scoped to this agent only.
    #[serde(default)]
    pub tool_servers: Vec<ToolServerConfig>,
    /// Opaque extras forwarded to the prompt template; never interpreted.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AgentConfig {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

/// A chat model endpoint specification.
///
/// `provider` selects the driver; "openai" covers every OpenAI-compatible
/// server (Ollama, vLLM, llama.cpp, gateways).  "mock" is the deterministic
/// test driver and needs no network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEndpoint {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model name forwarded to the endpoint.
    pub model: String,
    /// API base ending before `/chat/completions`.  Required for local or
    /// custom servers; hosted providers get a static default.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key (read at runtime).
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer `api_key_env` in version-controlled files.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_provider() -> String {
    "openai".into()
}

/// A named bundle of participants, termination rules, and pacing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// Free-text objective surfaced to the agents via the prompt template.
    #[serde(default)]
    pub goal: Option<String>,
    /// Pacing hint ("one sentence", "a short paragraph", ...).
    #[serde(default)]
    pub brevity: Option<String>,
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Defaults to the first participating agent.
    #[serde(default)]
    pub starting_agent: Option<String>,
    /// Participating subset; empty means all configured agents.
    #[serde(default)]
    pub agents_involved: Vec<String>,
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
    /// Case-insensitive substrings that end the conversation when they occur
    /// in an agent's final message.
    #[serde(default)]
    pub keyword_triggers: Vec<String>,
    /// End after this many consecutive cycles of near-empty messages.
    #[serde(default)]
    pub silence_threshold: Option<u32>,
    /// Per-scenario opening message; overrides `init.first_message`.
    #[serde(default)]
    pub first_message: Option<String>,
}

impl ScenarioConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("default")
    }
}

// Manual impl so in-code construction gets the same defaults as a config
// file with the fields omitted.
impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            name: None,
            goal: None,
            brevity: None,
            max_cycles: default_max_cycles(),
            starting_agent: None,
            agents_involved: vec![],
            turn_timeout_secs: default_turn_timeout_secs(),
            keyword_triggers: vec![],
            silence_threshold: None,
            first_message: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitConfig {
    /// Opening message seeded into the conversation, attributed to the
    /// starting agent.
    #[serde(default)]
    pub first_message: Option<String>,
    /// System prompt template rendered per agent with `{{key}}` placeholders.
    /// A built-in default is used when omitted.
    #[serde(default)]
    pub system_prompt_template: Option<String>,
}

/// Spec for one external tool-server subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Operational tunables with conservative defaults.  None of these are
/// required in a config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Upper bound on model→tool→model round-trips within one turn.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
    #[serde(default = "default_tool_call_timeout_secs")]
    pub tool_call_timeout_secs: u64,
    /// Deadline for a tool server's initialize handshake.
    #[serde(default = "default_server_startup_deadline_ms")]
    pub server_startup_deadline_ms: u64,
    /// Time a stopping server gets to shut down before force-termination.
    #[serde(default = "default_server_grace_period_ms")]
    pub server_grace_period_ms: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    /// How quickly in-flight awaits must observe a stop signal.
    #[serde(default = "default_cancellation_grace_ms")]
    pub cancellation_grace_ms: u64,
    /// Trimmed-length cutoff below which a message counts as silence.
    #[serde(default = "default_silence_len_cutoff")]
    pub silence_len_cutoff: usize,
    /// Per-subscriber event queue depth; oldest events drop on overflow.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_max_tool_iterations(),
            tool_call_timeout_secs: default_tool_call_timeout_secs(),
            server_startup_deadline_ms: default_server_startup_deadline_ms(),
            server_grace_period_ms: default_server_grace_period_ms(),
            health_interval_secs: default_health_interval_secs(),
            cancellation_grace_ms: default_cancellation_grace_ms(),
            silence_len_cutoff: default_silence_len_cutoff(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
