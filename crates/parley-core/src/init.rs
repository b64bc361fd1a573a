// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! One-shot conversation setup: scenario resolution, override application,
//! participant filtering, per-agent prompt rendering and state seeding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parley_config::{AgentConfig, Config, ScenarioConfig};
use parley_model::ModelProvider;
use parley_tools::ServerSpec;

use crate::error::CommandError;
use crate::message::Message;
use crate::state::{ConversationState, ScenarioSnapshot};
use crate::template::apply_template;

/// Used when the configuration does not provide a system prompt template.
pub const DEFAULT_SYSTEM_PROMPT_TEMPLATE: &str = "\
You are {{agent.display_name}}, a participant in a multi-agent conversation.

Persona:
{{agent.persona}}

Scenario: {{conversation.scenario_name}}
Goal: {{conversation.goal}}
Keep each reply {{conversation.brevity}}.
Participants: {{conversation.participating_agents}}.
Tools available to you: {{tools}}.

Stay in character and respond to the most recent message.";

/// Runtime overrides accepted by `start`.
#[derive(Debug, Clone, Default)]
pub struct StartOverrides {
    pub max_cycles: Option<u32>,
    pub starting_agent: Option<String>,
}

/// One participating agent, fully materialized for this conversation.
pub struct AgentRuntime {
    pub id: String,
    pub display_name: String,
    pub persona: String,
    pub system_prompt: String,
    pub thinking: bool,
    pub model: Arc<dyn ModelProvider>,
    pub metadata: serde_json::Value,
}

/// Builds model providers for participating agents.  The default wraps the
/// endpoint drivers; tests substitute scripted providers per agent.
pub type ModelFactory =
    Arc<dyn Fn(&AgentConfig) -> anyhow::Result<Arc<dyn ModelProvider>> + Send + Sync>;

pub fn default_model_factory() -> ModelFactory {
    Arc::new(|agent: &AgentConfig| {
        let provider = parley_model::from_endpoint(&agent.model)?;
        Ok(Arc::from(provider))
    })
}

/// Everything decided before any subprocess or network activity: the frozen
/// scenario, the opening message, and the agent-scoped servers to launch.
pub struct InitPlan {
    pub snapshot: ScenarioSnapshot,
    pub first_message: String,
    pub scoped_servers: Vec<ServerSpec>,
}

/// Resolve the scenario and freeze a [`ScenarioSnapshot`], applying runtime
/// overrides.  `config` must already be validated.
pub fn plan(
    config: &Config,
    scenario_name: Option<&str>,
    overrides: &StartOverrides,
) -> Result<InitPlan, CommandError> {
    let scenario = resolve_scenario(config, scenario_name)?;

    let participants: Vec<String> = config
        .participants(scenario)
        .into_iter()
        .map(str::to_string)
        .collect();

    let max_cycles = match overrides.max_cycles {
        Some(0) => {
            return Err(CommandError::InvalidOverride(
                "max_cycles must be at least 1".into(),
            ))
        }
        Some(n) => n,
        None => scenario.max_cycles,
    };

    let starting_agent = match &overrides.starting_agent {
        Some(agent) => {
            if !participants.iter().any(|p| p == agent) {
                return Err(CommandError::InvalidOverride(format!(
                    "starting agent {agent:?} is not a participant"
                )));
            }
            agent.clone()
        }
        None => scenario
            .starting_agent
            .clone()
            .unwrap_or_else(|| participants[0].clone()),
    };

    let first_message = config
        .first_message(scenario)
        .expect("validated config has an opening message")
        .to_string();

    let snapshot = ScenarioSnapshot {
        name: scenario.display_name().to_string(),
        goal: scenario.goal.clone(),
        brevity: scenario.brevity.clone(),
        max_cycles,
        starting_agent,
        participating_agents: participants.clone(),
        turn_timeout: Duration::from_secs(scenario.turn_timeout_secs),
        keyword_triggers: scenario.keyword_triggers.clone(),
        silence_threshold: scenario.silence_threshold,
    };

    let startup_deadline = Duration::from_millis(config.runtime.server_startup_deadline_ms);
    let grace = Duration::from_millis(config.runtime.server_grace_period_ms);
    let scoped_servers: Vec<ServerSpec> = participants
        .iter()
        .filter_map(|id| config.agent(id))
        .flat_map(|agent| {
            agent
                .tool_servers
                .iter()
                .map(|srv| ServerSpec::agent_scoped(&agent.id, srv, startup_deadline, grace))
        })
        .collect();

    Ok(InitPlan {
        snapshot,
        first_message,
        scoped_servers,
    })
}

fn resolve_scenario<'a>(
    config: &'a Config,
    name: Option<&str>,
) -> Result<&'a ScenarioConfig, CommandError> {
    let scenarios = config.scenarios();
    match name {
        Some(wanted) => scenarios
            .into_iter()
            .find(|s| s.display_name() == wanted)
            .ok_or_else(|| CommandError::UnknownScenario(wanted.to_string())),
        None => scenarios
            .into_iter()
            .next()
            .ok_or(CommandError::ConfigInvalid(
                parley_config::ConfigError::NoScenario,
            )),
    }
}

/// Materialize the participating agents: build each model provider and render
/// its system prompt.  `tools_by_agent` carries the tool names visible to
/// each agent, for the template's `{{tools}}` variable.
pub fn build_agents(
    config: &Config,
    snapshot: &ScenarioSnapshot,
    tools_by_agent: &HashMap<String, Vec<String>>,
    model_factory: &ModelFactory,
) -> Result<Vec<AgentRuntime>, CommandError> {
    let template = config
        .init
        .system_prompt_template
        .as_deref()
        .unwrap_or(DEFAULT_SYSTEM_PROMPT_TEMPLATE);

    let mut agents = Vec::with_capacity(snapshot.participating_agents.len());
    for id in &snapshot.participating_agents {
        let cfg = config
            .agent(id)
            .expect("validated config knows every participant");
        let tools = tools_by_agent.get(id).cloned().unwrap_or_default();
        let vars = template_vars(cfg, snapshot, &tools);
        let model = model_factory(cfg)?;
        agents.push(AgentRuntime {
            id: cfg.id.clone(),
            display_name: cfg.display_name().to_string(),
            persona: cfg.persona.clone(),
            system_prompt: apply_template(template, &vars),
            thinking: cfg.thinking,
            model,
            metadata: cfg.metadata.clone(),
        });
    }
    Ok(agents)
}

fn template_vars(
    agent: &AgentConfig,
    snapshot: &ScenarioSnapshot,
    tools: &[String],
) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("agent.name".into(), agent.id.clone());
    vars.insert("agent.display_name".into(), agent.display_name().to_string());
    vars.insert("agent.persona".into(), agent.persona.clone());
    vars.insert(
        "agent.metadata".into(),
        if agent.metadata.is_null() {
            String::new()
        } else {
            agent.metadata.to_string()
        },
    );
    vars.insert("conversation.scenario_name".into(), snapshot.name.clone());
    vars.insert(
        "conversation.goal".into(),
        snapshot.goal.clone().unwrap_or_default(),
    );
    vars.insert(
        "conversation.brevity".into(),
        snapshot
            .brevity
            .clone()
            .unwrap_or_else(|| "concise".into()),
    );
    vars.insert(
        "conversation.max_cycles".into(),
        snapshot.max_cycles.to_string(),
    );
    vars.insert(
        "conversation.participating_agents".into(),
        snapshot.participating_agents.join(", "),
    );
    vars.insert(
        "tools".into(),
        if tools.is_empty() {
            "none".into()
        } else {
            tools.join(", ")
        },
    );
    vars
}

/// Seed the conversation: the opening message enters the history as a human
/// turn attributed to the starting agent.
pub fn seed_state(snapshot: ScenarioSnapshot, first_message: &str) -> ConversationState {
    let starting_agent = snapshot.starting_agent.clone();
    let mut state = ConversationState::new(snapshot);
    state.push(Message::human(starting_agent, first_message));
    state
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parley_config::{InitConfig, ModelEndpoint, ToolServerConfig};

    fn agent(id: &str) -> AgentConfig {
        AgentConfig {
            id: id.into(),
            display_name: None,
            persona: format!("{id} persona"),
            thinking: false,
            model: ModelEndpoint {
                provider: "mock".into(),
                model: "mock-model".into(),
                base_url: None,
                api_key_env: None,
                api_key: None,
                temperature: None,
                max_tokens: None,
            },
            tool_servers: vec![],
            metadata: serde_json::Value::Null,
        }
    }

    fn config() -> Config {
        Config {
            agents: vec![agent("a"), agent("b")],
            conversation: Some(ScenarioConfig {
                name: Some("debate".into()),
                goal: Some("argue".into()),
                max_cycles: 4,
                ..ScenarioConfig::default()
            }),
            init: InitConfig {
                first_message: Some("begin".into()),
                system_prompt_template: None,
            },
            ..Config::default()
        }
    }

    #[test]
    fn plan_freezes_scenario_defaults() {
        let p = plan(&config(), None, &StartOverrides::default()).unwrap();
        assert_eq!(p.snapshot.name, "debate");
        assert_eq!(p.snapshot.max_cycles, 4);
        assert_eq!(p.snapshot.starting_agent, "a");
        assert_eq!(p.snapshot.participating_agents, vec!["a", "b"]);
        assert_eq!(p.first_message, "begin");
        assert!(p.scoped_servers.is_empty());
    }

    #[test]
    fn overrides_apply_after_validation() {
        let overrides = StartOverrides {
            max_cycles: Some(9),
            starting_agent: Some("b".into()),
        };
        let p = plan(&config(), None, &overrides).unwrap();
        assert_eq!(p.snapshot.max_cycles, 9);
        assert_eq!(p.snapshot.starting_agent, "b");
    }

    #[test]
    fn override_with_non_participant_is_rejected() {
        let overrides = StartOverrides {
            starting_agent: Some("ghost".into()),
            ..Default::default()
        };
        assert!(matches!(
            plan(&config(), None, &overrides),
            Err(CommandError::InvalidOverride(_))
        ));
    }

    #[test]
    fn zero_cycle_override_is_rejected() {
        let overrides = StartOverrides {
            max_cycles: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            plan(&config(), None, &overrides),
            Err(CommandError::InvalidOverride(_))
        ));
    }

    #[test]
    fn unknown_scenario_name_is_rejected() {
        assert!(matches!(
            plan(&config(), Some("nope"), &StartOverrides::default()),
            Err(CommandError::UnknownScenario(_))
        ));
    }

    #[test]
    fn named_scenario_is_selected() {
        let mut cfg = config();
        cfg.conversations = vec![
            ScenarioConfig {
                name: Some("first".into()),
                ..ScenarioConfig::default()
            },
            ScenarioConfig {
                name: Some("second".into()),
                max_cycles: 7,
                ..ScenarioConfig::default()
            },
        ];
        let p = plan(&cfg, Some("second"), &StartOverrides::default()).unwrap();
        assert_eq!(p.snapshot.name, "second");
        assert_eq!(p.snapshot.max_cycles, 7);
    }

    #[test]
    fn scoped_servers_are_planned_per_participant() {
        let mut cfg = config();
        cfg.agents[0].tool_servers.push(ToolServerConfig {
            name: "calc".into(),
            command: "calc-server".into(),
            args: vec![],
            env: Default::default(),
        });
        let p = plan(&cfg, None, &StartOverrides::default()).unwrap();
        assert_eq!(p.scoped_servers.len(), 1);
        assert_eq!(p.scoped_servers[0].name, "a_calc");
    }

    #[test]
    fn build_agents_renders_default_template() {
        let cfg = config();
        let p = plan(&cfg, None, &StartOverrides::default()).unwrap();
        let mut tools = HashMap::new();
        tools.insert("a".to_string(), vec!["echo".to_string()]);
        let agents =
            build_agents(&cfg, &p.snapshot, &tools, &default_model_factory()).unwrap();
        assert_eq!(agents.len(), 2);
        let a = &agents[0];
        assert_eq!(a.id, "a");
        assert!(a.system_prompt.contains("You are a"));
        assert!(a.system_prompt.contains("a persona"));
        assert!(a.system_prompt.contains("debate"));
        assert!(a.system_prompt.contains("echo"));
        // Agent b has no tools; the template shows "none".
        assert!(agents[1].system_prompt.contains("Tools available to you: none"));
    }

    #[test]
    fn custom_template_is_used_verbatim() {
        let mut cfg = config();
        cfg.init.system_prompt_template = Some("{{agent.name}} vs {{conversation.goal}}".into());
        let p = plan(&cfg, None, &StartOverrides::default()).unwrap();
        let agents =
            build_agents(&cfg, &p.snapshot, &HashMap::new(), &default_model_factory()).unwrap();
        assert_eq!(agents[0].system_prompt, "a vs argue");
    }

    #[test]
    fn seed_state_attributes_opening_to_starting_agent() {
        let p = plan(&config(), None, &StartOverrides::default()).unwrap();
        let state = seed_state(p.snapshot, &p.first_message);
        let msgs = state.messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].author, "a");
        assert_eq!(msgs[0].role, crate::message::Role::Human);
        assert_eq!(msgs[0].content, "begin");
        assert_eq!(state.next_agent, "a");
    }
}
