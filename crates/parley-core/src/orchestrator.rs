// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The conversation driver.
//!
//! One orchestrator owns one conversation at a time.  It holds the state
//! exclusively, schedules agents round-robin, runs each turn through the
//! executor, consults the cycle tracker after every turn, and reacts to
//! pause/resume/stop.  Commands arrive through `&mut self` methods; stop and
//! pause are additionally reachable mid-run through a cloneable
//! [`OrchestratorHandle`] whose signals the loop observes at its suspension
//! points.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parley_config::{Config, ModelEndpoint};
use parley_tools::{server_event_channel, ServerEvent, ServerEventReceiver, ToolRegistry};

use crate::cycle::TerminationReason;
use crate::error::CommandError;
use crate::events::{Event, EventSink, LifecycleKind};
use crate::init::{self, AgentRuntime, ModelFactory, StartOverrides};
use crate::state::{Phase, StatusSnapshot};
use crate::thought::ThoughtDelimiters;
use crate::turn::{run_turn, TurnConfig, TurnOutcome};

/// Result of a successful `start`.
#[derive(Debug, Clone, Serialize)]
pub struct StartInfo {
    pub conversation_id: String,
    pub participating_agents: Vec<String>,
    pub max_cycles: u32,
}

/// Result of a `continue` invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ContinueInfo {
    pub current_cycle: u32,
    pub terminated: bool,
    pub termination_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioDescriptor {
    pub name: String,
    pub max_cycles: u32,
    pub participating_agents: Vec<String>,
    pub is_default: bool,
}

/// Outcome of a minimal endpoint probe.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointCheck {
    pub ok: bool,
    pub detail: String,
}

/// Cooperative pause flag shared between the command surface and the run
/// loop.  The current turn always completes; the loop parks before starting
/// the next one.
struct PauseGate {
    tx: watch::Sender<bool>,
}

impl PauseGate {
    fn new() -> Self {
        Self {
            tx: watch::channel(false).0,
        }
    }
    fn pause(&self) {
        self.tx.send_replace(true);
    }
    fn resume(&self) {
        self.tx.send_replace(false);
    }
    fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }
    async fn wait_resumed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

/// Signals for an in-flight conversation: usable from any task while the
/// owner drives the run loop.  Bound to the conversation current at the time
/// of [`Orchestrator::handle`]; take a fresh handle after each `start`.
#[derive(Clone)]
pub struct OrchestratorHandle {
    cancel: CancellationToken,
    pause: Arc<PauseGate>,
    sink: Arc<EventSink>,
}

impl OrchestratorHandle {
    /// Request termination.  In-flight model streams and tool calls unwind at
    /// the next await point; the run loop publishes the ended lifecycle.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn pause(&self) {
        self.pause.pause();
        self.sink.publish(Event::Lifecycle {
            kind: LifecycleKind::Paused,
            detail: String::new(),
        });
    }

    pub fn resume(&self) {
        self.pause.resume();
        self.sink.publish(Event::Lifecycle {
            kind: LifecycleKind::Resumed,
            detail: String::new(),
        });
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    sink: Arc<EventSink>,
    tools: Arc<ToolRegistry>,
    server_events: ServerEventReceiver,
    model_factory: ModelFactory,
    delims: Arc<ThoughtDelimiters>,
    state: Option<crate::state::ConversationState>,
    agents: Vec<AgentRuntime>,
    display_names: HashMap<String, String>,
    /// Servers started for the current conversation; stopped on its end.
    scoped_server_names: Vec<String>,
    cancel: CancellationToken,
    pause: Arc<PauseGate>,
    health_task: JoinHandle<()>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_model_factory(config, init::default_model_factory())
    }

    /// Construction seam for tests: scripted providers replace live
    /// endpoints while everything else runs the real pipeline.
    pub fn with_model_factory(config: Arc<Config>, model_factory: ModelFactory) -> Self {
        let sink = Arc::new(EventSink::new(config.runtime.event_queue_capacity));
        let (tx, server_events) = server_event_channel();
        let tools = Arc::new(ToolRegistry::new(tx));
        let health_task =
            tools.spawn_health_monitor(Duration::from_secs(config.runtime.health_interval_secs));
        Self {
            config,
            sink,
            tools,
            server_events,
            model_factory,
            delims: Arc::new(ThoughtDelimiters::default()),
            state: None,
            agents: Vec::new(),
            display_names: HashMap::new(),
            scoped_server_names: Vec::new(),
            cancel: CancellationToken::new(),
            pause: Arc::new(PauseGate::new()),
            health_task,
        }
    }

    pub fn sink(&self) -> &Arc<EventSink> {
        &self.sink
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Signals for the current conversation.
    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            cancel: self.cancel.clone(),
            pause: Arc::clone(&self.pause),
            sink: Arc::clone(&self.sink),
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.as_ref().map(|s| s.phase).unwrap_or(Phase::Idle)
    }

    /// Launch the host-wide (global) tool servers from configuration.
    /// Startup failures are advisory: the server stays stopped and agents
    /// simply see fewer tools.
    pub async fn start_global_servers(&mut self) {
        let startup = Duration::from_millis(self.config.runtime.server_startup_deadline_ms);
        let grace = Duration::from_millis(self.config.runtime.server_grace_period_ms);
        for cfg in &self.config.tool_servers {
            let spec = parley_tools::ServerSpec::global(cfg, startup, grace);
            if let Err(e) = self.tools.start(spec).await {
                warn!(server = %cfg.name, error = %e, "global tool server failed to start");
            }
        }
        self.drain_server_events();
    }

    /// Build a fresh conversation and enter `running`.
    pub async fn start(
        &mut self,
        scenario: Option<&str>,
        overrides: StartOverrides,
    ) -> Result<StartInfo, CommandError> {
        if matches!(self.phase(), Phase::Running | Phase::Paused) {
            return Err(CommandError::AlreadyRunning);
        }
        self.config.validate()?;

        let plan = init::plan(&self.config, scenario, &overrides)?;

        // Fresh signal set for the new conversation.
        self.cancel = CancellationToken::new();
        self.pause = Arc::new(PauseGate::new());

        // Agent-scoped servers come up before prompts are rendered so the
        // template's tool list reflects what each agent can actually call.
        self.scoped_server_names.clear();
        for spec in plan.scoped_servers.clone() {
            let name = spec.name.clone();
            match self.tools.start(spec).await {
                Ok(_) => self.scoped_server_names.push(name),
                Err(e) => warn!(server = %name, error = %e, "agent-scoped tool server failed to start"),
            }
        }
        self.drain_server_events();

        let mut tools_by_agent: HashMap<String, Vec<String>> = HashMap::new();
        for id in &plan.snapshot.participating_agents {
            let mut names: Vec<String> = self
                .tools
                .tools_for_agent(id)
                .await
                .iter()
                .flat_map(|h| h.tools.iter().map(|t| t.name.clone()))
                .collect();
            names.sort();
            names.dedup();
            tools_by_agent.insert(id.clone(), names);
        }

        let agents = init::build_agents(
            &self.config,
            &plan.snapshot,
            &tools_by_agent,
            &self.model_factory,
        )?;
        self.display_names = agents
            .iter()
            .map(|a| (a.id.clone(), a.display_name.clone()))
            .collect();

        let mut state = init::seed_state(plan.snapshot, &plan.first_message);
        state.phase = Phase::Running;
        let info = StartInfo {
            conversation_id: state.id.clone(),
            participating_agents: state.scenario.participating_agents.clone(),
            max_cycles: state.scenario.max_cycles,
        };
        debug!(conversation = %info.conversation_id, scenario = %state.scenario.name, "conversation started");
        self.sink.publish(Event::Lifecycle {
            kind: LifecycleKind::Started,
            detail: state.scenario.name.clone(),
        });

        self.state = Some(state);
        self.agents = agents;
        Ok(info)
    }

    /// Drive the run loop for up to `cycles` completed cycles (unbounded when
    /// `None`) or until the conversation terminates.
    pub async fn run(&mut self, cycles: Option<u32>) -> Result<ContinueInfo, CommandError> {
        if !matches!(self.phase(), Phase::Running | Phase::Paused) {
            return Err(CommandError::NotRunning);
        }

        let turn_cfg = TurnConfig {
            max_tool_iterations: self.config.runtime.max_tool_iterations,
            tool_call_timeout: Duration::from_secs(self.config.runtime.tool_call_timeout_secs),
        };
        let silence_cutoff = self.config.runtime.silence_len_cutoff;
        let mut completed_cycles = 0u32;

        loop {
            self.drain_server_events();

            if self.cancel.is_cancelled() {
                self.finish_run(TerminationReason::Stopped).await;
                break;
            }

            if self.pause.is_paused() {
                if let Some(st) = self.state.as_mut() {
                    st.phase = Phase::Paused;
                }
                let cancel = self.cancel.clone();
                let pause = Arc::clone(&self.pause);
                let cancelled = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => true,
                    _ = pause.wait_resumed() => false,
                };
                if cancelled {
                    self.finish_run(TerminationReason::Stopped).await;
                    break;
                }
                if let Some(st) = self.state.as_mut() {
                    st.phase = Phase::Running;
                }
            }

            let outcome = {
                let state = self.state.as_mut().ok_or(CommandError::NotRunning)?;
                let agent = self
                    .agents
                    .iter()
                    .find(|a| a.id == state.next_agent)
                    .expect("next agent is always a participant");
                run_turn(
                    agent,
                    &self.display_names,
                    state,
                    &self.sink,
                    self.tools.as_ref(),
                    &self.delims,
                    &turn_cfg,
                    &self.cancel,
                )
                .await
            };

            match outcome {
                TurnOutcome::Cancelled => {
                    self.finish_run(TerminationReason::Stopped).await;
                    break;
                }
                TurnOutcome::Fatal(_) => {
                    self.finish_run(TerminationReason::AgentError).await;
                    break;
                }
                TurnOutcome::Completed {
                    final_content,
                    cycle_completed,
                    ..
                } => {
                    let termination = {
                        let state = self.state.as_mut().expect("state exists inside run loop");
                        let termination = state.cycle.check_termination(
                            &state.scenario,
                            &final_content,
                            silence_cutoff,
                        );
                        if termination.is_none() {
                            state.advance_next_agent();
                        }
                        termination
                    };
                    if cycle_completed {
                        completed_cycles += 1;
                        let state = self.state.as_ref().expect("state exists inside run loop");
                        self.sink.publish(Event::CycleUpdate {
                            cycle: state.cycle.current_cycle(),
                            participating: state.scenario.participating_agents.clone(),
                        });
                    }
                    if let Some(reason) = termination {
                        self.finish_run(reason).await;
                        break;
                    }
                    if let Some(limit) = cycles {
                        if completed_cycles >= limit {
                            break;
                        }
                    }
                }
            }
        }

        let status = self.status();
        Ok(ContinueInfo {
            current_cycle: status.current_cycle,
            terminated: matches!(status.phase, Phase::Terminated),
            termination_reason: status.termination.map(|t| t.reason.to_string()),
        })
    }

    pub fn pause(&mut self) -> Result<Phase, CommandError> {
        match self.phase() {
            Phase::Running => {
                self.pause.pause();
                if let Some(st) = self.state.as_mut() {
                    st.phase = Phase::Paused;
                }
                self.sink.publish(Event::Lifecycle {
                    kind: LifecycleKind::Paused,
                    detail: String::new(),
                });
                Ok(Phase::Paused)
            }
            Phase::Paused => Ok(Phase::Paused),
            _ => Err(CommandError::NotRunning),
        }
    }

    pub fn resume(&mut self) -> Result<Phase, CommandError> {
        match self.phase() {
            Phase::Paused => {
                self.pause.resume();
                if let Some(st) = self.state.as_mut() {
                    st.phase = Phase::Running;
                }
                self.sink.publish(Event::Lifecycle {
                    kind: LifecycleKind::Resumed,
                    detail: String::new(),
                });
                Ok(Phase::Running)
            }
            Phase::Running => Ok(Phase::Running),
            _ => Err(CommandError::NotRunning),
        }
    }

    /// Terminate the conversation.  Idempotent once terminated.
    pub async fn stop(&mut self) -> Result<Phase, CommandError> {
        if self.state.is_none() {
            return Err(CommandError::NotRunning);
        }
        self.cancel.cancel();
        self.pause.resume();
        self.finish_run(TerminationReason::Stopped).await;
        Ok(Phase::Terminated)
    }

    pub fn status(&self) -> StatusSnapshot {
        match &self.state {
            Some(st) => st.status(),
            None => StatusSnapshot {
                phase: Phase::Idle,
                current_cycle: 0,
                message_count: 0,
                next_agent: None,
                termination: None,
            },
        }
    }

    /// A snapshot of the full history, for exports and status displays.
    pub fn transcript(&self) -> Vec<crate::message::Message> {
        self.state
            .as_ref()
            .map(|s| s.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn list_scenarios(&self) -> Vec<ScenarioDescriptor> {
        self.config
            .scenarios()
            .into_iter()
            .enumerate()
            .map(|(i, sc)| ScenarioDescriptor {
                name: sc.display_name().to_string(),
                max_cycles: sc.max_cycles,
                participating_agents: self
                    .config
                    .participants(sc)
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                is_default: i == 0,
            })
            .collect()
    }

    async fn finish_run(&mut self, reason: TerminationReason) {
        let already_terminated = self
            .state
            .as_ref()
            .map(|s| s.phase == Phase::Terminated)
            .unwrap_or(true);
        if let Some(st) = self.state.as_mut() {
            st.terminate(reason.clone());
        }
        if !already_terminated {
            debug!(reason = %reason, "conversation ended");
            self.sink.publish(Event::Lifecycle {
                kind: LifecycleKind::Ended,
                detail: reason.to_string(),
            });
        }
        for name in std::mem::take(&mut self.scoped_server_names) {
            let _ = self.tools.stop(&name).await;
        }
        self.drain_server_events();
    }

    /// Translate registry notifications into observer events.
    fn drain_server_events(&mut self) {
        while let Ok(ev) = self.server_events.try_recv() {
            let event = match ev {
                ServerEvent::Ready { server, tool_count } => Event::Lifecycle {
                    kind: LifecycleKind::Started,
                    detail: format!("tool server {server} ready ({tool_count} tools)"),
                },
                ServerEvent::Unhealthy { server, detail } => Event::Error {
                    kind: "tool_server_unhealthy".into(),
                    agent_id: None,
                    message: format!("{server}: {detail}"),
                },
                ServerEvent::Recovered { server } => Event::Lifecycle {
                    kind: LifecycleKind::Resumed,
                    detail: format!("tool server {server} recovered"),
                },
                ServerEvent::Stopped { server } => Event::Lifecycle {
                    kind: LifecycleKind::Stopped,
                    detail: format!("tool server {server} stopped"),
                },
            };
            self.sink.publish(event);
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.health_task.abort();
    }
}

/// Minimal endpoint probe behind the `check-endpoint` command: construct the
/// driver and list the endpoint's models.
pub async fn test_model_endpoint(endpoint: &ModelEndpoint) -> EndpointCheck {
    let provider = match parley_model::from_endpoint(endpoint) {
        Ok(p) => p,
        Err(e) => {
            return EndpointCheck {
                ok: false,
                detail: e.to_string(),
            }
        }
    };
    match provider.list_models().await {
        Ok(models) => EndpointCheck {
            ok: true,
            detail: format!("{} models: {}", models.len(), models.join(", ")),
        },
        Err(e) => EndpointCheck {
            ok: false,
            detail: e.to_string(),
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
