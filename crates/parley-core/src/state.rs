// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::cycle::{CycleTracker, TerminationReason};
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Running,
    Paused,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Termination {
    pub reason: TerminationReason,
    pub at_cycle: u32,
}

/// Scenario parameters frozen at conversation start.  Runtime overrides
/// (max_cycles, starting_agent) are applied before freezing; later config
/// edits never affect a running conversation.
#[derive(Debug, Clone)]
pub struct ScenarioSnapshot {
    pub name: String,
    pub goal: Option<String>,
    pub brevity: Option<String>,
    pub max_cycles: u32,
    pub starting_agent: String,
    pub participating_agents: Vec<String>,
    pub turn_timeout: Duration,
    pub keyword_triggers: Vec<String>,
    pub silence_threshold: Option<u32>,
}

/// Point-in-time view answered by the `status` command.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub current_cycle: u32,
    pub message_count: usize,
    pub next_agent: Option<String>,
    pub termination: Option<Termination>,
}

/// The conversation state, owned exclusively by the orchestrator.  All
/// mutation goes through it; external readers get snapshot copies.
#[derive(Debug)]
pub struct ConversationState {
    pub id: String,
    messages: Vec<Message>,
    pub next_agent: String,
    pub phase: Phase,
    pub termination: Option<Termination>,
    pub scenario: ScenarioSnapshot,
    pub cycle: CycleTracker,
}

impl ConversationState {
    pub fn new(scenario: ScenarioSnapshot) -> Self {
        let next_agent = scenario.starting_agent.clone();
        let cycle = CycleTracker::new(scenario.participating_agents.clone());
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            next_agent,
            phase: Phase::Idle,
            termination: None,
            scenario,
            cycle,
        }
    }

    /// Append a message.  The history is append-only; nothing is accepted
    /// after termination, and thoughts are never stored.
    pub fn push(&mut self, msg: Message) {
        if self.phase == Phase::Terminated {
            warn!(message_id = %msg.id, "dropping message appended after termination");
            return;
        }
        debug_assert!(!msg.is_thought, "thoughts must not enter the history");
        if msg.is_thought {
            return;
        }
        self.messages.push(msg);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn terminate(&mut self, reason: TerminationReason) {
        if self.phase == Phase::Terminated {
            return;
        }
        self.termination = Some(Termination {
            reason,
            at_cycle: self.cycle.current_cycle(),
        });
        self.phase = Phase::Terminated;
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            phase: self.phase,
            current_cycle: self.cycle.current_cycle(),
            message_count: self.messages.len(),
            next_agent: match self.phase {
                Phase::Terminated => None,
                _ => Some(self.next_agent.clone()),
            },
            termination: self.termination.clone(),
        }
    }

    /// Advance `next_agent` one step round-robin over the participants, in
    /// their declared order.
    pub fn advance_next_agent(&mut self) {
        let participants = self.cycle.participating();
        if participants.is_empty() {
            return;
        }
        let idx = participants
            .iter()
            .position(|a| *a == self.next_agent)
            .unwrap_or(0);
        self.next_agent = participants[(idx + 1) % participants.len()].clone();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
