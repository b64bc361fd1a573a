// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::state::ScenarioSnapshot;

/// Why a conversation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    MaxCycles,
    Keyword(String),
    Silence,
    Stopped,
    AgentError,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::MaxCycles => write!(f, "max_cycles"),
            TerminationReason::Keyword(word) => write!(f, "keyword:{word}"),
            TerminationReason::Silence => write!(f, "silence"),
            TerminationReason::Stopped => write!(f, "stopped"),
            TerminationReason::AgentError => write!(f, "agent_error"),
        }
    }
}

/// Tracks which participants have spoken in the current cycle and keeps a
/// signature of each completed cycle for the silence predicate.
///
/// A cycle completes exactly when every participating agent has taken one
/// turn; the counter then advances and the spoken set resets.
#[derive(Debug, Clone)]
pub struct CycleTracker {
    participating: Vec<String>,
    spoken: HashSet<String>,
    current_cycle: u32,
    /// Trimmed final-content lengths of the in-progress cycle, turn order.
    pending_lengths: Vec<usize>,
    /// One entry per completed cycle.
    signatures: Vec<Vec<usize>>,
}

impl CycleTracker {
    pub fn new(participating: Vec<String>) -> Self {
        Self {
            participating,
            spoken: HashSet::new(),
            current_cycle: 0,
            pending_lengths: Vec::new(),
            signatures: Vec::new(),
        }
    }

    pub fn current_cycle(&self) -> u32 {
        self.current_cycle
    }

    pub fn participating(&self) -> &[String] {
        &self.participating
    }

    pub fn spoken_this_cycle(&self) -> &HashSet<String> {
        &self.spoken
    }

    /// Record a completed turn.  Returns `true` when this turn completed the
    /// cycle (every participant has now spoken).
    pub fn record_turn(&mut self, agent_id: &str, final_content: &str) -> bool {
        self.spoken.insert(agent_id.to_string());
        self.pending_lengths.push(final_content.trim().len());
        if self.spoken.len() == self.participating.len() {
            self.complete_cycle();
            true
        } else {
            false
        }
    }

    fn complete_cycle(&mut self) {
        self.current_cycle += 1;
        self.signatures.push(std::mem::take(&mut self.pending_lengths));
        self.spoken.clear();
    }

    /// Evaluate the termination predicates in fixed order; first match wins.
    /// Checked after every turn so a keyword stops the run promptly rather
    /// than at the next cycle boundary.
    pub fn check_termination(
        &self,
        scenario: &ScenarioSnapshot,
        latest_content: &str,
        silence_len_cutoff: usize,
    ) -> Option<TerminationReason> {
        if self.current_cycle >= scenario.max_cycles {
            return Some(TerminationReason::MaxCycles);
        }

        let lower = latest_content.to_lowercase();
        for keyword in &scenario.keyword_triggers {
            if !keyword.is_empty() && lower.contains(&keyword.to_lowercase()) {
                return Some(TerminationReason::Keyword(keyword.clone()));
            }
        }

        if let Some(threshold) = scenario.silence_threshold {
            let threshold = threshold as usize;
            if threshold > 0 && self.signatures.len() >= threshold {
                let quiet = self.signatures[self.signatures.len() - threshold..]
                    .iter()
                    .all(|cycle| cycle.iter().all(|len| *len <= silence_len_cutoff));
                if quiet {
                    return Some(TerminationReason::Silence);
                }
            }
        }

        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scenario(max_cycles: u32) -> ScenarioSnapshot {
        ScenarioSnapshot {
            name: "test".into(),
            goal: None,
            brevity: None,
            max_cycles,
            starting_agent: "a".into(),
            participating_agents: vec!["a".into(), "b".into()],
            turn_timeout: Duration::from_secs(60),
            keyword_triggers: vec![],
            silence_threshold: None,
        }
    }

    fn tracker() -> CycleTracker {
        CycleTracker::new(vec!["a".into(), "b".into()])
    }

    #[test]
    fn cycle_completes_when_all_have_spoken() {
        let mut t = tracker();
        assert!(!t.record_turn("a", "hello"));
        assert_eq!(t.current_cycle(), 0);
        assert!(t.record_turn("b", "hi"));
        assert_eq!(t.current_cycle(), 1);
        assert!(t.spoken_this_cycle().is_empty());
    }

    #[test]
    fn repeat_speaker_does_not_complete_cycle() {
        let mut t = tracker();
        assert!(!t.record_turn("a", "one"));
        assert!(!t.record_turn("a", "two"));
        assert_eq!(t.current_cycle(), 0);
    }

    #[test]
    fn max_cycles_reached_terminates() {
        let mut t = tracker();
        let sc = scenario(1);
        t.record_turn("a", "x");
        assert_eq!(t.check_termination(&sc, "x", 20), None);
        t.record_turn("b", "y");
        assert_eq!(
            t.check_termination(&sc, "y", 20),
            Some(TerminationReason::MaxCycles)
        );
    }

    #[test]
    fn keyword_matches_case_insensitive_substring() {
        let t = tracker();
        let mut sc = scenario(10);
        sc.keyword_triggers = vec!["goodbye".into()];
        assert_eq!(
            t.check_termination(&sc, "ok, GOODBYE then", 20),
            Some(TerminationReason::Keyword("goodbye".into()))
        );
        assert_eq!(t.check_termination(&sc, "hello", 20), None);
    }

    #[test]
    fn keyword_fires_before_cycle_boundary() {
        let mut t = tracker();
        let mut sc = scenario(10);
        sc.keyword_triggers = vec!["done".into()];
        // Only agent a has spoken; cycle is incomplete but the keyword in the
        // latest content stops the run immediately.
        t.record_turn("a", "we are done");
        assert_eq!(
            t.check_termination(&sc, "we are done", 20),
            Some(TerminationReason::Keyword("done".into()))
        );
    }

    #[test]
    fn max_cycles_wins_over_keyword_when_both_hold() {
        let mut t = tracker();
        let mut sc = scenario(1);
        sc.keyword_triggers = vec!["goodbye".into()];
        t.record_turn("a", "goodbye");
        t.record_turn("b", "goodbye");
        // Both predicates hold; evaluation order decides.
        assert_eq!(
            t.check_termination(&sc, "goodbye", 20),
            Some(TerminationReason::MaxCycles)
        );
    }

    #[test]
    fn silence_requires_threshold_consecutive_quiet_cycles() {
        let mut t = tracker();
        let mut sc = scenario(10);
        sc.silence_threshold = Some(2);

        t.record_turn("a", ".");
        t.record_turn("b", ".");
        assert_eq!(t.check_termination(&sc, ".", 20), None, "one quiet cycle is not enough");

        t.record_turn("a", ".");
        t.record_turn("b", ".");
        assert_eq!(
            t.check_termination(&sc, ".", 20),
            Some(TerminationReason::Silence)
        );
    }

    #[test]
    fn loud_cycle_resets_silence_window() {
        let mut t = tracker();
        let mut sc = scenario(10);
        sc.silence_threshold = Some(2);

        t.record_turn("a", ".");
        t.record_turn("b", ".");
        t.record_turn("a", "a substantially longer reply than the cutoff");
        t.record_turn("b", ".");
        assert_eq!(t.check_termination(&sc, ".", 20), None);
    }

    #[test]
    fn silence_uses_trimmed_length() {
        let mut t = tracker();
        let mut sc = scenario(10);
        sc.silence_threshold = Some(1);
        t.record_turn("a", "   .   \n");
        t.record_turn("b", "\t.\t");
        assert_eq!(
            t.check_termination(&sc, ".", 20),
            Some(TerminationReason::Silence)
        );
    }

    #[test]
    fn termination_reason_display_formats() {
        assert_eq!(TerminationReason::MaxCycles.to_string(), "max_cycles");
        assert_eq!(
            TerminationReason::Keyword("goodbye".into()).to_string(),
            "keyword:goodbye"
        );
        assert_eq!(TerminationReason::Silence.to_string(), "silence");
        assert_eq!(TerminationReason::Stopped.to_string(), "stopped");
        assert_eq!(TerminationReason::AgentError.to_string(), "agent_error");
    }
}
