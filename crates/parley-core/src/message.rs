// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known non-agent authors.
pub const AUTHOR_USER: &str = "user";
pub const AUTHOR_SYSTEM: &str = "system";
pub const AUTHOR_TOOL: &str = "tool";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    System,
    Human,
    Ai,
    Tool,
    CycleMarker,
}

/// A tool invocation recorded on an `ai` message.  Each record is answered by
/// exactly one `tool` message carrying the same `call_id` before the next
/// agent speaks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// One immutable entry in the shared conversation history.
///
/// Thoughts never become messages; they flow to observers only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Agent id, or one of the `AUTHOR_*` constants.
    pub author: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_index: Option<u32>,
    #[serde(default)]
    pub is_thought: bool,
    /// Opaque to the orchestration layer.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Message {
    fn base(author: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            author: author.into(),
            role,
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: None,
            timestamp: Utc::now(),
            cycle_index: None,
            is_thought: false,
            metadata: serde_json::Value::Null,
        }
    }

    /// The opening message, attributed to the starting agent.
    pub fn human(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self::base(author, Role::Human, content)
    }

    pub fn ai(agent_id: impl Into<String>, content: impl Into<String>, cycle: u32) -> Self {
        let mut m = Self::base(agent_id, Role::Ai, content);
        m.cycle_index = Some(cycle);
        m
    }

    pub fn ai_with_calls(
        agent_id: impl Into<String>,
        content: impl Into<String>,
        cycle: u32,
        calls: Vec<ToolCallRecord>,
    ) -> Self {
        let mut m = Self::ai(agent_id, content, cycle);
        m.tool_calls = calls;
        m
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut m = Self::base(AUTHOR_TOOL, Role::Tool, content);
        m.tool_call_id = Some(call_id.into());
        m
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
