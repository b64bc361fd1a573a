// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

/// Failures from the tool-server subsystem.
///
/// Call-path errors (`Timeout`, `Transport`, `Protocol`, `UnknownTool`) are
/// surfaced back to the model as tool-result text so it can react; they never
/// terminate a conversation.  `Startup` leaves the server stopped and only
/// produces a warning.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool call timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("protocol failure: {0}")]
    Protocol(String),
    #[error("no tool server provides {0:?}")]
    UnknownTool(String),
    #[error("tool server {0:?} is not ready")]
    NotReady(String),
    #[error("tool server {name:?} failed to start: {detail}")]
    Startup { name: String, detail: String },
    #[error("unknown tool server: {0:?}")]
    UnknownServer(String),
}

impl ToolError {
    /// Stable discriminator used in observer events.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::Timeout(_) => "timeout",
            ToolError::Transport(_) => "transport",
            ToolError::Protocol(_) => "protocol",
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::NotReady(_) => "not_ready",
            ToolError::Startup { .. } => "startup",
            ToolError::UnknownServer(_) => "unknown_server",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(ToolError::Timeout(Duration::from_secs(1)).kind(), "timeout");
        assert_eq!(ToolError::UnknownTool("x".into()).kind(), "unknown_tool");
        assert_eq!(
            ToolError::Startup { name: "s".into(), detail: "d".into() }.kind(),
            "startup"
        );
    }

    #[test]
    fn display_includes_context() {
        let e = ToolError::UnknownTool("echo".into());
        assert!(e.to_string().contains("echo"));
    }
}
