// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tokio::sync::mpsc;

/// Out-of-band notifications from the tool-server subsystem.
///
/// The registry does not publish observer events directly; it reports
/// through this channel and the orchestration layer translates entries into
/// its own lifecycle events.  The paired receiver is handed to whoever owns
/// the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Ready { server: String, tool_count: usize },
    Unhealthy { server: String, detail: String },
    Recovered { server: String },
    Stopped { server: String },
}

pub type ServerEventSender = mpsc::UnboundedSender<ServerEvent>;
pub type ServerEventReceiver = mpsc::UnboundedReceiver<ServerEvent>;

pub fn server_event_channel() -> (ServerEventSender, ServerEventReceiver) {
    mpsc::unbounded_channel()
}
