// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod error;
pub mod events;
mod registry;
mod server;

pub use error::ToolError;
pub use events::{server_event_channel, ServerEvent, ServerEventReceiver, ServerEventSender};
pub use registry::{ServerDescriptor, ToolHandle, ToolRegistry};
pub use server::{ServerScope, ServerSpec, ServerStatus, ToolCallResult, ToolDescriptor};
