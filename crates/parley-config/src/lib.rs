// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod loader;
mod schema;

pub use loader::{load, load_str};
pub use schema::{
    AgentConfig, Config, ConfigError, InitConfig, ModelEndpoint, RuntimeConfig, ScenarioConfig,
    ToolServerConfig,
};
