// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use parley_config::ConfigError;

/// Command-surface failures.  These reject the command itself; they are never
/// converted into conversation state.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("no configuration loaded")]
    NoConfig,
    #[error("a conversation is already running")]
    AlreadyRunning,
    #[error("no conversation is running")]
    NotRunning,
    #[error("invalid override: {0}")]
    InvalidOverride(String),
    #[error("unknown scenario: {0:?}")]
    UnknownScenario(String),
    #[error(transparent)]
    ConfigInvalid(#[from] ConfigError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
