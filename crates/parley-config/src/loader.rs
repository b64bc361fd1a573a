// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/parley/config.yaml"));
    paths.push(PathBuf::from("/etc/parley/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/parley/config.yaml"));
        paths.push(home.join(".config/parley/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("parley/config.yaml"));
        paths.push(cfg.join("parley/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".parley.yaml"));
    paths.push(PathBuf::from(".parley.yml"));
    paths.push(PathBuf::from("parley.yaml"));
    paths.push(PathBuf::from("parley.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
///
/// `${NAME}` environment references are substituted in each file's text
/// before parsing, so secrets and hostnames can live in the environment
/// rather than the config file.  Unset variables substitute to empty.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let layer = read_layer(&path)?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let layer = read_layer(p)?;
        merge_yaml(&mut merged, layer);
    }

    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).context("deserializing merged configuration")?
    };
    Ok(config)
}

/// Parse a configuration directly from YAML text (after env substitution).
pub fn load_str(text: &str) -> anyhow::Result<Config> {
    let expanded = substitute_env(text);
    serde_yaml::from_str(&expanded).context("parsing configuration")
}

fn read_layer(path: &Path) -> anyhow::Result<serde_yaml::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let expanded = substitute_env(&text);
    serde_yaml::from_str(&expanded).with_context(|| format!("parsing {}", path.display()))
}

/// Resolve `${NAME}` references against the process environment.
/// Unset variables become the empty string; malformed syntax is left as-is.
fn substitute_env(text: &str) -> String {
    shellexpand::env_with_context_no_errors(text, |name| {
        Some(std::env::var(name).unwrap_or_default())
    })
    .into_owned()
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
