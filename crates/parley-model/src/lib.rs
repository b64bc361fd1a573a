// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod mock;
mod openai_compat;
mod provider;
mod types;

pub use mock::{MockProvider, MockScript, ScriptedMockProvider};
pub use openai_compat::{AuthStyle, OpenAiCompatProvider};
pub use provider::{ModelError, ModelProvider, ResponseStream};
pub use types::*;

use anyhow::bail;
use parley_config::ModelEndpoint;

/// Construct a boxed [`ModelProvider`] from an endpoint specification.
///
/// The "openai" driver covers every OpenAI-compatible server; the named
/// aliases below only differ in default URL and auth style.
pub fn from_endpoint(cfg: &ModelEndpoint) -> anyhow::Result<Box<dyn ModelProvider>> {
    let key = resolve_api_key(cfg);
    let base_url = |default: &str| -> String {
        cfg.base_url.clone().unwrap_or_else(|| default.into())
    };

    match cfg.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiCompatProvider::new(
            "openai",
            cfg.model.clone(),
            key,
            &base_url("https://api.openai.com/v1"),
            cfg.max_tokens,
            cfg.temperature,
            AuthStyle::Bearer,
        ))),
        "openrouter" => Ok(Box::new(OpenAiCompatProvider::new(
            "openrouter",
            cfg.model.clone(),
            key,
            &base_url("https://openrouter.ai/api/v1"),
            cfg.max_tokens,
            cfg.temperature,
            AuthStyle::Bearer,
        ))),
        "groq" => Ok(Box::new(OpenAiCompatProvider::new(
            "groq",
            cfg.model.clone(),
            key,
            &base_url("https://api.groq.com/openai/v1"),
            cfg.max_tokens,
            cfg.temperature,
            AuthStyle::Bearer,
        ))),
        "ollama" => Ok(Box::new(OpenAiCompatProvider::new(
            "ollama",
            cfg.model.clone(),
            None, // no key needed
            &base_url("http://localhost:11434/v1"),
            cfg.max_tokens,
            cfg.temperature,
            AuthStyle::None,
        ))),
        "vllm" => Ok(Box::new(OpenAiCompatProvider::new(
            "vllm",
            cfg.model.clone(),
            key.clone(),
            &base_url("http://localhost:8000/v1"),
            cfg.max_tokens,
            cfg.temperature,
            if key.is_some() { AuthStyle::Bearer } else { AuthStyle::None },
        ))),
        "lmstudio" => Ok(Box::new(OpenAiCompatProvider::new(
            "lmstudio",
            cfg.model.clone(),
            None,
            &base_url("http://localhost:1234/v1"),
            cfg.max_tokens,
            cfg.temperature,
            AuthStyle::None,
        ))),
        "mock" => Ok(Box::new(MockProvider)),
        other => bail!(
            "unknown model provider: {other:?} (known: openai, openrouter, groq, ollama, vllm, lmstudio, mock)"
        ),
    }
}

fn resolve_api_key(cfg: &ModelEndpoint) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        return std::env::var(env).ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(provider: &str) -> ModelEndpoint {
        ModelEndpoint {
            provider: provider.into(),
            model: "test-model".into(),
            base_url: None,
            api_key_env: None,
            api_key: None,
            temperature: None,
            max_tokens: None,
        }
    }

    #[test]
    fn from_endpoint_openai_succeeds() {
        assert!(from_endpoint(&endpoint("openai")).is_ok());
    }

    #[test]
    fn from_endpoint_ollama_requires_no_key() {
        assert!(from_endpoint(&endpoint("ollama")).is_ok());
    }

    #[test]
    fn from_endpoint_mock_succeeds() {
        let p = from_endpoint(&endpoint("mock")).unwrap();
        assert_eq!(p.name(), "mock");
    }

    #[test]
    fn from_endpoint_unknown_provider_fails() {
        let err = from_endpoint(&endpoint("definitely_not_a_provider")).err().unwrap();
        assert!(err.to_string().contains("unknown model provider"));
    }

    #[test]
    fn resolve_api_key_prefers_explicit_key() {
        let mut cfg = endpoint("openai");
        cfg.api_key = Some("explicit".into());
        cfg.api_key_env = Some("NONEXISTENT_ENV_VAR_XYZ".into());
        assert_eq!(resolve_api_key(&cfg).as_deref(), Some("explicit"));
    }

    #[test]
    fn resolve_api_key_reads_env_var() {
        std::env::set_var("PARLEY_MODEL_TEST_KEY", "from-env");
        let mut cfg = endpoint("openai");
        cfg.api_key_env = Some("PARLEY_MODEL_TEST_KEY".into());
        assert_eq!(resolve_api_key(&cfg).as_deref(), Some("from-env"));
    }
}
