// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::{ModelError, ResponseStream},
    CompletionRequest, ResponseEvent, Role,
};

/// Deterministic mock provider.  Echoes the last user message back as the
/// assistant response.  Used for dry runs and smoke tests.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ModelError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "[no input]".into());

        let events: Vec<Result<ResponseEvent, ModelError>> = vec![
            Ok(ResponseEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(ResponseEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// One scripted completion: either a sequence of stream events or an
/// immediate typed failure from `complete` itself.
#[derive(Debug, Clone)]
pub enum MockScript {
    Events(Vec<ResponseEvent>),
    Fail(ModelError),
}

/// A pre-scripted mock provider.  Each call to `complete` pops the next
/// script from the front of the queue.  This lets tests specify exact event
/// sequences (including tool calls and endpoint failures) without network
/// access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<MockScript>>>,
    /// The last `CompletionRequest` seen by this provider.
    /// Written on each `complete()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    /// Build a provider from an ordered list of per-call scripts.
    pub fn new(scripts: Vec<MockScript>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: provider that returns the same text reply on every call,
    /// streamed in two deltas to exercise chunk accumulation.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r: String = reply.into();
        let mut split = r.len() / 2;
        while !r.is_char_boundary(split) {
            split -= 1;
        }
        let (head, tail) = r.split_at(split);
        Self::new(vec![MockScript::Events(vec![
            ResponseEvent::TextDelta(head.to_string()),
            ResponseEvent::TextDelta(tail.to_string()),
            ResponseEvent::Done,
        ])])
    }

    /// Convenience: one script that emits `text` then ends.
    pub fn text_script(text: impl Into<String>) -> MockScript {
        MockScript::Events(vec![
            ResponseEvent::TextDelta(text.into()),
            ResponseEvent::Done,
        ])
    }

    /// Convenience: a tool-call script followed (on the next call) by a text
    /// reply, the canonical single round-trip.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            MockScript::Events(vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                ResponseEvent::Done,
            ]),
            Self::text_script(final_text.into()),
        ])
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ModelError> {
        *self.last_request.lock().unwrap() = Some(req);
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                MockScript::Events(vec![
                    ResponseEvent::TextDelta("[no more scripts]".into()),
                    ResponseEvent::Done,
                ])
            } else {
                scripts.remove(0)
            }
        };
        match script {
            MockScript::Fail(err) => Err(err),
            MockScript::Events(events) => {
                let wrapped: Vec<Result<ResponseEvent, ModelError>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(wrapped)))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
