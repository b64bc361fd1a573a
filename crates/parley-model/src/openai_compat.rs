// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Driver for OpenAI-compatible chat completion APIs.
//!
//! Hosted providers and local servers (Ollama, vLLM, LM Studio, llama.cpp,
//! gateways) all speak the same `/chat/completions` + `/models` wire format;
//! this single provider covers them, configured with an endpoint URL and an
//! auth style.
//!
//! # Auth styles
//! - `Bearer` — `Authorization: Bearer <key>` (hosted providers)
//! - `None` — no authentication (local servers)

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::{ModelError, ResponseStream},
    ChatMessage, CompletionRequest, ResponseEvent, Role,
};

/// How to send the API key in HTTP requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    None,
}

/// OpenAI-compatible chat completion provider with SSE streaming and
/// structured tool binding.
pub struct OpenAiCompatProvider {
    driver_name: &'static str,
    model: String,
    api_key: Option<String>,
    /// Full chat completions URL, e.g. `http://localhost:11434/v1/chat/completions`.
    chat_url: String,
    models_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
    auth_style: AuthStyle,
}

impl OpenAiCompatProvider {
    /// `base_url` ends **before** `/chat/completions`,
    /// e.g. `https://api.groq.com/openai/v1`.
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        auth_style: AuthStyle,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            models_url: format!("{base}/models"),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.7),
            client: reqwest::Client::new(),
            auth_style,
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, ModelError> {
        match self.auth_style {
            AuthStyle::Bearer => {
                let key = self.api_key.as_deref().ok_or_else(|| {
                    ModelError::EndpointUnreachable(format!(
                        "{}: API key not set; provide api_key or api_key_env in config",
                        self.driver_name
                    ))
                })?;
                Ok(req.bearer_auth(key))
            }
            AuthStyle::None => Ok(req),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        let req = self.authed(self.client.get(&self.models_url))?;
        let resp = req
            .send()
            .await
            .map_err(|e| ModelError::EndpointUnreachable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ModelError::EndpointUnreachable(format!(
                "{} GET /models returned {}",
                self.driver_name,
                resp.status()
            )));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;
        let mut ids: Vec<String> = body["data"]
            .as_array()
            .map(|data| {
                data.iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ModelError> {
        let messages = build_wire_messages(&req.messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            tool_count = tools.len(),
            message_count = req.messages.len(),
            "sending completion request"
        );

        let http_req = self.authed(self.client.post(&self.chat_url).json(&body))?;
        let resp = http_req.send().await.map_err(|e| {
            ModelError::EndpointUnreachable(format!("{} request failed: {e}", self.driver_name))
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            // A 404 body mentioning the model name is the standard "no such
            // model" answer across compatible servers.
            if status == reqwest::StatusCode::NOT_FOUND
                || text.contains("model_not_found")
                || (status.is_client_error() && text.contains(&self.model))
            {
                return Err(ModelError::ModelNotFound(format!(
                    "{}: {text}",
                    self.model
                )));
            }
            return Err(ModelError::EndpointUnreachable(format!(
                "{} error {status}: {text}",
                self.driver_name
            )));
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across TCP packets.  Maintain a line buffer
        // across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<Result<ResponseEvent, ModelError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(ModelError::EndpointUnreachable(e.to_string()))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Serialize the request history into the OpenAI messages array.
fn build_wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut obj = json!({ "role": role_str(&m.role) });
            if !m.tool_calls.is_empty() {
                obj["tool_calls"] = Value::Array(
                    m.tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments.to_string(),
                                }
                            })
                        })
                        .collect(),
                );
                // Assistant tool-call messages may legitimately have no text.
                obj["content"] = if m.content.is_empty() {
                    Value::Null
                } else {
                    Value::String(m.content.clone())
                };
            } else {
                obj["content"] = Value::String(m.content.clone());
            }
            if let Some(id) = &m.tool_call_id {
                obj["tool_call_id"] = Value::String(id.clone());
            }
            obj
        })
        .collect()
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by
/// the next TCP chunk.
fn drain_complete_sse_lines(buf: &mut String) -> Vec<Result<ResponseEvent, ModelError>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines and comments.  Unparseable payloads become
/// recoverable [`ResponseEvent::Error`]s rather than stream failures: the
/// caller treats the surrounding turn as best-effort plain text.
fn parse_sse_data_line(line: &str) -> Option<Result<ResponseEvent, ModelError>> {
    let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return Some(Ok(ResponseEvent::Error(format!("bad SSE chunk: {e}")))),
    };
    Some(Ok(parse_sse_chunk(&v)))
}

fn parse_sse_chunk(v: &Value) -> ResponseEvent {
    let delta = &v["choices"][0]["delta"];

    if let Some(calls) = delta["tool_calls"].as_array() {
        // Providers interleave argument fragments for parallel calls by
        // index; forward one event per fragment and let the consumer
        // accumulate.  Only the first fragment carries id and name.
        if let Some(tc) = calls.first() {
            return ResponseEvent::ToolCall {
                index: tc["index"].as_u64().unwrap_or(0) as u32,
                id: tc["id"].as_str().unwrap_or_default().to_string(),
                name: tc["function"]["name"].as_str().unwrap_or_default().to_string(),
                arguments: tc["function"]["arguments"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            };
        }
    }

    if let Some(text) = delta["content"].as_str() {
        return ResponseEvent::TextDelta(text.to_string());
    }

    // Role-only / finish_reason-only chunks carry nothing actionable.
    ResponseEvent::TextDelta(String::new())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCallRequest;

    #[test]
    fn drain_keeps_incomplete_tail() {
        let mut buf = "data: [DONE]\ndata: {\"partial".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(ResponseEvent::Done)));
        assert_eq!(buf, "data: {\"partial");
    }

    #[test]
    fn drain_handles_crlf_lines() {
        let mut buf = "data: [DONE]\r\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert!(matches!(events[0], Ok(ResponseEvent::Done)));
        assert!(buf.is_empty());
    }

    #[test]
    fn text_delta_chunk_parses() {
        let v: Value =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":"hi"}}]}"#).unwrap();
        assert!(matches!(parse_sse_chunk(&v), ResponseEvent::TextDelta(t) if t == "hi"));
    }

    #[test]
    fn tool_call_chunk_parses_with_index() {
        let v: Value = serde_json::from_str(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"c1","function":{"name":"echo","arguments":"{\"x\""}}]}}]}"#,
        )
        .unwrap();
        match parse_sse_chunk(&v) {
            ResponseEvent::ToolCall { index, id, name, arguments } => {
                assert_eq!(index, 1);
                assert_eq!(id, "c1");
                assert_eq!(name, "echo");
                assert_eq!(arguments, "{\"x\"");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn malformed_data_line_is_recoverable() {
        let ev = parse_sse_data_line("data: {not json").unwrap().unwrap();
        assert!(matches!(ev, ResponseEvent::Error(_)));
    }

    #[test]
    fn non_data_lines_are_ignored() {
        assert!(parse_sse_data_line(": keepalive").is_none());
        assert!(parse_sse_data_line("").is_none());
        assert!(parse_sse_data_line("event: ping").is_none());
    }

    #[test]
    fn wire_messages_include_tool_call_structure() {
        let msgs = vec![
            ChatMessage::assistant_with_calls(
                "",
                vec![ToolCallRequest {
                    id: "c1".into(),
                    name: "echo".into(),
                    arguments: serde_json::json!({"x": "pong"}),
                }],
            ),
            ChatMessage::tool_result("c1", "pong"),
        ];
        let wire = build_wire_messages(&msgs);
        assert_eq!(wire[0]["tool_calls"][0]["id"], "c1");
        assert_eq!(wire[0]["content"], Value::Null);
        assert_eq!(wire[1]["role"], "tool");
        assert_eq!(wire[1]["tool_call_id"], "c1");
    }

    #[test]
    fn wire_messages_plain_text_roles() {
        let msgs = vec![ChatMessage::system("s"), ChatMessage::user("u")];
        let wire = build_wire_messages(&msgs);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["content"], "u");
    }
}
