// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The per-turn execution pipeline.
//!
//! A turn streams one agent's model output through the thought filter,
//! resolves any tool calls (looping until the model answers in plain text or
//! the tool budget runs out), and ends with exactly one final `ai` message.
//! The whole pipeline runs under the turn deadline and the conversation
//! cancellation token; nothing is committed to the shared history until the
//! turn produced a consistent message group, so a cancelled or timed-out
//! turn can never leave a tool call without its result.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parley_model::{
    ChatMessage, CompletionRequest, ModelError, ResponseEvent, ToolCallRequest, ToolSchema,
};
use parley_tools::{ToolCallResult, ToolError, ToolRegistry};

use crate::events::{Event, EventSink};
use crate::init::AgentRuntime;
use crate::message::{Message, Role, ToolCallRecord};
use crate::state::ConversationState;
use crate::thought::{ThoughtDelimiters, ThoughtFilter};

/// Appended to the history when a turn exceeds its deadline.
pub const TIMEOUT_MESSAGE: &str = "[agent timed out]";
/// Answers outstanding tool calls once the per-turn tool budget is spent.
const TOOL_BUDGET_MESSAGE: &str =
    "Tool budget for this turn is exhausted. Respond now without calling further tools.";
/// Longest tool-result excerpt carried in observer events.
const RESULT_PREVIEW_LEN: usize = 200;

/// The tool capability a turn needs: enumerate what an agent may call and
/// dispatch one call.  Implemented by the subprocess registry; tests plug in
/// in-memory fakes.
#[async_trait]
pub trait ToolBroker: Send + Sync {
    async fn bound_tools(&self, agent_id: &str) -> Vec<ToolSchema>;
    async fn call(
        &self,
        agent_id: &str,
        tool_name: &str,
        args: serde_json::Value,
        deadline: Duration,
    ) -> Result<ToolCallResult, ToolError>;
}

#[async_trait]
impl ToolBroker for ToolRegistry {
    async fn bound_tools(&self, agent_id: &str) -> Vec<ToolSchema> {
        // Flatten the visible handles; an agent-scoped server shadows a
        // global server exposing the same tool name.
        let mut by_name: HashMap<String, ToolSchema> = HashMap::new();
        let handles = self.tools_for_agent(agent_id).await;
        for scoped_pass in [false, true] {
            for handle in &handles {
                let is_scoped = matches!(handle.scope, parley_tools::ServerScope::Agent(_));
                if is_scoped != scoped_pass {
                    continue;
                }
                for tool in &handle.tools {
                    by_name.insert(
                        tool.name.clone(),
                        ToolSchema {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            parameters: tool.input_schema.clone(),
                        },
                    );
                }
            }
        }
        let mut schemas: Vec<ToolSchema> = by_name.into_values().collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    async fn call(
        &self,
        agent_id: &str,
        tool_name: &str,
        args: serde_json::Value,
        deadline: Duration,
    ) -> Result<ToolCallResult, ToolError> {
        ToolRegistry::call(self, agent_id, tool_name, args, deadline).await
    }
}

/// Tunables the executor needs from the runtime configuration.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub max_tool_iterations: u32,
    pub tool_call_timeout: Duration,
}

#[derive(Debug)]
pub enum TurnOutcome {
    /// The turn ended with a final message (possibly the timeout synthetic).
    Completed {
        final_content: String,
        cycle_completed: bool,
        timed_out: bool,
    },
    /// The conversation token fired; nothing was committed.
    Cancelled,
    /// The model endpoint failed; a synthetic message was committed and the
    /// conversation must terminate.
    Fatal(ModelError),
}

/// Execute one turn for `agent`, appending its messages to `state`.
#[allow(clippy::too_many_arguments)]
pub async fn run_turn(
    agent: &AgentRuntime,
    display_names: &HashMap<String, String>,
    state: &mut ConversationState,
    sink: &EventSink,
    tools: &dyn ToolBroker,
    delims: &Arc<ThoughtDelimiters>,
    cfg: &TurnConfig,
    cancel: &CancellationToken,
) -> TurnOutcome {
    sink.publish(Event::TurnIndicator {
        agent_id: agent.id.clone(),
    });

    let cycle = state.cycle.current_cycle();
    let deadline = state.scenario.turn_timeout;

    enum Waited {
        Cancelled,
        TimedOut,
        Done(Result<TurnBody, ModelError>),
    }

    let waited = {
        let drive = drive_turn(agent, display_names, state, sink, tools, delims, cfg, cycle);
        tokio::pin!(drive);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Waited::Cancelled,
            _ = tokio::time::sleep(deadline) => Waited::TimedOut,
            result = &mut drive => Waited::Done(result),
        }
    };

    match waited {
        Waited::Cancelled => TurnOutcome::Cancelled,
        Waited::TimedOut => {
            // The in-flight stream and tool futures were dropped with the
            // driver; only the synthetic message reaches the history.
            sink.publish(Event::Error {
                kind: "timeout".into(),
                agent_id: Some(agent.id.clone()),
                message: format!("turn exceeded {deadline:?}"),
            });
            state.push(Message::ai(&agent.id, TIMEOUT_MESSAGE, cycle));
            publish_agent_message(sink, agent, TIMEOUT_MESSAGE, cycle);
            let cycle_completed = state.cycle.record_turn(&agent.id, TIMEOUT_MESSAGE);
            TurnOutcome::Completed {
                final_content: TIMEOUT_MESSAGE.into(),
                cycle_completed,
                timed_out: true,
            }
        }
        Waited::Done(Err(e)) => {
            sink.publish(Event::Error {
                kind: e.kind().into(),
                agent_id: Some(agent.id.clone()),
                message: e.to_string(),
            });
            state.push(Message::ai(
                &agent.id,
                format!("[model unavailable: {e}]"),
                cycle,
            ));
            TurnOutcome::Fatal(e)
        }
        Waited::Done(Ok(body)) => {
            for msg in body.messages {
                state.push(msg);
            }
            publish_agent_message(sink, agent, &body.final_content, cycle);
            let cycle_completed = state.cycle.record_turn(&agent.id, &body.final_content);
            TurnOutcome::Completed {
                final_content: body.final_content,
                cycle_completed,
                timed_out: false,
            }
        }
    }
}

fn publish_agent_message(sink: &EventSink, agent: &AgentRuntime, content: &str, cycle: u32) {
    sink.publish(Event::AgentMessage {
        agent_id: agent.id.clone(),
        display_name: agent.display_name.clone(),
        content: content.to_string(),
        cycle,
        timestamp: Utc::now(),
    });
}

struct TurnBody {
    /// The turn's message group, in order: tool-call rounds then the final
    /// `ai` message.
    messages: Vec<Message>,
    final_content: String,
}

/// The model ⇄ tool loop, free of deadline concerns.  Works against a local
/// message buffer so the caller commits all-or-nothing.
#[allow(clippy::too_many_arguments)]
async fn drive_turn(
    agent: &AgentRuntime,
    display_names: &HashMap<String, String>,
    state: &ConversationState,
    sink: &EventSink,
    tools: &dyn ToolBroker,
    delims: &Arc<ThoughtDelimiters>,
    cfg: &TurnConfig,
    cycle: u32,
) -> Result<TurnBody, ModelError> {
    let mut appended: Vec<Message> = Vec::new();
    let mut tool_rounds = 0u32;
    let mut tools_exhausted = false;

    loop {
        let bound = if tools_exhausted {
            vec![]
        } else {
            tools.bound_tools(&agent.id).await
        };

        let req = CompletionRequest {
            messages: build_agent_view(agent, display_names, state, &appended),
            tools: bound,
            stream: true,
        };

        let mut stream = agent.model.complete(req).await?;

        let mut filter = ThoughtFilter::new(Arc::clone(delims), agent.thinking);
        let mut clean = String::new();
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();

        while let Some(event) = stream.next().await {
            match event {
                Ok(ResponseEvent::TextDelta(delta)) if !delta.is_empty() => {
                    route_filtered(sink, agent, filter.push(&delta), &mut clean);
                }
                Ok(ResponseEvent::TextDelta(_)) => {}
                Ok(ResponseEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                }) if !tools_exhausted => {
                    let slot = pending.entry(index).or_default();
                    if !id.is_empty() {
                        slot.id = id;
                    }
                    if !name.is_empty() {
                        slot.name = name;
                    }
                    slot.args_buf.push_str(&arguments);
                }
                Ok(ResponseEvent::ToolCall { name, .. }) => {
                    // The wrap-up turn is tool-free; a call here cannot be
                    // answered, so it is dropped rather than recorded.
                    warn!(agent = %agent.id, tool = %name, "ignoring tool call in tool-free turn");
                }
                Ok(ResponseEvent::Done) => break,
                Ok(ResponseEvent::Error(detail)) => {
                    sink.publish(Event::Error {
                        kind: "protocol".into(),
                        agent_id: Some(agent.id.clone()),
                        message: detail,
                    });
                }
                Err(e @ ModelError::MalformedResponse(_)) => {
                    // Keep whatever streamed so far as plain text.
                    sink.publish(Event::Error {
                        kind: "protocol".into(),
                        agent_id: Some(agent.id.clone()),
                        message: e.to_string(),
                    });
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        route_filtered(sink, agent, filter.finish(), &mut clean);

        let tool_calls = finish_pending(pending);
        if tool_calls.is_empty() {
            let final_content = clean;
            appended.push(Message::ai(&agent.id, final_content.clone(), cycle));
            return Ok(TurnBody {
                messages: appended,
                final_content,
            });
        }

        let records: Vec<ToolCallRecord> = tool_calls
            .iter()
            .map(|tc| ToolCallRecord {
                call_id: tc.id.clone(),
                tool_name: tc.name.clone(),
                arguments: tc.arguments.clone(),
            })
            .collect();
        appended.push(Message::ai_with_calls(
            &agent.id,
            clean,
            cycle,
            records.clone(),
        ));

        if tool_rounds >= cfg.max_tool_iterations {
            debug!(agent = %agent.id, rounds = tool_rounds, "tool budget exhausted; forcing wrap-up");
            for record in &records {
                appended.push(Message::tool_result(&record.call_id, TOOL_BUDGET_MESSAGE));
            }
            tools_exhausted = true;
            continue;
        }
        tool_rounds += 1;

        for record in &records {
            sink.publish(Event::ToolCall {
                agent_id: agent.id.clone(),
                tool_name: record.tool_name.clone(),
                args: record.arguments.clone(),
            });
        }

        // The batch runs concurrently; each call has its own deadline.
        let started = Instant::now();
        let results = futures::future::join_all(records.iter().map(|record| {
            tools.call(
                &agent.id,
                &record.tool_name,
                record.arguments.clone(),
                cfg.tool_call_timeout,
            )
        }))
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        for (record, result) in records.iter().zip(results) {
            let content = match result {
                Ok(outcome) => outcome.content,
                // Failures are surfaced to the model as result text so it
                // can react; they never abort the conversation.
                Err(e) => format!("tool error ({}): {e}", e.kind()),
            };
            sink.publish(Event::ToolResult {
                tool_name: record.tool_name.clone(),
                result_preview: preview(&content),
                duration_ms: elapsed_ms,
            });
            appended.push(Message::tool_result(&record.call_id, content));
        }
    }
}

fn route_filtered(
    sink: &EventSink,
    agent: &AgentRuntime,
    out: crate::thought::FilterOutput,
    clean: &mut String,
) {
    if !out.thought.is_empty() && agent.thinking {
        sink.publish(Event::Thought {
            agent_id: agent.id.clone(),
            chunk: out.thought,
            timestamp: Utc::now(),
        });
    }
    clean.push_str(&out.clean);
}

fn preview(content: &str) -> String {
    if content.len() <= RESULT_PREVIEW_LEN {
        content.to_string()
    } else {
        let mut cut = RESULT_PREVIEW_LEN;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &content[..cut])
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

/// Flush accumulated tool-call fragments, ordered by provider index.  Calls
/// without a name cannot be dispatched and are dropped; an empty id gets a
/// synthetic fallback so its result message can still reference it.
fn finish_pending(pending: HashMap<u32, PendingToolCall>) -> Vec<ToolCallRequest> {
    let mut sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
    sorted.sort_by_key(|(idx, _)| *idx);

    let mut calls = Vec::new();
    for (i, (_, ptc)) in sorted.into_iter().enumerate() {
        if ptc.name.is_empty() {
            warn!(call_id = %ptc.id, "dropping tool call with empty name from model");
            continue;
        }
        let arguments = if ptc.args_buf.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&ptc.args_buf) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        tool = %ptc.name,
                        error = %e,
                        "model sent invalid JSON arguments; substituting {{}}"
                    );
                    serde_json::Value::Object(Default::default())
                }
            }
        };
        let id = if ptc.id.is_empty() {
            format!("call_synthetic_{i}")
        } else {
            ptc.id
        };
        calls.push(ToolCallRequest {
            id,
            name: ptc.name,
            arguments,
        });
    }
    calls
}

/// Project the shared history into the wire view for one agent.
///
/// The agent's own messages keep their structured assistant/tool form; other
/// participants' final utterances arrive as user messages prefixed with the
/// speaker's display name, and their tool-call scaffolding is omitted so the
/// view handed to any endpoint is always well-formed.
fn build_agent_view(
    agent: &AgentRuntime,
    display_names: &HashMap<String, String>,
    state: &ConversationState,
    appended: &[Message],
) -> Vec<ChatMessage> {
    let mut view = vec![ChatMessage::system(&agent.system_prompt)];
    let mut own_call_ids: HashSet<String> = HashSet::new();

    for msg in state.messages().iter().chain(appended.iter()) {
        if msg.is_thought {
            continue;
        }
        match msg.role {
            Role::Human => view.push(ChatMessage::user(&msg.content)),
            Role::Ai if msg.author == agent.id => {
                if msg.tool_calls.is_empty() {
                    view.push(ChatMessage::assistant(&msg.content));
                } else {
                    let calls: Vec<ToolCallRequest> = msg
                        .tool_calls
                        .iter()
                        .map(|r| {
                            own_call_ids.insert(r.call_id.clone());
                            ToolCallRequest {
                                id: r.call_id.clone(),
                                name: r.tool_name.clone(),
                                arguments: r.arguments.clone(),
                            }
                        })
                        .collect();
                    view.push(ChatMessage::assistant_with_calls(&msg.content, calls));
                }
            }
            Role::Ai => {
                if msg.tool_calls.is_empty() && !msg.content.is_empty() {
                    let name = display_names
                        .get(&msg.author)
                        .cloned()
                        .unwrap_or_else(|| msg.author.clone());
                    view.push(ChatMessage::user(format!("{name}: {}", msg.content)));
                }
            }
            Role::Tool => {
                if let Some(call_id) = &msg.tool_call_id {
                    if own_call_ids.contains(call_id) {
                        view.push(ChatMessage::tool_result(call_id, &msg.content));
                    }
                }
            }
            Role::System | Role::CycleMarker => {}
        }
    }
    view
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::CycleTracker;
    use crate::state::ScenarioSnapshot;
    use parley_model::{MockScript, ScriptedMockProvider};

    fn snapshot() -> ScenarioSnapshot {
        ScenarioSnapshot {
            name: "t".into(),
            goal: None,
            brevity: None,
            max_cycles: 5,
            starting_agent: "a".into(),
            participating_agents: vec!["a".into(), "b".into()],
            turn_timeout: Duration::from_secs(5),
            keyword_triggers: vec![],
            silence_threshold: None,
        }
    }

    fn agent(id: &str, provider: ScriptedMockProvider, thinking: bool) -> AgentRuntime {
        AgentRuntime {
            id: id.into(),
            display_name: id.to_uppercase(),
            persona: String::new(),
            system_prompt: format!("you are {id}"),
            thinking,
            model: Arc::new(provider),
            metadata: serde_json::Value::Null,
        }
    }

    fn names() -> HashMap<String, String> {
        [("a", "A"), ("b", "B")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    struct NoTools;

    #[async_trait]
    impl ToolBroker for NoTools {
        async fn bound_tools(&self, _agent_id: &str) -> Vec<ToolSchema> {
            vec![]
        }
        async fn call(
            &self,
            _agent_id: &str,
            tool_name: &str,
            _args: serde_json::Value,
            _deadline: Duration,
        ) -> Result<ToolCallResult, ToolError> {
            Err(ToolError::UnknownTool(tool_name.to_string()))
        }
    }

    /// Echoes back the `x` argument, like a trivial MCP server would.
    struct EchoTool;

    #[async_trait]
    impl ToolBroker for EchoTool {
        async fn bound_tools(&self, _agent_id: &str) -> Vec<ToolSchema> {
            vec![ToolSchema {
                name: "echo".into(),
                description: "echoes x".into(),
                parameters: serde_json::json!({"type": "object"}),
            }]
        }
        async fn call(
            &self,
            _agent_id: &str,
            _tool_name: &str,
            args: serde_json::Value,
            _deadline: Duration,
        ) -> Result<ToolCallResult, ToolError> {
            Ok(ToolCallResult {
                content: args["x"].as_str().unwrap_or_default().to_string(),
                is_error: false,
            })
        }
    }

    fn cfg() -> TurnConfig {
        TurnConfig {
            max_tool_iterations: 8,
            tool_call_timeout: Duration::from_secs(1),
        }
    }

    fn state() -> ConversationState {
        let mut st = ConversationState::new(snapshot());
        st.push(Message::human("a", "begin"));
        st
    }

    #[tokio::test]
    async fn plain_text_turn_appends_one_ai_message() {
        let sink = EventSink::new(64);
        let mut st = state();
        let a = agent("a", ScriptedMockProvider::always_text("hello there"), false);
        let outcome = run_turn(
            &a,
            &names(),
            &mut st,
            &sink,
            &NoTools,
            &Arc::new(ThoughtDelimiters::default()),
            &cfg(),
            &CancellationToken::new(),
        )
        .await;
        match outcome {
            TurnOutcome::Completed { final_content, cycle_completed, timed_out } => {
                assert_eq!(final_content, "hello there");
                assert!(!cycle_completed);
                assert!(!timed_out);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(st.messages().len(), 2);
        let last = st.last_message().unwrap();
        assert_eq!(last.role, Role::Ai);
        assert_eq!(last.author, "a");
        assert_eq!(last.content, "hello there");
    }

    #[tokio::test]
    async fn thinking_region_streams_as_thought_not_content() {
        let sink = EventSink::new(64);
        let mut sub = sink.subscribe("observer");
        let mut st = state();
        let provider = ScriptedMockProvider::new(vec![MockScript::Events(vec![
            ResponseEvent::TextDelta("<thinking>plan</thinking>answer".into()),
            ResponseEvent::Done,
        ])]);
        let a = agent("a", provider, true);
        run_turn(
            &a,
            &names(),
            &mut st,
            &sink,
            &NoTools,
            &Arc::new(ThoughtDelimiters::default()),
            &cfg(),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(st.last_message().unwrap().content, "answer");
        let mut thoughts = String::new();
        let mut message_content = String::new();
        while let Some(ev) = sub.try_recv() {
            match ev {
                Event::Thought { chunk, .. } => thoughts.push_str(&chunk),
                Event::AgentMessage { content, .. } => message_content = content,
                _ => {}
            }
        }
        assert_eq!(thoughts, "plan");
        assert_eq!(message_content, "answer");
    }

    #[tokio::test]
    async fn thoughts_are_dropped_when_thinking_disabled() {
        let sink = EventSink::new(64);
        let mut sub = sink.subscribe("observer");
        let mut st = state();
        let provider = ScriptedMockProvider::new(vec![MockScript::Events(vec![
            ResponseEvent::TextDelta("<thinking>hidden</thinking>visible".into()),
            ResponseEvent::Done,
        ])]);
        let a = agent("a", provider, false);
        run_turn(
            &a,
            &names(),
            &mut st,
            &sink,
            &NoTools,
            &Arc::new(ThoughtDelimiters::default()),
            &cfg(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(st.last_message().unwrap().content, "visible");
        while let Some(ev) = sub.try_recv() {
            assert!(
                !matches!(ev, Event::Thought { .. }),
                "no thought events for a non-thinking agent"
            );
        }
    }

    #[tokio::test]
    async fn tool_round_trip_appends_call_result_then_final() {
        let sink = EventSink::new(64);
        let mut st = state();
        let provider =
            ScriptedMockProvider::tool_then_text("call-1", "echo", r#"{"x":"pong"}"#, "done");
        let a = agent("a", provider, false);
        let outcome = run_turn(
            &a,
            &names(),
            &mut st,
            &sink,
            &EchoTool,
            &Arc::new(ThoughtDelimiters::default()),
            &cfg(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            outcome,
            TurnOutcome::Completed { ref final_content, .. } if final_content == "done"
        ));

        // opening, ai(tool_calls), tool(result), ai(final)
        let msgs = st.messages();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[1].role, Role::Ai);
        assert_eq!(msgs[1].tool_calls.len(), 1);
        assert_eq!(msgs[1].tool_calls[0].call_id, "call-1");
        assert_eq!(msgs[2].role, Role::Tool);
        assert_eq!(msgs[2].tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(msgs[2].content, "pong");
        assert_eq!(msgs[3].role, Role::Ai);
        assert_eq!(msgs[3].content, "done");
    }

    #[tokio::test]
    async fn tool_failure_is_surfaced_as_result_text() {
        let sink = EventSink::new(64);
        let mut st = state();
        let provider =
            ScriptedMockProvider::tool_then_text("c1", "missing", "{}", "understood");
        let a = agent("a", provider, false);
        let outcome = run_turn(
            &a,
            &names(),
            &mut st,
            &sink,
            &NoTools,
            &Arc::new(ThoughtDelimiters::default()),
            &cfg(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        let tool_msg = &st.messages()[2];
        assert_eq!(tool_msg.role, Role::Tool);
        assert!(tool_msg.content.contains("tool error"));
        assert!(tool_msg.content.contains("unknown_tool"));
    }

    #[tokio::test]
    async fn endpoint_failure_is_fatal_and_leaves_synthetic_message() {
        let sink = EventSink::new(64);
        let mut sub = sink.subscribe("observer");
        let mut st = state();
        let provider = ScriptedMockProvider::new(vec![MockScript::Fail(
            ModelError::EndpointUnreachable("connection refused".into()),
        )]);
        let a = agent("a", provider, false);
        let outcome = run_turn(
            &a,
            &names(),
            &mut st,
            &sink,
            &NoTools,
            &Arc::new(ThoughtDelimiters::default()),
            &cfg(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(outcome, TurnOutcome::Fatal(_)));
        assert!(st
            .last_message()
            .unwrap()
            .content
            .starts_with("[model unavailable"));
        let mut saw_error = false;
        while let Some(ev) = sub.try_recv() {
            if let Event::Error { kind, agent_id, .. } = ev {
                assert_eq!(kind, "endpoint_unreachable");
                assert_eq!(agent_id.as_deref(), Some("a"));
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn turn_deadline_produces_timeout_message() {
        let sink = EventSink::new(64);
        let mut st = state();
        // A provider that never finishes its stream.
        let provider = ScriptedMockProvider::new(vec![MockScript::Events(vec![
            ResponseEvent::TextDelta("partial".into()),
            // no Done; the broker below stalls the turn past the deadline
            // before this stream is ever consumed.
        ])]);
        let mut snap = snapshot();
        snap.turn_timeout = Duration::from_millis(30);
        let mut st2 = ConversationState::new(snap);
        st2.push(Message::human("a", "begin"));
        std::mem::swap(&mut st, &mut st2);

        struct StallingBroker;
        #[async_trait]
        impl ToolBroker for StallingBroker {
            async fn bound_tools(&self, _agent_id: &str) -> Vec<ToolSchema> {
                // Stall turn startup past the deadline.
                tokio::time::sleep(Duration::from_secs(10)).await;
                vec![]
            }
            async fn call(
                &self,
                _a: &str,
                _t: &str,
                _args: serde_json::Value,
                _d: Duration,
            ) -> Result<ToolCallResult, ToolError> {
                unreachable!()
            }
        }

        let a = agent("a", provider, false);
        let outcome = run_turn(
            &a,
            &names(),
            &mut st,
            &sink,
            &StallingBroker,
            &Arc::new(ThoughtDelimiters::default()),
            &cfg(),
            &CancellationToken::new(),
        )
        .await;
        match outcome {
            TurnOutcome::Completed { final_content, timed_out, .. } => {
                assert!(timed_out);
                assert_eq!(final_content, TIMEOUT_MESSAGE);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(st.last_message().unwrap().content, TIMEOUT_MESSAGE);
    }

    #[tokio::test]
    async fn cancellation_commits_nothing() {
        let sink = EventSink::new(64);
        let mut st = state();
        let provider = ScriptedMockProvider::always_text("never seen");
        let a = agent("a", provider, false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = run_turn(
            &a,
            &names(),
            &mut st,
            &sink,
            &NoTools,
            &Arc::new(ThoughtDelimiters::default()),
            &cfg(),
            &cancel,
        )
        .await;
        assert!(matches!(outcome, TurnOutcome::Cancelled));
        assert_eq!(st.messages().len(), 1, "only the opening message remains");
    }

    #[tokio::test]
    async fn exhausted_tool_budget_forces_wrap_up() {
        let sink = EventSink::new(256);
        let mut st = state();
        // Every round requests another tool call; the budget must cut in.
        let mut scripts: Vec<MockScript> = (0..20)
            .map(|i| {
                MockScript::Events(vec![
                    ResponseEvent::ToolCall {
                        index: 0,
                        id: format!("c{i}"),
                        name: "echo".into(),
                        arguments: r#"{"x":"again"}"#.into(),
                    },
                    ResponseEvent::Done,
                ])
            })
            .collect();
        scripts.push(ScriptedMockProvider::text_script("wrapping up"));
        let a = agent("a", ScriptedMockProvider::new(scripts), false);
        let small = TurnConfig {
            max_tool_iterations: 2,
            tool_call_timeout: Duration::from_secs(1),
        };
        let outcome = run_turn(
            &a,
            &names(),
            &mut st,
            &sink,
            &EchoTool,
            &Arc::new(ThoughtDelimiters::default()),
            &small,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));

        // Every ai tool-call message is answered by matching tool results.
        let msgs = st.messages();
        for (i, m) in msgs.iter().enumerate() {
            for call in &m.tool_calls {
                let answered = msgs[i + 1..]
                    .iter()
                    .any(|r| r.tool_call_id.as_deref() == Some(call.call_id.as_str()));
                assert!(answered, "call {} must be answered", call.call_id);
            }
        }
        // The budget note appears once the limit is hit.
        assert!(msgs
            .iter()
            .any(|m| m.role == Role::Tool && m.content.contains("budget")));
        // The last message is a plain ai wrap-up.
        let last = st.last_message().unwrap();
        assert_eq!(last.role, Role::Ai);
        assert!(last.tool_calls.is_empty());
    }

    #[test]
    fn agent_view_maps_peers_to_user_messages() {
        let mut st = state();
        st.push(Message::ai("b", "hi from b", 0));
        st.push(Message::ai_with_calls(
            "b",
            "",
            0,
            vec![ToolCallRecord {
                call_id: "bc1".into(),
                tool_name: "echo".into(),
                arguments: serde_json::json!({}),
            }],
        ));
        st.push(Message::tool_result("bc1", "peer tool output"));
        st.push(Message::ai("a", "hi from a", 0));

        let a = agent("a", ScriptedMockProvider::new(vec![]), false);
        let view = build_agent_view(&a, &names(), &st, &[]);

        // system, opening, b's utterance (as user), a's own assistant message.
        assert_eq!(view.len(), 4);
        assert_eq!(view[0].role, parley_model::Role::System);
        assert_eq!(view[1].role, parley_model::Role::User);
        assert_eq!(view[2].role, parley_model::Role::User);
        assert_eq!(view[2].content, "B: hi from b");
        assert_eq!(view[3].role, parley_model::Role::Assistant);
        assert_eq!(view[3].content, "hi from a");
        // b's tool scaffolding does not leak into a's view.
        assert!(!view.iter().any(|m| m.content.contains("peer tool output")));
    }

    #[test]
    fn agent_view_keeps_own_tool_structure() {
        let mut st = state();
        st.push(Message::ai_with_calls(
            "a",
            "",
            0,
            vec![ToolCallRecord {
                call_id: "ac1".into(),
                tool_name: "echo".into(),
                arguments: serde_json::json!({"x": 1}),
            }],
        ));
        st.push(Message::tool_result("ac1", "own result"));

        let a = agent("a", ScriptedMockProvider::new(vec![]), false);
        let view = build_agent_view(&a, &names(), &st, &[]);
        assert_eq!(view.len(), 4);
        assert_eq!(view[2].tool_calls.len(), 1);
        assert_eq!(view[3].role, parley_model::Role::Tool);
        assert_eq!(view[3].tool_call_id.as_deref(), Some("ac1"));
        assert_eq!(view[3].content, "own result");
    }

    #[test]
    fn finish_pending_drops_nameless_and_synthesizes_ids() {
        let mut pending = HashMap::new();
        pending.insert(
            1,
            PendingToolCall {
                id: String::new(),
                name: "late".into(),
                args_buf: "{}".into(),
            },
        );
        pending.insert(
            0,
            PendingToolCall {
                id: "c0".into(),
                name: String::new(),
                args_buf: "{}".into(),
            },
        );
        let calls = finish_pending(pending);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "late");
        assert!(calls[0].id.starts_with("call_synthetic_"));
    }

    #[test]
    fn finish_pending_recovers_from_bad_json() {
        let mut pending = HashMap::new();
        pending.insert(
            0,
            PendingToolCall {
                id: "c0".into(),
                name: "echo".into(),
                args_buf: "{not json".into(),
            },
        );
        let calls = finish_pending(pending);
        assert_eq!(calls[0].arguments, serde_json::json!({}));
    }

    #[test]
    fn preview_truncates_long_content() {
        let long = "x".repeat(500);
        let p = preview(&long);
        assert!(p.chars().count() <= RESULT_PREVIEW_LEN + 1);
        assert!(p.ends_with('…'));
        assert_eq!(preview("short"), "short");
    }

    #[tokio::test]
    async fn cycle_completion_is_reported() {
        let sink = EventSink::new(64);
        let mut snap = snapshot();
        snap.participating_agents = vec!["a".into()];
        let mut st = ConversationState::new(snap);
        st.cycle = CycleTracker::new(vec!["a".into()]);
        st.push(Message::human("a", "begin"));
        let a = agent("a", ScriptedMockProvider::always_text("only me"), false);
        let outcome = run_turn(
            &a,
            &names(),
            &mut st,
            &sink,
            &NoTools,
            &Arc::new(ThoughtDelimiters::default()),
            &cfg(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            outcome,
            TurnOutcome::Completed { cycle_completed: true, .. }
        ));
        assert_eq!(st.cycle.current_cycle(), 1);
    }
}
