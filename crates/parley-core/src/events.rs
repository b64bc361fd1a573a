// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Observer events and the broadcast fabric that carries them.
//!
//! Publishing is fire-and-forget and never blocks the conversation driver:
//! every subscriber owns a bounded queue, the oldest entry is dropped on
//! overflow, and a per-subscriber counter records how many were lost.  Order
//! is preserved per subscriber; nothing is guaranteed across subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Started,
    Paused,
    Resumed,
    Stopped,
    Ended,
}

/// Self-describing records published to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A fragment of an agent's internal reasoning, streamed as it arrives.
    Thought {
        agent_id: String,
        chunk: String,
        timestamp: DateTime<Utc>,
    },
    /// An agent's final utterance for one turn.
    AgentMessage {
        agent_id: String,
        display_name: String,
        content: String,
        cycle: u32,
        timestamp: DateTime<Utc>,
    },
    /// The named agent's turn is starting.
    TurnIndicator { agent_id: String },
    ToolCall {
        agent_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    ToolResult {
        tool_name: String,
        result_preview: String,
        duration_ms: u64,
    },
    CycleUpdate {
        cycle: u32,
        participating: Vec<String>,
    },
    Lifecycle {
        kind: LifecycleKind,
        detail: String,
    },
    Error {
        kind: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        message: String,
    },
}

struct QueueState {
    buf: VecDeque<Event>,
    dropped: u64,
    closed: bool,
}

struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                buf: VecDeque::new(),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, event: Event) {
        {
            let mut st = self.state.lock().unwrap();
            if st.closed {
                return;
            }
            if st.buf.len() >= self.capacity {
                st.buf.pop_front();
                st.dropped += 1;
            }
            st.buf.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_one();
    }
}

/// A subscriber's pull handle.  Dropping it unsubscribes implicitly on the
/// next publish sweep via [`EventSink::unsubscribe`] by the owner; hosts that
/// want deterministic cleanup call `unsubscribe` themselves.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
    pub client_id: String,
}

impl Subscription {
    /// Receive the next event, waiting if none is queued.  Returns `None`
    /// once unsubscribed and the queue is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            {
                let mut st = self.queue.state.lock().unwrap();
                if let Some(ev) = st.buf.pop_front() {
                    return Some(ev);
                }
                if st.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.queue.state.lock().unwrap().buf.pop_front()
    }

    /// Events lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.queue.state.lock().unwrap().dropped
    }
}

/// Broadcast hub for observer events.
pub struct EventSink {
    subscribers: Mutex<HashMap<String, Arc<SubscriberQueue>>>,
    queue_capacity: usize,
}

impl EventSink {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            queue_capacity,
        }
    }

    /// Register a subscriber keyed by client id, replacing (and closing) any
    /// previous subscription under the same id.
    pub fn subscribe(&self, client_id: impl Into<String>) -> Subscription {
        let client_id = client_id.into();
        let queue = Arc::new(SubscriberQueue::new(self.queue_capacity));
        let old = self
            .subscribers
            .lock()
            .unwrap()
            .insert(client_id.clone(), Arc::clone(&queue));
        if let Some(old) = old {
            old.close();
        }
        Subscription { queue, client_id }
    }

    pub fn unsubscribe(&self, client_id: &str) {
        if let Some(q) = self.subscribers.lock().unwrap().remove(client_id) {
            q.close();
        }
    }

    /// Deliver `event` to every live subscriber.  Never blocks; a slow or
    /// failed subscriber only loses its own events.
    pub fn publish(&self, event: Event) {
        // Snapshot the subscriber list so per-queue pushes happen outside the
        // table lock.
        let queues: Vec<Arc<SubscriberQueue>> = {
            let subs = self.subscribers.lock().unwrap();
            subs.values().cloned().collect()
        };
        for q in &queues {
            q.push(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle(detail: &str) -> Event {
        Event::Lifecycle {
            kind: LifecycleKind::Started,
            detail: detail.into(),
        }
    }

    fn detail_of(ev: &Event) -> &str {
        match ev {
            Event::Lifecycle { detail, .. } => detail,
            _ => panic!("expected lifecycle event"),
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscriber_in_order() {
        let sink = EventSink::new(16);
        let mut sub = sink.subscribe("c1");
        sink.publish(lifecycle("one"));
        sink.publish(lifecycle("two"));
        assert_eq!(detail_of(&sub.recv().await.unwrap()), "one");
        assert_eq!(detail_of(&sub.recv().await.unwrap()), "two");
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let sink = EventSink::new(2);
        let mut sub = sink.subscribe("slow");
        sink.publish(lifecycle("a"));
        sink.publish(lifecycle("b"));
        sink.publish(lifecycle("c"));
        assert_eq!(sub.dropped(), 1);
        assert_eq!(detail_of(&sub.recv().await.unwrap()), "b");
        assert_eq!(detail_of(&sub.recv().await.unwrap()), "c");
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_affect_others() {
        let sink = EventSink::new(1);
        let mut fast = sink.subscribe("fast");
        let slow = sink.subscribe("slow");
        sink.publish(lifecycle("a"));
        assert_eq!(detail_of(&fast.recv().await.unwrap()), "a");
        sink.publish(lifecycle("b"));
        assert_eq!(detail_of(&fast.recv().await.unwrap()), "b");
        // The slow subscriber lost "a" but the fast one saw everything.
        assert_eq!(slow.dropped(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_ends_recv_with_none() {
        let sink = EventSink::new(4);
        let mut sub = sink.subscribe("c1");
        sink.publish(lifecycle("last"));
        sink.unsubscribe("c1");
        // Queued events still drain before the subscription reports closed.
        assert_eq!(detail_of(&sub.recv().await.unwrap()), "last");
        assert!(sub.recv().await.is_none());
        assert_eq!(sink.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn resubscribe_replaces_previous_queue() {
        let sink = EventSink::new(4);
        let mut old = sink.subscribe("c1");
        let mut new = sink.subscribe("c1");
        sink.publish(lifecycle("x"));
        assert!(old.recv().await.is_none(), "old subscription is closed");
        assert_eq!(detail_of(&new.recv().await.unwrap()), "x");
        assert_eq!(sink.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let sink = EventSink::new(4);
        sink.publish(lifecycle("nobody"));
        assert_eq!(sink.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn recv_wakes_on_later_publish() {
        let sink = Arc::new(EventSink::new(4));
        let mut sub = sink.subscribe("c1");
        let publisher = {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                sink.publish(lifecycle("later"));
            })
        };
        assert_eq!(detail_of(&sub.recv().await.unwrap()), "later");
        publisher.await.unwrap();
    }

    #[test]
    fn events_serialise_with_type_discriminator() {
        let json = serde_json::to_string(&Event::TurnIndicator {
            agent_id: "a".into(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"turn_indicator\""));
        let json = serde_json::to_string(&lifecycle("d")).unwrap();
        assert!(json.contains("\"type\":\"lifecycle\""));
        assert!(json.contains("\"kind\":\"started\""));
    }
}
