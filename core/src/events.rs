//! Per-(thread_id, turn_id) event fan-out (spec §4.F).
//!
//! Grounded on `codex-mcp-server::outgoing_message::OutgoingMessageSender`'s
//! channel-per-correlation-id pattern, generalized from "one pending request"
//! to "one subscriber list per turn". Producers are the notification handler
//! wired into the app-server client; consumers are one-shot waiters (G) and
//! streaming relays (the CLI's `flow events` / future HTTP surface).

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use conductor_protocol::ThreadId;
use conductor_protocol::TurnId;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

const DEAD_LETTER_CAPACITY: usize = 256;
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub origin_timestamp: SystemTime,
}

type Key = (ThreadId, TurnId);

struct Registry {
    subscribers: HashMap<Key, mpsc::Sender<AgentEvent>>,
    dead_letters: VecDeque<AgentEvent>,
}

/// Fan-out hub for a single workspace supervisor's notification stream.
pub struct EventBuffer {
    inner: Mutex<Registry>,
}

impl Default for EventBuffer {
    fn default() -> Self {
        EventBuffer {
            inner: Mutex::new(Registry {
                subscribers: HashMap::new(),
                dead_letters: VecDeque::with_capacity(DEAD_LETTER_CAPACITY),
            }),
        }
    }
}

impl EventBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a subscriber for `(thread_id, turn_id)`. Must be called at
    /// turn start, before the agent can emit any event for that turn.
    pub async fn subscribe(&self, thread_id: ThreadId, turn_id: TurnId) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut registry = self.inner.lock().await;
        registry.subscribers.insert((thread_id, turn_id), tx);
        rx
    }

    pub async fn unsubscribe(&self, thread_id: &ThreadId, turn_id: &TurnId) {
        let mut registry = self.inner.lock().await;
        registry.subscribers.remove(&(thread_id.clone(), turn_id.clone()));
    }

    /// Publishes an event for `(thread_id, turn_id)`. Unknown keys (no
    /// subscriber registered, or a subscriber that failed to drain and was
    /// disconnected) fall through to the bounded dead-letter ring.
    pub async fn publish(
        &self,
        thread_id: ThreadId,
        turn_id: TurnId,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) {
        let event = AgentEvent {
            method: method.into(),
            params,
            origin_timestamp: SystemTime::now(),
        };
        let key = (thread_id, turn_id);
        let mut registry = self.inner.lock().await;
        let delivered = match registry.subscribers.get(&key) {
            Some(tx) => tx.try_send(event.clone()).is_ok(),
            None => false,
        };
        if !delivered {
            if registry.subscribers.contains_key(&key) {
                // Consumer exists but is not draining within its bounded
                // channel capacity: treat as backpressure-disconnected.
                registry.subscribers.remove(&key);
            }
            if registry.dead_letters.len() == DEAD_LETTER_CAPACITY {
                registry.dead_letters.pop_front();
            }
            registry.dead_letters.push_back(event);
        }
    }

    pub async fn dead_letter_count(&self) -> usize {
        self.inner.lock().await.dead_letters.len()
    }

    pub async fn is_subscribed(&self, thread_id: &ThreadId, turn_id: &TurnId) -> bool {
        self.inner
            .lock()
            .await
            .subscribers
            .contains_key(&(thread_id.clone(), turn_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_to_registered_subscriber() {
        let buf = EventBuffer::new();
        let thread_id = ThreadId("t1".to_string());
        let turn_id = TurnId("turn1".to_string());
        let mut rx = buf.subscribe(thread_id.clone(), turn_id.clone()).await;

        buf.publish(thread_id.clone(), turn_id.clone(), "item/completed", None).await;
        buf.publish(thread_id.clone(), turn_id.clone(), "turn/completed", None).await;

        let first = rx.recv().await.expect("first event");
        let second = rx.recv().await.expect("second event");
        assert_eq!(first.method, "item/completed");
        assert_eq!(second.method, "turn/completed");
    }

    #[tokio::test]
    async fn unknown_key_goes_to_dead_letter_ring() {
        let buf = EventBuffer::new();
        buf.publish(
            ThreadId("unknown".to_string()),
            TurnId("unknown".to_string()),
            "error",
            None,
        )
        .await;
        assert_eq!(buf.dead_letter_count().await, 1);
    }
}
