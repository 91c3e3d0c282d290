//! Event Bus (C4): in-process pub/sub over typed events.
//!
//! Subscribers register a callback and get back an opaque id; `publish`
//! snapshots the subscriber set before delivering so a concurrent
//! unsubscribe can't drop a callback mid-iteration, delivers to all of
//! them concurrently, and isolates a failing subscriber from the rest.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CommandReceived,
    EvaluationStarted,
    EvaluationCompleted,
    ApprovalNeeded,
    ApprovalResolved,
    DaemonStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Event {
    fn new(kind: EventType, data: serde_json::Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn command_received(command: &str, working_dir: &str, client_pid: Option<u32>) -> Self {
        Self::new(
            EventType::CommandReceived,
            serde_json::json!({"command": command, "working_dir": working_dir, "client_pid": client_pid}),
        )
    }

    pub fn evaluation_started(command: &str, rule_count: usize) -> Self {
        Self::new(
            EventType::EvaluationStarted,
            serde_json::json!({"command": command, "rule_count": rule_count}),
        )
    }

    pub fn evaluation_completed(
        command: &str,
        decision: &str,
        rule_name: Option<&str>,
        reason: Option<&str>,
    ) -> Self {
        Self::new(
            EventType::EvaluationCompleted,
            serde_json::json!({
                "command": command,
                "decision": decision,
                "rule_name": rule_name,
                "reason": reason,
            }),
        )
    }

    pub fn approval_needed(
        approval_id: &str,
        command: &str,
        rule_name: &str,
        reason: &str,
        working_dir: Option<&str>,
        client_pid: Option<u32>,
    ) -> Self {
        Self::new(
            EventType::ApprovalNeeded,
            serde_json::json!({
                "approval_id": approval_id,
                "command": command,
                "rule_name": rule_name,
                "reason": reason,
                "working_dir": working_dir,
                "client_pid": client_pid,
            }),
        )
    }

    pub fn approval_resolved(
        approval_id: &str,
        approved: bool,
        reason: Option<&str>,
        working_dir: Option<&str>,
        client_pid: Option<u32>,
    ) -> Self {
        Self::new(
            EventType::ApprovalResolved,
            serde_json::json!({
                "approval_id": approval_id,
                "approved": approved,
                "reason": reason,
                "working_dir": working_dir,
                "client_pid": client_pid,
            }),
        )
    }

    pub fn daemon_status(
        status: &str,
        uptime_seconds: f64,
        commands_processed: u64,
        active_monitors: usize,
    ) -> Self {
        Self::new(
            EventType::DaemonStatus,
            serde_json::json!({
                "status": status,
                "uptime_seconds": uptime_seconds,
                "commands_processed": commands_processed,
                "active_monitors": active_monitors,
            }),
        )
    }
}

pub type SubscriptionId = uuid::Uuid;

type Callback = Arc<dyn Fn(Event) -> bool + Send + Sync>;

/// Single-process cooperative pub/sub. Callbacks run synchronously (they
/// are expected to be non-blocking hand-offs, e.g. pushing to a
/// connection's outbound queue) and return `true` on success; a
/// returning-`false` or panicking callback only affects its own delivery.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<SubscriptionId, Callback>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(Event) -> bool + Send + Sync + 'static,
    {
        let id = uuid::Uuid::new_v4();
        self.subscribers.lock().await.insert(id, Arc::new(callback));
        id
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.lock().await.remove(&id).is_some()
    }

    pub async fn clear(&self) -> usize {
        let mut subs = self.subscribers.lock().await;
        let count = subs.len();
        subs.clear();
        count
    }

    pub async fn subscriber_ids(&self) -> Vec<SubscriptionId> {
        self.subscribers.lock().await.keys().copied().collect()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Delivers `event` to a snapshot of the current subscriber set.
    /// Returns the number that returned `true` without panicking.
    pub async fn publish(&self, event: Event) -> usize {
        let snapshot: Vec<(SubscriptionId, Callback)> = {
            let subs = self.subscribers.lock().await;
            subs.iter().map(|(id, cb)| (*id, cb.clone())).collect()
        };

        let mut delivered = 0usize;
        for (id, callback) in snapshot {
            let event = event.clone();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(event)));
            match outcome {
                Ok(true) => delivered += 1,
                Ok(false) => {
                    tracing::warn!(subscriber = %id, "event delivery declined by subscriber");
                }
                Err(_) => {
                    tracing::warn!(subscriber = %id, "event subscriber panicked, isolating");
                }
            }
        }
        delivered
    }
}

/// Narrow publish-only capability handed to the approval manager and
/// evaluator, so they don't need a back-reference to the full bus
/// (breaks the server/approval-manager/bus cycle per the design notes).
pub type EventPublisher = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn publish_delivers_to_all_subscribers_in_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let log1 = log.clone();
        bus.subscribe(move |e| {
            log1.try_lock().unwrap().push(("a", e.kind));
            true
        })
        .await;
        let log2 = log.clone();
        bus.subscribe(move |e| {
            log2.try_lock().unwrap().push(("b", e.kind));
            true
        })
        .await;

        bus.publish(Event::command_received("ls", "/tmp", None)).await;
        let entries = log.lock().await;
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_| panic!("boom")).await;
        let d = delivered.clone();
        bus.subscribe(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
            true
        })
        .await;

        let count = bus.publish(Event::command_received("ls", "/tmp", None)).await;
        assert_eq!(count, 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let id = bus.subscribe(|_| true).await;
        assert!(bus.unsubscribe(id).await);
        assert!(!bus.unsubscribe(id).await);
    }

    #[tokio::test]
    async fn clear_removes_all_and_returns_count() {
        let bus = EventBus::new();
        bus.subscribe(|_| true).await;
        bus.subscribe(|_| true).await;
        assert_eq!(bus.clear().await, 2);
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
