//! Event broker & SSE fan-out (spec Section 4.7).
//!
//! The one genuinely new piece of plumbing in this daemon: the teacher's
//! `server.rs` polls the store directly from each SSE handler, but Coven's
//! spec requires a single in-process broker that persists every event once
//! and fans it out live to many subscribers, emitting a `state.snapshot` on
//! subscribe and supporting `Last-Event-ID` replay. Built on
//! `tokio::sync::broadcast`, the standard fan-out primitive for this shape
//! of problem; a lagging subscriber's `RecvError::Lagged` is surfaced to
//! the SSE layer as a dropped-connection signal (spec 5: "slow subscribers
//! are dropped with a disconnected event").

use std::sync::Arc;
use std::time::Duration;

use coven_core::events::{HeartbeatPayload, StateSnapshotPayload};
use coven_core::{BrokerEvent, EventKind, Id};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::{Store, StoreError};

/// Bounded per-subscriber queue depth before a receiver is considered
/// lagging and dropped (spec 5).
const SUBSCRIBER_QUEUE_DEPTH: usize = 1024;

pub struct EventBroker {
    store: Arc<Store>,
    tx: broadcast::Sender<BrokerEvent>,
}

impl EventBroker {
    pub fn new(store: Arc<Store>) -> Self {
        let (tx, _rx) = broadcast::channel(SUBSCRIBER_QUEUE_DEPTH);
        Self { store, tx }
    }

    /// Persist `event` to the `events` bucket, then fan it out to any live
    /// subscribers. Persistence happens first so that a subscriber racing
    /// the broadcast against a `GET /events?after=` replay never sees a
    /// gap (spec 5: "Event emission... always follows the corresponding
    /// state persistence").
    pub async fn publish(&self, event: BrokerEvent) -> Result<(), StoreError> {
        self.store.append_event(&event.to_record()).await?;
        // No live subscribers is not an error; the event is still durable.
        let _ = self.tx.send(event);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }

    /// Build the `state.snapshot` event sent to every new subscriber
    /// before any incremental events (spec 4.7).
    pub async fn snapshot(&self) -> Result<BrokerEvent, StoreError> {
        let tasks = self.store.list_ready_tasks().await.unwrap_or_default();
        let agents = self.store.list_agents().await?;
        let workflows = self.store.list_workflows().await?;
        Ok(BrokerEvent::new(
            EventKind::StateSnapshot,
            "daemon",
            StateSnapshotPayload {
                tasks,
                agents,
                workflows,
            },
        ))
    }

    /// Replay persisted events strictly after `last_event_id` (spec 4.7,
    /// E6: "only events strictly after the ID are delivered").
    pub async fn replay_after(&self, last_event_id: &Id) -> Result<Vec<BrokerEvent>, StoreError> {
        let records = self.store.list_events_after(last_event_id).await?;
        Ok(records.iter().map(BrokerEvent::from).collect())
    }

    pub async fn trim_retained(&self, retention: Duration) -> Result<u64, StoreError> {
        self.store.trim_events(retention).await
    }
}

/// Runs the heartbeat loop until `cancel` fires: publishes a `heartbeat`
/// event every `interval` (spec 4.7 default 30 s; clients treat >35 s of
/// silence as a timeout).
pub async fn run_heartbeat(broker: Arc<EventBroker>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let event = BrokerEvent::new(EventKind::Heartbeat, "daemon", HeartbeatPayload { now: chrono::Utc::now() });
                if let Err(err) = broker.publish(event).await {
                    debug!(%err, "failed to publish heartbeat");
                }
            }
            () = cancel.cancelled() => {
                debug!("heartbeat loop stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coven_core::Task;
    use tempfile::TempDir;

    async fn new_store() -> (Arc<Store>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::new(&dir.path().join("coven.db")).await.unwrap();
        store.migrate_embedded().await.unwrap();
        (Arc::new(store), dir)
    }

    #[tokio::test]
    async fn publish_persists_and_broadcasts() {
        let (store, _dir) = new_store().await;
        let broker = EventBroker::new(Arc::clone(&store));
        let mut rx = broker.subscribe();

        let event = BrokerEvent::new(EventKind::Heartbeat, "daemon", HeartbeatPayload { now: chrono::Utc::now() });
        let id = event.id.clone();
        broker.publish(event).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id.to_string(), id.to_string());

        let replayed = broker.replay_after(&Id::from_string("0")).await.unwrap();
        assert!(replayed.iter().any(|e| e.id.to_string() == id.to_string()));
    }

    #[tokio::test]
    async fn replay_after_excludes_events_at_or_before_the_cursor() {
        let (store, _dir) = new_store().await;
        let broker = EventBroker::new(Arc::clone(&store));

        let first = BrokerEvent::new(EventKind::Heartbeat, "daemon", HeartbeatPayload { now: chrono::Utc::now() });
        let first_id = first.id.clone();
        broker.publish(first).await.unwrap();

        let second = BrokerEvent::new(EventKind::Heartbeat, "daemon", HeartbeatPayload { now: chrono::Utc::now() });
        let second_id = second.id.clone();
        broker.publish(second).await.unwrap();

        let replayed = broker.replay_after(&first_id).await.unwrap();
        assert!(replayed.iter().all(|e| e.id.to_string() != first_id.to_string()));
        assert!(replayed.iter().any(|e| e.id.to_string() == second_id.to_string()));
    }

    #[tokio::test]
    async fn snapshot_includes_ready_tasks() {
        let (store, _dir) = new_store().await;
        let broker = EventBroker::new(Arc::clone(&store));

        let now = chrono::Utc::now();
        let task = Task {
            id: Id::new(),
            parent_id: None,
            depth: 0,
            title: "t".into(),
            body: String::new(),
            task_type: "feature".into(),
            status: coven_core::TaskStatus::Open,
            priority: 2,
            tags: Default::default(),
            grimoire_hint: None,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        store.create_task(&task).await.unwrap();

        let snapshot = broker.snapshot().await.unwrap();
        assert_eq!(snapshot.kind, EventKind::StateSnapshot);
        assert_eq!(snapshot.payload["tasks"].as_array().unwrap().len(), 1);
    }
}
