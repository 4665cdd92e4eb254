use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::store::StreamEntry;

/// Metadata envelope attached to every queue event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub event_id: Uuid,
    /// Queue name the event belongs to.
    pub queue: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            version: 1,
            event_id: Uuid::now_v7(),
            queue: queue.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A queue event with metadata and payload.
#[derive(Clone, Debug)]
pub struct QueueEvent {
    pub meta: EventMeta,
    pub payload: QueueEventPayload,
}

impl QueueEvent {
    pub fn new(queue: impl Into<String>, payload: QueueEventPayload) -> Self {
        Self {
            meta: EventMeta::new(queue),
            payload,
        }
    }

    /// Decode an entry of the queue's durable event stream.
    ///
    /// Returns `None` for entries that carry no known event name.
    pub fn from_stream_entry(queue: impl Into<String>, entry: &StreamEntry) -> Option<Self> {
        let job_id = || entry.field("jobId").unwrap_or_default().to_string();
        let json = |name: &str| {
            entry
                .field(name)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(Value::Null)
        };
        let payload = match entry.field("event")? {
            "added" => QueueEventPayload::Added {
                job_id: job_id(),
                name: entry.field("name").unwrap_or_default().to_string(),
            },
            "waiting" => QueueEventPayload::Waiting {
                job_id: job_id(),
                prev: entry.field("prev").map(str::to_string),
            },
            "active" => QueueEventPayload::Active { job_id: job_id() },
            "progress" => QueueEventPayload::Progress {
                job_id: job_id(),
                data: json("data"),
            },
            "completed" => QueueEventPayload::Completed {
                job_id: job_id(),
                return_value: json("returnvalue"),
            },
            "failed" => QueueEventPayload::Failed {
                job_id: job_id(),
                reason: entry.field("failedReason").unwrap_or_default().to_string(),
            },
            "delayed" => QueueEventPayload::Delayed {
                job_id: job_id(),
                until: entry
                    .field("delay")
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or_default(),
            },
            "stalled" => QueueEventPayload::Stalled { job_id: job_id() },
            "removed" => QueueEventPayload::Removed { job_id: job_id() },
            "waiting-children" => QueueEventPayload::WaitingChildren { job_id: job_id() },
            "deduplicated" => QueueEventPayload::Deduplicated {
                job_id: job_id(),
                deduplication_id: entry
                    .field("deduplicationId")
                    .unwrap_or_default()
                    .to_string(),
            },
            "duplicated" => QueueEventPayload::Duplicated { job_id: job_id() },
            "drained" => QueueEventPayload::Drained,
            "paused" => QueueEventPayload::Paused,
            "resumed" => QueueEventPayload::Resumed,
            "cleaned" => QueueEventPayload::Cleaned {
                count: entry
                    .field("count")
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or_default(),
            },
            _ => return None,
        };
        Some(Self::new(queue, payload))
    }

    pub fn job_id(&self) -> Option<&str> {
        self.payload.job_id()
    }
}

/// Event payload emitted for job and queue transitions.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum QueueEventPayload {
    Added { job_id: String, name: String },
    /// Job entered `wait` or `prioritized`; `prev` names the state it left.
    Waiting { job_id: String, prev: Option<String> },
    Active { job_id: String },
    Progress { job_id: String, data: Value },
    Completed { job_id: String, return_value: Value },
    Failed { job_id: String, reason: String },
    /// Job moved to `delayed` until the given epoch millisecond.
    Delayed { job_id: String, until: i64 },
    Stalled { job_id: String },
    Removed { job_id: String },
    WaitingChildren { job_id: String },
    Deduplicated { job_id: String, deduplication_id: String },
    Duplicated { job_id: String },
    /// No more jobs waiting.
    Drained,
    Paused,
    Resumed,
    Cleaned { count: usize },
    /// A worker hit an error outside any single job's processing.
    Error { message: String },
}

impl QueueEventPayload {
    /// Event name as written to the durable stream.
    pub fn name(&self) -> &'static str {
        match self {
            QueueEventPayload::Added { .. } => "added",
            QueueEventPayload::Waiting { .. } => "waiting",
            QueueEventPayload::Active { .. } => "active",
            QueueEventPayload::Progress { .. } => "progress",
            QueueEventPayload::Completed { .. } => "completed",
            QueueEventPayload::Failed { .. } => "failed",
            QueueEventPayload::Delayed { .. } => "delayed",
            QueueEventPayload::Stalled { .. } => "stalled",
            QueueEventPayload::Removed { .. } => "removed",
            QueueEventPayload::WaitingChildren { .. } => "waiting-children",
            QueueEventPayload::Deduplicated { .. } => "deduplicated",
            QueueEventPayload::Duplicated { .. } => "duplicated",
            QueueEventPayload::Drained => "drained",
            QueueEventPayload::Paused => "paused",
            QueueEventPayload::Resumed => "resumed",
            QueueEventPayload::Cleaned { .. } => "cleaned",
            QueueEventPayload::Error { .. } => "error",
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            QueueEventPayload::Added { job_id, .. }
            | QueueEventPayload::Waiting { job_id, .. }
            | QueueEventPayload::Active { job_id }
            | QueueEventPayload::Progress { job_id, .. }
            | QueueEventPayload::Completed { job_id, .. }
            | QueueEventPayload::Failed { job_id, .. }
            | QueueEventPayload::Delayed { job_id, .. }
            | QueueEventPayload::Stalled { job_id }
            | QueueEventPayload::Removed { job_id }
            | QueueEventPayload::WaitingChildren { job_id }
            | QueueEventPayload::Deduplicated { job_id, .. }
            | QueueEventPayload::Duplicated { job_id } => Some(job_id),
            QueueEventPayload::Drained
            | QueueEventPayload::Paused
            | QueueEventPayload::Resumed
            | QueueEventPayload::Cleaned { .. }
            | QueueEventPayload::Error { .. } => None,
        }
    }
}

/// Generic event publisher trait for publishing events of type `E`.
#[async_trait]
pub trait EventPublisher<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Publish an event to all subscribers.
    async fn publish(&self, event: E) -> anyhow::Result<()>;
}

/// Generic event subscriber trait for receiving events of type `E`.
pub trait EventSubscriber<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Subscribe to events, returning a broadcast receiver.
    ///
    /// Multiple subscribers can receive the same events (fan-out).
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// In-process event bus using tokio broadcast channels.
///
/// Publishing never waits for slow subscribers. A subscriber that falls
/// more than `capacity` events behind receives `RecvError::Lagged` and
/// continues from the oldest retained event. Events do not leave the
/// process; the durable per-queue stream written by the scripts covers
/// out-of-process observers.
pub struct InProcEventBus<E = QueueEvent> {
    sender: broadcast::Sender<E>,
    capacity: usize,
}

impl<E> std::fmt::Debug for InProcEventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl<E> Clone for InProcEventBus<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            capacity: self.capacity,
        }
    }
}

impl<E: Clone + Send + Sync + 'static> InProcEventBus<E> {
    /// Create a bus buffering at most `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Send without awaiting. Events published with no subscriber are
    /// dropped.
    pub fn publish_now(&self, event: E) {
        let _ = self.sender.send(event);
    }
}

impl<E: Clone + Send + Sync + 'static> Default for InProcEventBus<E> {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl<E: Clone + Send + Sync + 'static> EventPublisher<E> for InProcEventBus<E> {
    async fn publish(&self, event: E) -> anyhow::Result<()> {
        self.publish_now(event);
        Ok(())
    }
}

impl<E: Clone + Send + Sync + 'static> EventSubscriber<E> for InProcEventBus<E> {
    fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn completed(id: &str) -> QueueEvent {
        QueueEvent::new(
            "mail",
            QueueEventPayload::Completed {
                job_id: id.into(),
                return_value: Value::from(1),
            },
        )
    }

    #[tokio::test]
    async fn test_event_bus_broadcast_to_multiple_subscribers() {
        let bus = InProcEventBus::new(100);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        for i in 0..5 {
            bus.publish(completed(&i.to_string())).await.unwrap();
        }

        for i in 0..5 {
            let a = timeout(Duration::from_millis(100), rx1.recv())
                .await
                .unwrap()
                .unwrap();
            let b = timeout(Duration::from_millis(100), rx2.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(a.job_id(), Some(i.to_string().as_str()));
            assert_eq!(b.job_id(), a.job_id());
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_doesnt_block_publisher() {
        let bus = InProcEventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(completed(&i.to_string())).await.unwrap();
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert_eq!(skipped, 3),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[test]
    fn test_event_bus_debug_format() {
        let bus = InProcEventBus::<QueueEvent>::new(100);
        let _rx = bus.subscribe();
        let debug = format!("{bus:?}");
        assert!(debug.contains("subscribers: 1"));
        assert!(debug.contains("capacity: 100"));
    }

    #[test]
    fn test_decode_stream_entries() {
        let entry = StreamEntry {
            id: "1-0".into(),
            fields: vec![
                ("event".into(), "completed".into()),
                ("jobId".into(), "7".into()),
                ("returnvalue".into(), r#"{"ok":true}"#.into()),
            ],
        };
        let event = QueueEvent::from_stream_entry("mail", &entry).unwrap();
        assert_eq!(event.meta.queue, "mail");
        assert_eq!(
            event.payload,
            QueueEventPayload::Completed {
                job_id: "7".into(),
                return_value: serde_json::json!({"ok": true}),
            }
        );

        let cleaned = StreamEntry {
            id: "2-0".into(),
            fields: vec![("event".into(), "cleaned".into()), ("count".into(), "4".into())],
        };
        let event = QueueEvent::from_stream_entry("mail", &cleaned).unwrap();
        assert_eq!(event.payload, QueueEventPayload::Cleaned { count: 4 });
        assert_eq!(event.payload.name(), "cleaned");
        assert_eq!(event.job_id(), None);

        let unknown = StreamEntry {
            id: "3-0".into(),
            fields: vec![("event".into(), "mystery".into())],
        };
        assert!(QueueEvent::from_stream_entry("mail", &unknown).is_none());
    }
}
