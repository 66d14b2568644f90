//! Event types for the reindex event system
//!
//! Provides the shared event enum and an EventBus (tokio broadcast channel)
//! used by the scheduler, the import engine and the control API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Reindex event types
///
/// Broadcast via [`EventBus`]; serializable so they can be forwarded to
/// log sinks or HTTP clients as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ReindexEvent {
    /// A reindex job was created for the unclaimed ids
    JobCreated {
        job_id: i64,
        entity: String,
        store_code: String,
        /// Ids newly claimed by this job; `["full"]` for a full reindex
        ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// Every requested id already had a pending job
    JobSkipped {
        entity: String,
        store_code: String,
        ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// A worker claimed a job and started executing it
    JobStarted {
        job_id: i64,
        entity: String,
        store_code: String,
        pending_ids: usize,
        timestamp: DateTime<Utc>,
    },

    JobCompleted {
        job_id: i64,
        entity: String,
        store_code: String,
        timestamp: DateTime<Utc>,
    },

    JobFailed {
        job_id: i64,
        entity: String,
        store_code: String,
        error: String,
        /// True when no attempts remain
        terminal: bool,
        timestamp: DateTime<Utc>,
    },

    /// One source page was fetched and its items enqueued
    PageFetched {
        run_id: Uuid,
        entity: String,
        page: u32,
        page_count: u32,
        items: usize,
        timestamp: DateTime<Utc>,
    },

    /// An item was moved to the unstable queue after an enrichment failure
    ItemUnstable {
        run_id: Uuid,
        entity: String,
        label: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// An unstable item exhausted its retries and was dropped
    ItemDropped {
        run_id: Uuid,
        entity: String,
        label: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// An import run finished
    RunCompleted {
        run_id: Uuid,
        entity: String,
        store_code: String,
        transaction_key: i64,
        imported: usize,
        dropped: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },

    /// The watchdog saw no progress for a full window while work was active
    WorkerStalled {
        idle_secs: u64,
        timestamp: DateTime<Utc>,
    },
}

impl ReindexEvent {
    /// Short name of the variant, used as a log field
    pub fn kind(&self) -> &'static str {
        match self {
            ReindexEvent::JobCreated { .. } => "JobCreated",
            ReindexEvent::JobSkipped { .. } => "JobSkipped",
            ReindexEvent::JobStarted { .. } => "JobStarted",
            ReindexEvent::JobCompleted { .. } => "JobCompleted",
            ReindexEvent::JobFailed { .. } => "JobFailed",
            ReindexEvent::PageFetched { .. } => "PageFetched",
            ReindexEvent::ItemUnstable { .. } => "ItemUnstable",
            ReindexEvent::ItemDropped { .. } => "ItemDropped",
            ReindexEvent::RunCompleted { .. } => "RunCompleted",
            ReindexEvent::WorkerStalled { .. } => "WorkerStalled",
        }
    }
}

/// Broadcast bus for [`ReindexEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ReindexEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ReindexEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ReindexEvent,
    ) -> Result<usize, broadcast::error::SendError<ReindexEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ReindexEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dropped_event() -> ReindexEvent {
        ReindexEvent::ItemDropped {
            run_id: Uuid::new_v4(),
            entity: "product".to_string(),
            label: "[(7) SKU-7]".to_string(),
            error: "stock endpoint unavailable".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let event = dropped_event();
        assert_eq!(bus.emit(event.clone()).unwrap(), 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(16);
        assert!(bus.emit(dropped_event()).is_err());
        // Lossy emit never fails
        bus.emit_lossy(dropped_event());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(dropped_event()).unwrap();
        assert_eq!(json["type"], "ItemDropped");
        assert_eq!(json["entity"], "product");
        assert_eq!(dropped_event().kind(), "ItemDropped");
    }
}
