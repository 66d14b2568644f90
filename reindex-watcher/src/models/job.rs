//! Broker job model and queue naming

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::entity::{EntityType, Priority};

/// Prefix of every reindex job queue
pub const REINDEX_QUEUE_PREFIX: &str = "queue:";

/// Lifecycle state of a broker job
///
/// Completed jobs are deleted from the broker; a lookup of a job that no
/// longer exists reports `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Inactive,
    Active,
    Delayed,
    Failed,
    Complete,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Inactive => "inactive",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Failed => "failed",
            JobState::Complete => "complete",
        }
    }

    /// Parse a persisted state column
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "inactive" => Some(JobState::Inactive),
            "active" => Some(JobState::Active),
            "delayed" => Some(JobState::Delayed),
            "failed" => Some(JobState::Failed),
            "complete" => Some(JobState::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job row as claimed from the broker
#[derive(Debug, Clone)]
pub struct BrokerJob {
    pub id: i64,
    pub queue_name: String,
    pub payload: Value,
    pub priority: i64,
    pub state: JobState,
    /// Attempts started so far, including the current one
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub run_at_ms: i64,
    pub last_error: Option<String>,
}

impl BrokerJob {
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// True when a failure of the current attempt is terminal
    pub fn is_last_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// A job to be inserted into the broker
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue_name: String,
    pub payload: Value,
    pub priority: i64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl NewJob {
    pub fn new(queue_name: impl Into<String>, payload: Value) -> Self {
        Self {
            queue_name: queue_name.into(),
            payload,
            priority: 0,
            max_attempts: 1,
            backoff_ms: 0,
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Fixed delay before a failed attempt becomes claimable again
    pub fn backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }
}

/// Result of failing an active job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Attempts remain; the job is delayed until `run_at_ms`
    Retrying { run_at_ms: i64 },
    /// No attempts remain; the job is parked in `failed`
    Failed,
}

impl FailOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailOutcome::Failed)
    }
}

/// Per-state job counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub inactive: u64,
    pub active: u64,
    pub delayed: u64,
    pub failed: u64,
}

impl QueueCounts {
    /// Jobs that will still be processed (inactive, active or delayed)
    pub fn pending(&self) -> u64 {
        self.inactive + self.active + self.delayed
    }
}

/// Which queues a broker operation applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueSelector {
    /// Every queue whose name starts with the prefix
    Prefix(String),
    /// Exactly the listed queues
    Names(Vec<String>),
}

impl QueueSelector {
    pub fn name(queue_name: impl Into<String>) -> Self {
        QueueSelector::Names(vec![queue_name.into()])
    }

    /// All reindex job queues, any store
    pub fn all_reindex_queues() -> Self {
        QueueSelector::Prefix(REINDEX_QUEUE_PREFIX.to_string())
    }

    /// Reindex job queues of a single store
    pub fn reindex_queues_for_store(store_code: &str, default_store_code: &str) -> Self {
        QueueSelector::Names(
            EntityType::ALL
                .iter()
                .map(|entity| reindex_queue_name(*entity, store_code, default_store_code))
                .collect(),
        )
    }
}

/// Payload of a reindex job
///
/// Ids are deliberately absent: the worker reads the live dedup set when it
/// claims the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub entity: EntityType,
    pub store_code: String,
    #[serde(default)]
    pub priority: Priority,
}

/// Payload of a per-item task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemTask {
    pub raw_item: Value,
    pub collection_name: String,
    /// Tree depth; 0 for top-level items
    #[serde(default)]
    pub depth: u32,
}

/// Store-scoped reindex queue: `queue:<entity>` or `queue:<entity>-<store>`
pub fn reindex_queue_name(entity: EntityType, store_code: &str, default_store_code: &str) -> String {
    if store_code == default_store_code {
        format!("{}{}", REINDEX_QUEUE_PREFIX, entity)
    } else {
        format!("{}{}-{}", REINDEX_QUEUE_PREFIX, entity, store_code)
    }
}

/// Per-item queue of a run: `items:<entity>:<collection>`
///
/// Entities sharing a collection (stock writes into `product`) keep
/// separate queues.
pub fn item_queue_name(entity: EntityType, collection: &str) -> String {
    format!("items:{}:{}", entity, collection)
}

/// Secondary queue for items whose enrichment failed
pub fn unstable_queue_name(entity: EntityType, collection: &str) -> String {
    format!("unstable:{}:{}", entity, collection)
}
