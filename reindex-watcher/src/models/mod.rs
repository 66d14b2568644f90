//! Data models

pub mod entity;
pub mod import_context;
pub mod job;
pub mod request;

pub use entity::{EntityType, Priority};
pub use import_context::{collection_for, ImportContext, RunSummary};
pub use job::{
    item_queue_name, reindex_queue_name, unstable_queue_name, BrokerJob, FailOutcome, ItemTask,
    JobPayload, JobState, NewJob, QueueCounts, QueueSelector,
};
pub use request::{normalize_ids, ReindexRequest, FULL_REINDEX};
