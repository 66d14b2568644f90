//! Scheduler and import services

pub mod bulk_import;
pub mod document_store;
pub mod executor;
pub mod job_creator;
pub mod source_client;
pub mod watchdog;
pub mod worker;

pub use bulk_import::{BulkImportEngine, ImportSettings};
pub use document_store::{DocumentStore, ElasticsearchStore};
pub use executor::Executor;
pub use job_creator::JobCreator;
pub use source_client::{MagentoClient, SourceClient};
pub use watchdog::{Heartbeat, Watchdog};
pub use worker::{Worker, WorkerHealth, WorkerSettings};
