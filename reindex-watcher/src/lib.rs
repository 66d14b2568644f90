//! reindex-watcher library interface
//!
//! Catalog reindex scheduler and bulk-import engine. Exposes the wiring used
//! by the `reindex-watcher` binary so integration tests can assemble the same
//! services around in-memory fakes.

pub mod adapters;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult, ReindexError, Result};

use axum::Router;
use chrono::{DateTime, Utc};
use reindex_common::config::TomlConfig;
use reindex_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use crate::adapters::AdapterRegistry;
use crate::db::{Broker, DedupStore};
use crate::services::{
    BulkImportEngine, DocumentStore, Executor, Heartbeat, ImportSettings, JobCreator, Watchdog,
    Worker, WorkerSettings,
};

/// Every service of one watcher process, sharing one pool and event bus
#[derive(Clone)]
pub struct Reindexer {
    pub pool: SqlitePool,
    pub broker: Broker,
    pub dedup: DedupStore,
    pub events: EventBus,
    pub heartbeat: Heartbeat,
    pub job_creator: JobCreator,
    pub executor: Executor,
    pub worker: Worker,
    watchdog_window: Duration,
}

impl Reindexer {
    /// Wire the services
    ///
    /// `store_code` restricts the worker to one store's queues.
    pub fn new(
        pool: SqlitePool,
        config: &TomlConfig,
        adapters: AdapterRegistry,
        document_store: Arc<dyn DocumentStore>,
        store_code: Option<String>,
    ) -> Self {
        let worker_config = &config.worker;
        let default_store_code = config.default_store_code.clone();
        let events = EventBus::default();
        let heartbeat = Heartbeat::new();
        let watchdog_window = Duration::from_secs(worker_config.watchdog_secs.max(1));

        // Reindex jobs of a process that stopped renewing them are reclaimable
        // after one watchdog window
        let broker = Broker::new(pool.clone(), worker_config.max_lock_wait_ms).with_lease(watchdog_window);
        let dedup = DedupStore::new(pool.clone(), default_store_code.clone(), worker_config.max_lock_wait_ms);
        let engine = BulkImportEngine::new(
            broker.clone(),
            document_store,
            events.clone(),
            heartbeat.clone(),
            ImportSettings::from_config(worker_config),
        );
        let executor = Executor::new(adapters, engine, pool.clone(), default_store_code);
        let job_creator = JobCreator::new(
            broker.clone(),
            dedup.clone(),
            events.clone(),
            worker_config.job_backoff_ms,
            worker_config.max_lock_wait_ms,
        );
        let worker = Worker::new(
            broker.clone(),
            dedup.clone(),
            executor.clone(),
            events.clone(),
            heartbeat.clone(),
            WorkerSettings::from_config(worker_config, store_code),
        );

        Self {
            pool,
            broker,
            dedup,
            events,
            heartbeat,
            job_creator,
            executor,
            worker,
            watchdog_window,
        }
    }

    /// Watchdog observing this process's heartbeat
    pub fn watchdog(&self) -> Watchdog {
        Watchdog::new(self.heartbeat.clone(), self.watchdog_window).with_events(self.events.clone())
    }
}

/// Application state shared across control API handlers
#[derive(Clone)]
pub struct AppState {
    pub worker: Worker,
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(worker: Worker, event_bus: EventBus) -> Self {
        Self {
            worker,
            event_bus,
            startup_time: Utc::now(),
        }
    }
}

/// Build the control API router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::control_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
