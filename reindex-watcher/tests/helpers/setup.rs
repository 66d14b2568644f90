//! Database and service setup

use reindex_common::config::TomlConfig;
use reindex_common::events::ReindexEvent;
use reindex_watcher::adapters::default_registry;
use reindex_watcher::Reindexer;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::broadcast::Receiver;

use super::{FakeSource, MemoryDocumentStore};

/// In-memory database with the full schema
pub async fn create_test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    reindex_common::db::create_schema(&pool)
        .await
        .expect("Failed to create schema");
    pool
}

/// Defaults with every delay shortened for tests
pub fn test_config() -> TomlConfig {
    let mut config = TomlConfig::default();
    config.worker.item_backoff_ms = 0;
    config.worker.job_backoff_ms = 0;
    config.worker.poll_interval_ms = 5;
    config.worker.max_lock_wait_ms = 1_000;
    config
}

pub async fn create_test_reindexer(
    config: &TomlConfig,
    source: Arc<FakeSource>,
    store: Arc<MemoryDocumentStore>,
) -> Reindexer {
    let pool = create_test_pool().await;
    Reindexer::new(pool, config, default_registry(source), store, None)
}

/// Everything broadcast so far
pub fn drain_events(rx: &mut Receiver<ReindexEvent>) -> Vec<ReindexEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
