//! Import executor
//!
//! Maps an entity to its adapter and starts a bulk-import run with a fresh
//! transaction key. The executor never retries; job retries belong to the
//! broker.

use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use crate::adapters::{AdapterRegistry, ImportAdapter};
use crate::db::settings::next_transaction_key;
use crate::error::{ReindexError, Result};
use crate::models::{collection_for, EntityType, ImportContext, RunSummary};
use crate::services::bulk_import::BulkImportEngine;

#[derive(Clone)]
pub struct Executor {
    adapters: Arc<AdapterRegistry>,
    engine: BulkImportEngine,
    pool: SqlitePool,
    default_store_code: String,
}

impl Executor {
    pub fn new(
        adapters: AdapterRegistry,
        engine: BulkImportEngine,
        pool: SqlitePool,
        default_store_code: impl Into<String>,
    ) -> Self {
        Self {
            adapters: Arc::new(adapters),
            engine,
            pool,
            default_store_code: default_store_code.into(),
        }
    }

    pub fn adapter(&self, entity: EntityType) -> Option<Arc<dyn ImportAdapter>> {
        self.adapters.get(&entity).cloned()
    }

    pub fn supported_entities(&self) -> Vec<EntityType> {
        EntityType::ALL
            .iter()
            .copied()
            .filter(|entity| self.adapters.contains_key(entity))
            .collect()
    }

    /// Import `ids` of `entity` (everything when `None`)
    pub async fn run(
        &self,
        entity: EntityType,
        store_code: &str,
        ids: Option<Vec<String>>,
    ) -> Result<RunSummary> {
        let adapter = self
            .adapter(entity)
            .ok_or_else(|| ReindexError::UnsupportedEntity(entity.to_string()))?;

        let transaction_key = next_transaction_key(&self.pool).await?;
        let settings = self.engine.settings();
        let ctx = ImportContext {
            run_id: Uuid::new_v4(),
            entity,
            store_code: store_code.to_string(),
            is_default_store: store_code == self.default_store_code,
            collection: collection_for(adapter.collection_name(), store_code, &self.default_store_code),
            page: 1,
            page_size: settings.page_size,
            total_count: 0,
            page_count: 0,
            transaction_key,
            ids_filter: ids.filter(|ids| !ids.is_empty()),
            use_federated_mode: !adapter.uses_paging(),
            max_active_item_workers: settings.max_active_item_workers,
        };

        self.engine.run(adapter, ctx).await
    }
}
