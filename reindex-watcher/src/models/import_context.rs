//! Per-run import state

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::EntityType;

/// Mutable state of one bulk-import run
///
/// Owned by the engine for the duration of the run. Adapters only read it.
#[derive(Debug, Clone)]
pub struct ImportContext {
    pub run_id: Uuid,
    pub entity: EntityType,
    pub store_code: String,
    pub is_default_store: bool,
    /// Store-scoped collection the documents are written to
    pub collection: String,
    /// 1-based page number
    pub page: u32,
    pub page_size: u32,
    pub total_count: u64,
    pub page_count: u32,
    /// Monotonic run identifier stamped on every document as `tsk`
    pub transaction_key: i64,
    /// `None` for a full reindex
    pub ids_filter: Option<Vec<String>>,
    /// Whole result set processed as one page
    pub use_federated_mode: bool,
    pub max_active_item_workers: usize,
}

impl ImportContext {
    pub fn is_full(&self) -> bool {
        self.ids_filter.is_none()
    }

    /// `ceil(total_count / page_size)`; federated runs have exactly one page
    pub fn compute_page_count(&self) -> u32 {
        if self.use_federated_mode || self.page_size == 0 {
            return 1;
        }
        let pages = self.total_count.div_ceil(self.page_size as u64);
        pages.max(1).min(u32::MAX as u64) as u32
    }

    pub fn has_more_pages(&self) -> bool {
        !self.use_federated_mode && self.page < self.page_count
    }
}

/// Store-scoped collection name: `name` for the default store, `{store}_{name}` otherwise
pub fn collection_for(name: &str, store_code: &str, default_store_code: &str) -> String {
    if store_code == default_store_code {
        name.to_string()
    } else {
        format!("{}_{}", store_code, name)
    }
}

/// Outcome of a completed run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub entity: String,
    pub store_code: String,
    pub transaction_key: i64,
    pub total_count: u64,
    pub pages_fetched: u32,
    pub items_enqueued: usize,
    pub imported: usize,
    /// Items routed to the unstable queue during the main pass
    pub unstable: usize,
    /// Unstable items that exhausted their retries
    pub dropped: usize,
    /// Items whose upsert failed on every attempt
    pub failed: usize,
    /// Documents removed by stale-record cleanup
    pub stale_removed: u64,
}

impl RunSummary {
    pub fn for_context(ctx: &ImportContext) -> Self {
        Self {
            run_id: ctx.run_id,
            entity: ctx.entity.to_string(),
            store_code: ctx.store_code.clone(),
            transaction_key: ctx.transaction_key,
            ..Self::default()
        }
    }

    /// Every enqueued item reached the document store
    pub fn is_clean(&self) -> bool {
        self.dropped == 0 && self.failed == 0
    }
}
