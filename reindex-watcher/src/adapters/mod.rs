//! Entity import adapters
//!
//! The bulk-import engine is generic; everything entity specific (where the
//! records come from, how they are enriched, which collection they land in)
//! lives behind [`ImportAdapter`]. Adapters are stateless apart from the
//! source client they fetch through.

pub mod attribute;
pub mod category;
pub mod cms;
pub mod product;
pub mod review;
pub mod stock;
pub mod tax_rule;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{EntityType, ImportContext};
use crate::services::source_client::{SourceClient, SourceError, SourcePage};

pub use attribute::AttributeAdapter;
pub use category::CategoryAdapter;
pub use cms::{BlockAdapter, PageAdapter};
pub use product::ProductAdapter;
pub use review::ReviewAdapter;
pub use stock::StockAdapter;
pub use tax_rule::TaxRuleAdapter;

/// Per-entity capabilities used by the bulk-import engine
#[async_trait]
pub trait ImportAdapter: Send + Sync {
    fn entity(&self) -> EntityType;

    /// Logical collection name, before store scoping
    fn collection_name(&self) -> &'static str;

    /// Replace stored documents (true) or merge into them (false)
    fn should_overwrite(&self) -> bool {
        true
    }

    /// Fetch page by page; adapters that return false are fetched once
    fn uses_paging(&self) -> bool {
        false
    }

    /// Fetch the records of the context's current page
    async fn source_data(&self, ctx: &ImportContext) -> Result<SourcePage, SourceError>;

    /// Shape the raw page into the items that get queued
    fn prepare_items(&self, page: SourcePage) -> Vec<Value> {
        page.items
    }

    /// Turn one raw item into the document to store
    async fn enrich_item(&self, _ctx: &ImportContext, item: Value) -> Result<Value, SourceError> {
        Ok(item)
    }

    /// Document id in the store
    fn document_id(&self, item: &Value) -> Option<String> {
        id_field(item, "id")
    }

    /// Short human-readable description for logs
    fn label(&self, item: &Value) -> String {
        self.document_id(item)
            .map(|id| format!("{} {}", self.entity(), id))
            .unwrap_or_else(|| format!("{} <no id>", self.entity()))
    }
}

/// Read an id field that may be a number or a string
pub fn id_field(item: &Value, field: &str) -> Option<String> {
    match item.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Keep only items whose `field` is in `ids` (all items when `ids` is `None`)
///
/// Used by adapters whose source endpoint cannot filter by id.
pub fn retain_ids(items: Vec<Value>, field: &str, ids: Option<&[String]>) -> Vec<Value> {
    match ids {
        None => items,
        Some(ids) => items
            .into_iter()
            .filter(|item| {
                id_field(item, field)
                    .map(|id| ids.contains(&id))
                    .unwrap_or(false)
            })
            .collect(),
    }
}

/// Adapters keyed by entity
pub type AdapterRegistry = HashMap<EntityType, Arc<dyn ImportAdapter>>;

/// Every adapter shipped with the watcher
///
/// `category_products` has no adapter; jobs for it fail as unsupported.
pub fn default_registry(source: Arc<dyn SourceClient>) -> AdapterRegistry {
    let adapters: Vec<Arc<dyn ImportAdapter>> = vec![
        Arc::new(ProductAdapter::new(source.clone())),
        Arc::new(CategoryAdapter::new(source.clone())),
        Arc::new(AttributeAdapter::new(source.clone())),
        Arc::new(StockAdapter::new(source.clone())),
        Arc::new(TaxRuleAdapter::new(source.clone())),
        Arc::new(PageAdapter::new(source.clone())),
        Arc::new(BlockAdapter::new(source.clone())),
        Arc::new(ReviewAdapter::new(source)),
    ];

    adapters
        .into_iter()
        .map(|adapter| (adapter.entity(), adapter))
        .collect()
}
