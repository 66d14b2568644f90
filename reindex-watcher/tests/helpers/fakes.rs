//! In-memory source and document store

use async_trait::async_trait;
use reindex_watcher::services::document_store::{DocumentStore, StoreError};
use reindex_watcher::services::source_client::{
    SearchCriteria, SourceClient, SourceError, SourcePage,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Catalog served from memory
///
/// Products are paged and filtered like the real search endpoint. Stock
/// lookups fail for SKUs listed in `broken_skus`.
#[derive(Default)]
pub struct FakeSource {
    pub products: Vec<Value>,
    pub category_tree: Option<Value>,
    pub broken_skus: HashSet<String>,
    /// Number of upcoming list calls that fail
    pub list_failures: Mutex<u32>,
    pub list_calls: Mutex<Vec<(String, SearchCriteria)>>,
    /// Time each list call takes
    pub list_delay: Duration,
    listing: AtomicUsize,
    max_listing: AtomicUsize,
}

impl FakeSource {
    /// Products with ids `1..=count` and SKUs `SKU-<id>`
    pub fn with_products(count: u64) -> Self {
        Self {
            products: (1..=count)
                .map(|id| json!({"id": id, "sku": format!("SKU-{}", id), "type_id": "simple", "name": format!("Product {}", id)}))
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_category_tree(tree: Value) -> Self {
        Self {
            category_tree: Some(tree),
            ..Self::default()
        }
    }

    pub fn break_sku(mut self, sku: &str) -> Self {
        self.broken_skus.insert(sku.to_string());
        self
    }

    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }

    /// Most list calls ever in flight at once
    pub fn max_concurrent_lists(&self) -> usize {
        self.max_listing.load(Ordering::SeqCst)
    }

    pub fn fail_next_lists(self, count: u32) -> Self {
        *self.list_failures.lock().unwrap() = count;
        self
    }

    /// List calls made against `path`
    pub fn calls_to(&self, path: &str) -> Vec<SearchCriteria> {
        self.list_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, c)| c.clone())
            .collect()
    }

    fn find_category(&self, id: &str) -> Option<Value> {
        let mut stack: Vec<&Value> = self.category_tree.iter().collect();
        while let Some(node) = stack.pop() {
            if node["id"].to_string() == id {
                return Some(node.clone());
            }
            if let Some(children) = node["children_data"].as_array() {
                stack.extend(children.iter());
            }
        }
        None
    }
}

#[async_trait]
impl SourceClient for FakeSource {
    async fn list(
        &self,
        _store_code: &str,
        path: &[&str],
        criteria: &SearchCriteria,
    ) -> Result<SourcePage, SourceError> {
        let path = path.join("/");
        self.list_calls
            .lock()
            .unwrap()
            .push((path.clone(), criteria.clone()));

        let listing = self.listing.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_listing.fetch_max(listing, Ordering::SeqCst);
        tokio::time::sleep(self.list_delay).await;
        self.listing.fetch_sub(1, Ordering::SeqCst);

        {
            let mut failures = self.list_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SourceError::Network("connection refused".into()));
            }
        }

        if path != "products" {
            return Err(SourceError::NotFound(path));
        }

        let filtered: Vec<Value> = match criteria.filters.iter().find(|f| f.field == "entity_id") {
            Some(filter) => {
                let ids: Vec<&str> = filter.value.split(',').collect();
                self.products
                    .iter()
                    .filter(|p| ids.contains(&p["id"].to_string().as_str()))
                    .cloned()
                    .collect()
            }
            None => self.products.clone(),
        };
        let total_count = filtered.len() as u64;

        let items = match (criteria.page, criteria.page_size) {
            (Some(page), Some(size)) => filtered
                .into_iter()
                .skip(((page.max(1) - 1) * size) as usize)
                .take(size as usize)
                .collect(),
            _ => filtered,
        };
        Ok(SourcePage { items, total_count })
    }

    async fn get_single(&self, _store_code: &str, path: &[&str]) -> Result<Value, SourceError> {
        match path {
            ["categories"] => self
                .category_tree
                .clone()
                .ok_or_else(|| SourceError::NotFound("categories".into())),
            ["categories", id] => self
                .find_category(id)
                .ok_or_else(|| SourceError::NotFound(format!("categories/{}", id))),
            ["stockItems", sku] if self.broken_skus.contains(*sku) => {
                Err(SourceError::Api(500, format!("stock lookup failed for {}", sku)))
            }
            ["stockItems", sku] => Ok(json!({"sku": sku, "qty": 10, "is_in_stock": true})),
            _ => Err(SourceError::NotFound(path.join("/"))),
        }
    }
}

/// Document store keeping documents in a map
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<HashMap<(String, String), Value>>,
    upserts: Mutex<Vec<(String, String)>>,
}

impl MemoryDocumentStore {
    pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.docs
            .lock()
            .unwrap()
            .get(&(collection.to_string(), id.to_string()))
            .cloned()
    }

    pub fn ids(&self, collection: &str) -> HashSet<String> {
        self.docs
            .lock()
            .unwrap()
            .keys()
            .filter(|(c, _)| c == collection)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Every upsert in call order
    pub fn upserts(&self) -> Vec<(String, String)> {
        self.upserts.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        document: &Value,
        overwrite: bool,
    ) -> Result<(), StoreError> {
        let key = (collection.to_string(), id.to_string());
        self.upserts.lock().unwrap().push(key.clone());

        let mut docs = self.docs.lock().unwrap();
        match (overwrite, docs.get_mut(&key), document.as_object()) {
            (false, Some(Value::Object(existing)), Some(fields)) => {
                for (field, value) in fields {
                    existing.insert(field.clone(), value.clone());
                }
            }
            _ => {
                docs.insert(key, document.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .docs
            .lock()
            .unwrap()
            .remove(&(collection.to_string(), id.to_string()))
            .is_some())
    }

    async fn count(&self, collection: &str, _query: Option<&Value>) -> Result<u64, StoreError> {
        Ok(self.ids(collection).len() as u64)
    }

    async fn delete_stale(&self, collection: &str, transaction_key: i64) -> Result<u64, StoreError> {
        let mut docs = self.docs.lock().unwrap();
        let before = docs.len();
        docs.retain(|(c, _), doc| c != collection || doc["tsk"] == json!(transaction_key));
        Ok((before - docs.len()) as u64)
    }
}
