//! Search-engine document store
//!
//! [`DocumentStore`] is the write side of the import. `ElasticsearchStore`
//! talks to Elasticsearch over its REST API; each logical collection maps to
//! the physical index `{index_prefix}_{collection}`.

use async_trait::async_trait;
use reindex_common::config::DocumentStoreConfig;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// Field every imported document carries with its run's transaction key
pub const TRANSACTION_KEY_FIELD: &str = "tsk";

/// Document store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Document store rejected request ({0}): {1}")]
    Rejected(u16, String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Write access to the search index
///
/// Upserts must be idempotent per document id.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Write a document
    ///
    /// `overwrite` replaces the stored document; otherwise fields are merged
    /// into it (creating it when missing).
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        document: &Value,
        overwrite: bool,
    ) -> Result<(), StoreError>;

    /// Returns false when the document did not exist
    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError>;

    /// Count documents matching `query` (all documents when `None`)
    async fn count(&self, collection: &str, query: Option<&Value>) -> Result<u64, StoreError>;

    /// Delete documents not stamped with `transaction_key`
    async fn delete_stale(&self, collection: &str, transaction_key: i64) -> Result<u64, StoreError>;
}

/// Query matching documents written by any run other than `transaction_key`
pub fn stale_query(transaction_key: i64) -> Value {
    json!({
        "bool": {
            "must_not": {
                "term": { TRANSACTION_KEY_FIELD: transaction_key }
            }
        }
    })
}

/// Elasticsearch REST implementation
pub struct ElasticsearchStore {
    http_client: reqwest::Client,
    base_url: String,
    index_prefix: String,
}

impl ElasticsearchStore {
    pub fn new(config: &DocumentStoreConfig) -> Result<Self, StoreError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StoreError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: config.url.trim_end_matches('/').to_string(),
            index_prefix: config.index_prefix.clone(),
        })
    }

    pub fn index_name(&self, collection: &str) -> String {
        format!("{}_{}", self.index_prefix, collection)
    }

    fn url(&self, collection: &str, tail: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.index_name(collection), tail)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
        request
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))
    }

    async fn json_body(response: reqwest::Response) -> Result<Value, StoreError> {
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(StoreError::Rejected(status.as_u16(), error_text));
        }
        response
            .json()
            .await
            .map_err(|e| StoreError::Parse(e.to_string()))
    }
}

/// Document ids may contain characters that are not path safe (SKUs)
fn encode_id(id: &str) -> String {
    let mut url = match reqwest::Url::parse("http://localhost") {
        Ok(url) => url,
        Err(_) => return id.to_string(),
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().push(id);
    }
    url.path().trim_start_matches('/').to_string()
}

#[async_trait]
impl DocumentStore for ElasticsearchStore {
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        document: &Value,
        overwrite: bool,
    ) -> Result<(), StoreError> {
        let request = if overwrite {
            self.http_client
                .put(self.url(collection, &format!("_doc/{}", encode_id(id))))
                .json(document)
        } else {
            self.http_client
                .post(self.url(collection, &format!("_update/{}", encode_id(id))))
                .json(&json!({ "doc": document, "doc_as_upsert": true }))
        };

        let response = self.send(request).await?;
        Self::json_body(response).await?;
        tracing::debug!(collection, id, overwrite, "Document upserted");
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let response = self
            .send(
                self.http_client
                    .delete(self.url(collection, &format!("_doc/{}", encode_id(id)))),
            )
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::json_body(response).await?;
        Ok(true)
    }

    async fn count(&self, collection: &str, query: Option<&Value>) -> Result<u64, StoreError> {
        let query = query.cloned().unwrap_or_else(|| json!({ "match_all": {} }));
        let response = self
            .send(
                self.http_client
                    .post(self.url(collection, "_count"))
                    .json(&json!({ "query": query })),
            )
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // Index not created yet
            return Ok(0);
        }
        let body = Self::json_body(response).await?;
        body.get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| StoreError::Parse("count response without 'count'".into()))
    }

    async fn delete_stale(&self, collection: &str, transaction_key: i64) -> Result<u64, StoreError> {
        let response = self
            .send(
                self.http_client
                    .post(self.url(collection, "_delete_by_query?conflicts=proceed"))
                    .json(&json!({ "query": stale_query(transaction_key) })),
            )
            .await?;
        let body = Self::json_body(response).await?;
        let deleted = body.get("deleted").and_then(Value::as_u64).unwrap_or(0);
        tracing::info!(collection, transaction_key, deleted, "Removed stale documents");
        Ok(deleted)
    }
}
