//! Catalog source client
//!
//! The [`SourceClient`] trait is what adapters fetch through. `MagentoClient`
//! implements it against the Magento 2 REST API: bearer-token auth,
//! store-scoped URLs and `searchCriteria` query encoding.

use async_trait::async_trait;
use reindex_common::config::SourceConfig;
use reqwest::Url;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("reindex-watcher/", env!("CARGO_PKG_VERSION"));

/// Source client errors
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// One field filter of a search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub field: String,
    pub value: String,
    pub condition: String,
}

/// Paging and filters of a list request
///
/// Each filter becomes its own filter group, so filters are AND-ed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchCriteria {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub filters: Vec<Filter>,
}

impl SearchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paged(mut self, page: u32, page_size: u32) -> Self {
        self.page = Some(page);
        self.page_size = Some(page_size);
        self
    }

    pub fn filter(mut self, field: &str, value: impl Into<String>, condition: &str) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            value: value.into(),
            condition: condition.to_string(),
        });
        self
    }

    /// `field IN (ids)`
    pub fn filter_in(self, field: &str, ids: &[String]) -> Self {
        self.filter(field, ids.join(","), "in")
    }

    /// Query pairs in Magento `searchCriteria[...]` form
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (group, filter) in self.filters.iter().enumerate() {
            let prefix = format!("searchCriteria[filter_groups][{}][filters][0]", group);
            pairs.push((format!("{}[field]", prefix), filter.field.clone()));
            pairs.push((format!("{}[value]", prefix), filter.value.clone()));
            pairs.push((format!("{}[condition_type]", prefix), filter.condition.clone()));
        }
        if let Some(page) = self.page {
            pairs.push(("searchCriteria[currentPage]".to_string(), page.to_string()));
        }
        if let Some(page_size) = self.page_size {
            pairs.push(("searchCriteria[pageSize]".to_string(), page_size.to_string()));
        }
        if pairs.is_empty() {
            // Search endpoints reject a request without any criteria
            pairs.push(("searchCriteria".to_string(), String::new()));
        }
        pairs
    }
}

/// One page of source records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourcePage {
    pub items: Vec<Value>,
    pub total_count: u64,
}

impl SourcePage {
    /// Normalize the shapes list endpoints return
    ///
    /// - `{ items: [...], total_count }` search results
    /// - `[...]` plain arrays
    /// - a single object (e.g. the category tree root)
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut map) if map.contains_key("items") => {
                let items = match map.remove("items") {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                let total_count = map
                    .get("total_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(items.len() as u64);
                SourcePage { items, total_count }
            }
            Value::Array(items) => SourcePage {
                total_count: items.len() as u64,
                items,
            },
            Value::Null => SourcePage::default(),
            single => SourcePage {
                items: vec![single],
                total_count: 1,
            },
        }
    }
}

/// Read access to the catalog source
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// List records under `path` (e.g. `["products"]`) for a store
    async fn list(
        &self,
        store_code: &str,
        path: &[&str],
        criteria: &SearchCriteria,
    ) -> Result<SourcePage, SourceError>;

    /// Fetch one resource (e.g. `["categories", "5"]`)
    async fn get_single(&self, store_code: &str, path: &[&str]) -> Result<Value, SourceError>;
}

/// Magento 2 REST client
pub struct MagentoClient {
    http_client: reqwest::Client,
    base_url: Url,
    access_token: Option<String>,
    default_store_code: String,
}

impl MagentoClient {
    pub fn new(config: &SourceConfig, default_store_code: &str) -> Result<Self, SourceError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SourceError::Network(e.to_string()))?;

        let base_url = Url::parse(config.url.trim_end_matches('/'))
            .map_err(|e| SourceError::Config(format!("invalid source url '{}': {}", config.url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(SourceError::Config(format!("source url '{}' cannot be a base", config.url)));
        }

        Ok(Self {
            http_client,
            base_url,
            access_token: config.access_token.clone(),
            default_store_code: default_store_code.to_string(),
        })
    }

    /// `{base}/V1/{path}` for the default store, `{base}/{store}/V1/{path}` otherwise
    pub fn endpoint(&self, store_code: &str, path: &[&str]) -> Result<Url, SourceError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SourceError::Config("source url cannot be a base".into()))?;
            segments.pop_if_empty();
            if store_code != self.default_store_code {
                segments.push(store_code);
            }
            segments.push("V1");
            segments.extend(path);
        }
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<Value, SourceError> {
        tracing::debug!(url = %url, "Querying source API");

        let mut request = self.http_client.get(url.clone());
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound(url.path().to_string()));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(SourceError::Api(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))
    }
}

#[async_trait]
impl SourceClient for MagentoClient {
    async fn list(
        &self,
        store_code: &str,
        path: &[&str],
        criteria: &SearchCriteria,
    ) -> Result<SourcePage, SourceError> {
        let mut url = self.endpoint(store_code, path)?;
        url.query_pairs_mut().extend_pairs(criteria.to_query_pairs());
        Ok(SourcePage::from_value(self.get_json(url).await?))
    }

    async fn get_single(&self, store_code: &str, path: &[&str]) -> Result<Value, SourceError> {
        let url = self.endpoint(store_code, path)?;
        self.get_json(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> MagentoClient {
        let config = SourceConfig {
            url: "http://shop.test/rest/".to_string(),
            access_token: Some("token".to_string()),
            timeout_secs: 5,
        };
        MagentoClient::new(&config, "default").unwrap()
    }

    #[test]
    fn test_endpoint_is_store_scoped() {
        let client = client();
        assert_eq!(
            client.endpoint("default", &["products"]).unwrap().as_str(),
            "http://shop.test/rest/V1/products"
        );
        assert_eq!(
            client.endpoint("de", &["stockItems", "SKU 1/A"]).unwrap().as_str(),
            "http://shop.test/rest/de/V1/stockItems/SKU%201%2FA"
        );
    }

    #[test]
    fn test_criteria_query_pairs() {
        let criteria = SearchCriteria::new()
            .paged(2, 500)
            .filter_in("entity_id", &["1".to_string(), "2".to_string()]);
        let pairs = criteria.to_query_pairs();
        assert_eq!(
            pairs,
            vec![
                ("searchCriteria[filter_groups][0][filters][0][field]".to_string(), "entity_id".to_string()),
                ("searchCriteria[filter_groups][0][filters][0][value]".to_string(), "1,2".to_string()),
                ("searchCriteria[filter_groups][0][filters][0][condition_type]".to_string(), "in".to_string()),
                ("searchCriteria[currentPage]".to_string(), "2".to_string()),
                ("searchCriteria[pageSize]".to_string(), "500".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_criteria_still_sends_search_criteria() {
        assert_eq!(
            SearchCriteria::new().to_query_pairs(),
            vec![("searchCriteria".to_string(), String::new())]
        );
    }

    #[test]
    fn test_page_from_search_result() {
        let page = SourcePage::from_value(json!({
            "items": [{"id": 1}, {"id": 2}],
            "total_count": 1230
        }));
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total_count, 1230);
    }

    #[test]
    fn test_page_from_array_and_tree_root() {
        let page = SourcePage::from_value(json!([{"id": 1}]));
        assert_eq!(page.total_count, 1);

        let page = SourcePage::from_value(json!({"id": 1, "children_data": []}));
        assert_eq!(page.items, vec![json!({"id": 1, "children_data": []})]);
        assert_eq!(page.total_count, 1);

        assert_eq!(SourcePage::from_value(Value::Null), SourcePage::default());
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        let config = SourceConfig {
            url: "not a url".to_string(),
            access_token: None,
            timeout_secs: 5,
        };
        assert!(matches!(
            MagentoClient::new(&config, "default"),
            Err(SourceError::Config(_))
        ));
    }
}
