//! Product review import

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::{id_field, ImportAdapter};
use crate::models::{EntityType, ImportContext};
use crate::services::source_client::{SearchCriteria, SourceClient, SourceError, SourcePage};

pub struct ReviewAdapter {
    source: Arc<dyn SourceClient>,
}

impl ReviewAdapter {
    pub fn new(source: Arc<dyn SourceClient>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ImportAdapter for ReviewAdapter {
    fn entity(&self) -> EntityType {
        EntityType::Review
    }

    fn collection_name(&self) -> &'static str {
        "review"
    }

    fn uses_paging(&self) -> bool {
        true
    }

    async fn source_data(&self, ctx: &ImportContext) -> Result<SourcePage, SourceError> {
        let mut criteria = SearchCriteria::new().paged(ctx.page, ctx.page_size);
        if let Some(ids) = &ctx.ids_filter {
            criteria = criteria.filter_in("review_id", ids);
        }
        self.source.list(&ctx.store_code, &["reviews"], &criteria).await
    }

    async fn enrich_item(&self, _ctx: &ImportContext, mut item: Value) -> Result<Value, SourceError> {
        // Ratings are only needed as a flat list of percentages
        let ratings: Option<Vec<Value>> = item.get("ratings").and_then(Value::as_array).map(|ratings| {
            ratings
                .iter()
                .filter_map(|r| r.get("percent").cloned())
                .collect()
        });
        if let (Some(map), Some(ratings)) = (item.as_object_mut(), ratings) {
            map.insert("rating_percents".to_string(), Value::Array(ratings));
        }
        Ok(item)
    }

    fn label(&self, item: &Value) -> String {
        format!(
            "[({}) {}]",
            id_field(item, "id").unwrap_or_default(),
            item.get("title").and_then(Value::as_str).unwrap_or_default()
        )
    }
}
