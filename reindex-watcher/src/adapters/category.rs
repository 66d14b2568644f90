//! Category import
//!
//! A full run fetches the whole tree from `categories`; the engine flattens
//! `children_data` before queueing. Targeted runs fetch each category alone.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::product::lift_custom_attributes;
use super::{id_field, ImportAdapter};
use crate::models::{EntityType, ImportContext};
use crate::services::source_client::{SourceClient, SourceError, SourcePage};

pub struct CategoryAdapter {
    source: Arc<dyn SourceClient>,
}

impl CategoryAdapter {
    pub fn new(source: Arc<dyn SourceClient>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ImportAdapter for CategoryAdapter {
    fn entity(&self) -> EntityType {
        EntityType::Category
    }

    fn collection_name(&self) -> &'static str {
        "category"
    }

    async fn source_data(&self, ctx: &ImportContext) -> Result<SourcePage, SourceError> {
        match &ctx.ids_filter {
            None => {
                let tree = self.source.get_single(&ctx.store_code, &["categories"]).await?;
                Ok(SourcePage::from_value(tree))
            }
            Some(ids) => {
                let mut items = Vec::with_capacity(ids.len());
                for id in ids {
                    items.push(
                        self.source
                            .get_single(&ctx.store_code, &["categories", id])
                            .await?,
                    );
                }
                Ok(SourcePage {
                    total_count: items.len() as u64,
                    items,
                })
            }
        }
    }

    async fn enrich_item(&self, _ctx: &ImportContext, item: Value) -> Result<Value, SourceError> {
        let Value::Object(mut category) = item else {
            return Err(SourceError::Parse("category is not an object".into()));
        };
        lift_custom_attributes(&mut category);
        if let Some(url_key) = category.get("url_key").cloned() {
            category.insert("slug".to_string(), url_key);
        }
        Ok(Value::Object(category))
    }

    fn label(&self, item: &Value) -> String {
        format!(
            "[({}) {}]",
            id_field(item, "id").unwrap_or_default(),
            item.get("name").and_then(Value::as_str).unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::{context, ScriptedSource};
    use serde_json::json;

    #[tokio::test]
    async fn test_full_run_fetches_tree_root() {
        let source = Arc::new(ScriptedSource::default().with_single(
            "categories",
            json!({"id": 1, "name": "Root", "children_data": [{"id": 2}]}),
        ));
        let adapter = CategoryAdapter::new(source);
        let page = adapter
            .source_data(&context(EntityType::Category, None))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.total_count, 1);
    }

    #[tokio::test]
    async fn test_targeted_run_fetches_each_id() {
        let source = Arc::new(
            ScriptedSource::default()
                .with_single("categories/3", json!({"id": 3}))
                .with_single("categories/4", json!({"id": 4})),
        );
        let adapter = CategoryAdapter::new(source);
        let ctx = context(EntityType::Category, Some(vec!["3".into(), "4".into()]));
        let page = adapter.source_data(&ctx).await.unwrap();
        assert_eq!(page.items, vec![json!({"id": 3}), json!({"id": 4})]);
    }

    #[tokio::test]
    async fn test_enrich_sets_slug_from_url_key() {
        let adapter = CategoryAdapter::new(Arc::new(ScriptedSource::default()));
        let doc = adapter
            .enrich_item(
                &context(EntityType::Category, None),
                json!({"id": 5, "custom_attributes": [{"attribute_code": "url_key", "value": "gear"}]}),
            )
            .await
            .unwrap();
        assert_eq!(doc["slug"], "gear");
        assert_eq!(doc["url_key"], "gear");
    }
}
