//! Product attribute metadata import

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::{id_field, retain_ids, ImportAdapter};
use crate::models::{EntityType, ImportContext};
use crate::services::source_client::{SearchCriteria, SourceClient, SourceError, SourcePage};

pub struct AttributeAdapter {
    source: Arc<dyn SourceClient>,
}

impl AttributeAdapter {
    pub fn new(source: Arc<dyn SourceClient>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ImportAdapter for AttributeAdapter {
    fn entity(&self) -> EntityType {
        EntityType::Attribute
    }

    fn collection_name(&self) -> &'static str {
        "attribute"
    }

    async fn source_data(&self, ctx: &ImportContext) -> Result<SourcePage, SourceError> {
        let page = self
            .source
            .list(&ctx.store_code, &["products", "attributes"], &SearchCriteria::new())
            .await?;
        let items = retain_ids(page.items, "attribute_id", ctx.ids_filter.as_deref());
        Ok(SourcePage {
            total_count: if ctx.is_full() { page.total_count } else { items.len() as u64 },
            items,
        })
    }

    async fn enrich_item(&self, _ctx: &ImportContext, mut item: Value) -> Result<Value, SourceError> {
        // Documents are keyed by the attribute id
        let attribute_id = item.get("attribute_id").cloned();
        if let (Some(map), Some(id)) = (item.as_object_mut(), attribute_id) {
            map.insert("id".to_string(), id);
        }
        Ok(item)
    }

    fn document_id(&self, item: &Value) -> Option<String> {
        id_field(item, "attribute_id")
    }

    fn label(&self, item: &Value) -> String {
        format!(
            "[({}) {}]",
            item.get("attribute_code").and_then(Value::as_str).unwrap_or_default(),
            item.get("default_frontend_label").and_then(Value::as_str).unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::{context, ScriptedSource};
    use serde_json::json;

    #[tokio::test]
    async fn test_targeted_run_filters_by_attribute_id() {
        let source = Arc::new(ScriptedSource::default().with_list(
            "products/attributes",
            json!({"items": [{"attribute_id": 93}, {"attribute_id": 142}], "total_count": 2}),
        ));
        let adapter = AttributeAdapter::new(source);
        let ctx = context(EntityType::Attribute, Some(vec!["142".into()]));
        let page = adapter.source_data(&ctx).await.unwrap();
        assert_eq!(page.items, vec![json!({"attribute_id": 142})]);
        assert_eq!(page.total_count, 1);

        let doc = adapter.enrich_item(&ctx, page.items[0].clone()).await.unwrap();
        assert_eq!(doc["id"], 142);
        assert_eq!(adapter.document_id(&doc), Some("142".into()));
    }
}
