//! Stock import
//!
//! Stock is not a collection of its own: the stock fields are merged into the
//! existing product documents, so the adapter writes to `product` without
//! overwriting. Stock runs always target explicit product ids.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::product::stock_document;
use super::{id_field, ImportAdapter};
use crate::models::{EntityType, ImportContext};
use crate::services::source_client::{SearchCriteria, SourceClient, SourceError, SourcePage};

pub struct StockAdapter {
    source: Arc<dyn SourceClient>,
}

impl StockAdapter {
    pub fn new(source: Arc<dyn SourceClient>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ImportAdapter for StockAdapter {
    fn entity(&self) -> EntityType {
        EntityType::Stock
    }

    fn collection_name(&self) -> &'static str {
        "product"
    }

    fn should_overwrite(&self) -> bool {
        false
    }

    async fn source_data(&self, ctx: &ImportContext) -> Result<SourcePage, SourceError> {
        let Some(ids) = &ctx.ids_filter else {
            tracing::warn!(run_id = %ctx.run_id, "Stock import without product ids, nothing to do");
            return Ok(SourcePage::default());
        };
        let criteria = SearchCriteria::new().filter_in("entity_id", ids);
        let page = self.source.list(&ctx.store_code, &["products"], &criteria).await?;

        // Only the keys are needed; the rest of the product stays untouched
        let items: Vec<Value> = page
            .items
            .iter()
            .map(|product| json!({ "id": product.get("id"), "sku": product.get("sku") }))
            .collect();
        Ok(SourcePage {
            total_count: items.len() as u64,
            items,
        })
    }

    async fn enrich_item(&self, ctx: &ImportContext, item: Value) -> Result<Value, SourceError> {
        let sku = item
            .get("sku")
            .and_then(Value::as_str)
            .ok_or_else(|| SourceError::Parse("stock item without sku".into()))?;
        let stock_item = self
            .source
            .get_single(&ctx.store_code, &["stockItems", sku])
            .await?;
        Ok(json!({
            "id": item.get("id"),
            "sku": sku,
            "stock": stock_document(&stock_item),
        }))
    }

    fn label(&self, item: &Value) -> String {
        format!(
            "[({})]",
            item.get("sku").and_then(Value::as_str).unwrap_or_default()
        )
    }

    fn document_id(&self, item: &Value) -> Option<String> {
        id_field(item, "id")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::{context, ScriptedSource};

    #[tokio::test]
    async fn test_stock_merges_into_product_collection() {
        let source = Arc::new(
            ScriptedSource::default()
                .with_list(
                    "products",
                    json!({"items": [{"id": 7, "sku": "WS03", "name": "Iris"}], "total_count": 1}),
                )
                .with_single("stockItems/WS03", json!({"qty": 3, "is_in_stock": true})),
        );
        let adapter = StockAdapter::new(source);
        assert_eq!(adapter.collection_name(), "product");
        assert!(!adapter.should_overwrite());

        let ctx = context(EntityType::Stock, Some(vec!["7".into()]));
        let page = adapter.source_data(&ctx).await.unwrap();
        assert_eq!(page.items, vec![json!({"id": 7, "sku": "WS03"})]);

        let doc = adapter.enrich_item(&ctx, page.items[0].clone()).await.unwrap();
        assert_eq!(doc["stock"]["qty"], 3);
        assert!(doc.get("name").is_none());
    }

    #[tokio::test]
    async fn test_full_stock_run_is_empty() {
        let adapter = StockAdapter::new(Arc::new(ScriptedSource::default()));
        let page = adapter
            .source_data(&context(EntityType::Stock, None))
            .await
            .unwrap();
        assert!(page.items.is_empty());
    }
}
