//! Product import
//!
//! Products are fetched page by page from `products` and enriched one by one:
//! stock from `stockItems/{sku}`, media gallery flattened, custom attributes
//! lifted to the document root and configurable children expanded.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use super::{id_field, ImportAdapter};
use crate::models::{EntityType, ImportContext};
use crate::services::source_client::{SearchCriteria, SourceClient, SourceError, SourcePage};

/// Stock fields copied onto product documents
pub const STOCK_FIELDS: [&str; 9] = [
    "qty",
    "is_in_stock",
    "min_qty",
    "min_sale_qty",
    "max_sale_qty",
    "backorders",
    "qty_increments",
    "enable_qty_increments",
    "low_stock_date",
];

pub struct ProductAdapter {
    source: Arc<dyn SourceClient>,
}

impl ProductAdapter {
    pub fn new(source: Arc<dyn SourceClient>) -> Self {
        Self { source }
    }

    async fn fetch_children(&self, store_code: &str, sku: &str) -> Result<Vec<Value>, SourceError> {
        let children = self
            .source
            .get_single(store_code, &["configurable-products", sku, "children"])
            .await?;
        Ok(match children {
            Value::Array(children) => children,
            _ => Vec::new(),
        })
    }
}

/// Pick the documented stock fields out of a stock item
pub fn stock_document(stock_item: &Value) -> Value {
    let mut stock = Map::new();
    for field in STOCK_FIELDS {
        if let Some(value) = stock_item.get(field) {
            stock.insert(field.to_string(), value.clone());
        }
    }
    Value::Object(stock)
}

/// Lift `custom_attributes` entries onto the document root
///
/// Comma-separated lists of numeric option ids (multiselect values) become
/// arrays.
pub fn lift_custom_attributes(item: &mut Map<String, Value>) {
    let Some(Value::Array(attributes)) = item.remove("custom_attributes") else {
        return;
    };
    for attribute in attributes {
        let Some(code) = attribute.get("attribute_code").and_then(Value::as_str) else {
            continue;
        };
        let value = attribute.get("value").cloned().unwrap_or(Value::Null);
        item.insert(code.to_string(), split_multiselect(value));
    }
}

fn split_multiselect(value: Value) -> Value {
    match &value {
        Value::String(s) if s.contains(',') => {
            let parts: Vec<&str> = s.split(',').map(str::trim).collect();
            if parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())) {
                Value::Array(parts.into_iter().map(|p| Value::String(p.to_string())).collect())
            } else {
                value
            }
        }
        _ => value,
    }
}

/// Compact media gallery entries
fn media_gallery(entries: &[Value]) -> Value {
    Value::Array(
        entries
            .iter()
            .map(|media| {
                json!({
                    "image": media.get("file").cloned().unwrap_or(Value::Null),
                    "pos": media.get("position").cloned().unwrap_or(Value::Null),
                    "typ": media.get("media_type").cloned().unwrap_or(Value::Null),
                    "lab": media.get("label").cloned().unwrap_or(Value::Null),
                })
            })
            .collect(),
    )
}

fn configurable_child(child: &Value) -> Value {
    let mut doc = Map::new();
    for field in ["sku", "id", "status", "visibility", "name", "price", "tier_prices"] {
        if let Some(value) = child.get(field) {
            doc.insert(field.to_string(), value.clone());
        }
    }
    if let Some(special) = child.get("special_price").filter(|v| !v.is_null()) {
        doc.insert("special_price".to_string(), special.clone());
    }
    if let Some(Value::Array(attributes)) = child.get("custom_attributes") {
        doc.insert("custom_attributes".to_string(), Value::Array(attributes.clone()));
        lift_custom_attributes(&mut doc);
    }
    Value::Object(doc)
}

#[async_trait]
impl ImportAdapter for ProductAdapter {
    fn entity(&self) -> EntityType {
        EntityType::Product
    }

    fn collection_name(&self) -> &'static str {
        "product"
    }

    fn uses_paging(&self) -> bool {
        true
    }

    async fn source_data(&self, ctx: &ImportContext) -> Result<SourcePage, SourceError> {
        let mut criteria = SearchCriteria::new().paged(ctx.page, ctx.page_size);
        if let Some(ids) = &ctx.ids_filter {
            criteria = criteria.filter_in("entity_id", ids);
        }
        self.source.list(&ctx.store_code, &["products"], &criteria).await
    }

    async fn enrich_item(&self, ctx: &ImportContext, item: Value) -> Result<Value, SourceError> {
        let Value::Object(mut product) = item else {
            return Err(SourceError::Parse("product is not an object".into()));
        };
        let sku = product
            .get("sku")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SourceError::Parse("product without sku".into()))?;

        product.entry("special_price").or_insert(Value::Null);
        product
            .entry("bundle_product_options")
            .or_insert_with(|| Value::Array(Vec::new()));

        let stock_item = self
            .source
            .get_single(&ctx.store_code, &["stockItems", &sku])
            .await?;
        product.insert("stock".to_string(), stock_document(&stock_item));

        if let Some(Value::Array(entries)) = product.remove("media_gallery_entries") {
            product.insert("media_gallery".to_string(), media_gallery(&entries));
        }

        lift_custom_attributes(&mut product);
        if let Some(url_key) = product.get("url_key").cloned() {
            product.insert("slug".to_string(), url_key);
        }

        if product.get("type_id").and_then(Value::as_str) == Some("configurable") {
            match self.fetch_children(&ctx.store_code, &sku).await {
                Ok(children) => {
                    let min_price = children
                        .iter()
                        .filter_map(|c| c.get("price").and_then(Value::as_f64))
                        .filter(|p| *p > 0.0)
                        .fold(None, |min: Option<f64>, p| Some(min.map_or(p, |m| m.min(p))));
                    let children: Vec<Value> = children.iter().map(configurable_child).collect();
                    product.insert("configurable_children".to_string(), Value::Array(children));
                    if let Some(price) = min_price {
                        product.insert("price".to_string(), json!(price));
                    }
                }
                Err(e) => {
                    tracing::warn!(sku = %sku, error = %e, "Unable to expand configurable children");
                }
            }
        }

        Ok(Value::Object(product))
    }

    fn document_id(&self, item: &Value) -> Option<String> {
        id_field(item, "id")
    }

    fn label(&self, item: &Value) -> String {
        format!(
            "[({}) {}]",
            id_field(item, "id").unwrap_or_default(),
            item.get("sku").and_then(Value::as_str).unwrap_or_default()
        )
    }
}
