//! Tax rule import; every rule document carries its resolved tax rates

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::{id_field, retain_ids, ImportAdapter};
use crate::models::{EntityType, ImportContext};
use crate::services::source_client::{SearchCriteria, SourceClient, SourceError, SourcePage};

pub struct TaxRuleAdapter {
    source: Arc<dyn SourceClient>,
}

impl TaxRuleAdapter {
    pub fn new(source: Arc<dyn SourceClient>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ImportAdapter for TaxRuleAdapter {
    fn entity(&self) -> EntityType {
        EntityType::TaxRule
    }

    fn collection_name(&self) -> &'static str {
        "taxrule"
    }

    async fn source_data(&self, ctx: &ImportContext) -> Result<SourcePage, SourceError> {
        let page = self
            .source
            .list(&ctx.store_code, &["taxRules", "search"], &SearchCriteria::new())
            .await?;
        let items = retain_ids(page.items, "id", ctx.ids_filter.as_deref());
        Ok(SourcePage {
            total_count: if ctx.is_full() { page.total_count } else { items.len() as u64 },
            items,
        })
    }

    async fn enrich_item(&self, ctx: &ImportContext, mut item: Value) -> Result<Value, SourceError> {
        let rate_ids: Vec<String> = item
            .get("tax_rate_ids")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| match id {
                        Value::Number(n) => Some(n.to_string()),
                        Value::String(s) => Some(s.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut rates = Vec::with_capacity(rate_ids.len());
        for rate_id in &rate_ids {
            let mut rate = self
                .source
                .get_single(&ctx.store_code, &["taxRates", rate_id])
                .await?;
            // Rates come back as strings
            let parsed = rate
                .get("rate")
                .and_then(|r| r.as_str().and_then(|s| s.parse::<f64>().ok()).or_else(|| r.as_f64()));
            if let (Some(map), Some(parsed)) = (rate.as_object_mut(), parsed) {
                map.insert("rate".to_string(), Value::from(parsed));
            }
            rates.push(rate);
        }

        if let Some(map) = item.as_object_mut() {
            map.insert("rates".to_string(), Value::Array(rates));
        }
        Ok(item)
    }

    fn label(&self, item: &Value) -> String {
        format!(
            "[({}) {}]",
            id_field(item, "id").unwrap_or_default(),
            item.get("code").and_then(Value::as_str).unwrap_or_default()
        )
    }
}
