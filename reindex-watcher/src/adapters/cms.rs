//! CMS page and block import
//!
//! Both come from a search endpoint that can filter by id, and both are
//! stored with a `type` marker so the frontend can tell them apart.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::{id_field, ImportAdapter};
use crate::models::{EntityType, ImportContext};
use crate::services::source_client::{SearchCriteria, SourceClient, SourceError, SourcePage};

struct CmsSource {
    source: Arc<dyn SourceClient>,
    resource: &'static str,
}

impl CmsSource {
    async fn fetch(&self, ctx: &ImportContext) -> Result<SourcePage, SourceError> {
        let mut criteria = SearchCriteria::new();
        if let Some(ids) = &ctx.ids_filter {
            criteria = criteria.filter_in("id", ids);
        }
        self.source
            .list(&ctx.store_code, &[self.resource, "search"], &criteria)
            .await
    }
}

fn tag(mut item: Value, kind: &str) -> Value {
    if let Some(map) = item.as_object_mut() {
        map.insert("type".to_string(), Value::String(kind.to_string()));
    }
    item
}

fn cms_label(item: &Value) -> String {
    format!(
        "[({}) - {}]",
        id_field(item, "id").unwrap_or_default(),
        item.get("identifier").and_then(Value::as_str).unwrap_or_default()
    )
}

pub struct PageAdapter {
    inner: CmsSource,
}

impl PageAdapter {
    pub fn new(source: Arc<dyn SourceClient>) -> Self {
        Self {
            inner: CmsSource {
                source,
                resource: "cmsPage",
            },
        }
    }
}

#[async_trait]
impl ImportAdapter for PageAdapter {
    fn entity(&self) -> EntityType {
        EntityType::Page
    }

    fn collection_name(&self) -> &'static str {
        "cms_page"
    }

    async fn source_data(&self, ctx: &ImportContext) -> Result<SourcePage, SourceError> {
        self.inner.fetch(ctx).await
    }

    async fn enrich_item(&self, _ctx: &ImportContext, item: Value) -> Result<Value, SourceError> {
        Ok(tag(item, "cms_page"))
    }

    fn label(&self, item: &Value) -> String {
        cms_label(item)
    }
}

pub struct BlockAdapter {
    inner: CmsSource,
}

impl BlockAdapter {
    pub fn new(source: Arc<dyn SourceClient>) -> Self {
        Self {
            inner: CmsSource {
                source,
                resource: "cmsBlock",
            },
        }
    }
}

#[async_trait]
impl ImportAdapter for BlockAdapter {
    fn entity(&self) -> EntityType {
        EntityType::Block
    }

    fn collection_name(&self) -> &'static str {
        "cms_block"
    }

    async fn source_data(&self, ctx: &ImportContext) -> Result<SourcePage, SourceError> {
        self.inner.fetch(ctx).await
    }

    async fn enrich_item(&self, _ctx: &ImportContext, item: Value) -> Result<Value, SourceError> {
        Ok(tag(item, "cms_block"))
    }

    fn label(&self, item: &Value) -> String {
        cms_label(item)
    }
}
