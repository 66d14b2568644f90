//! Reindex requests

use serde::{Deserialize, Serialize};

use super::entity::{EntityType, Priority};
use crate::error::{ReindexError, Result};

/// Sentinel id meaning "reindex everything"
pub const FULL_REINDEX: &str = "full";

/// Separator between an id and its store code in dedup members
pub const STORE_SEPARATOR: char = ':';

/// A validated request to reindex `ids` of `entity` in `store_code`
///
/// An empty `ids` list is a full reindex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexRequest {
    pub entity: EntityType,
    pub ids: Vec<String>,
    pub store_code: String,
    pub priority: Priority,
}

impl ReindexRequest {
    pub fn new<I, S>(
        entity: EntityType,
        ids: I,
        store_code: impl Into<String>,
        priority: Priority,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let store_code = store_code.into().trim().to_string();
        if store_code.is_empty() {
            return Err(ReindexError::Validation("store code must not be empty".into()));
        }
        if store_code.contains(STORE_SEPARATOR) {
            return Err(ReindexError::Validation(format!(
                "store code '{}' must not contain '{}'",
                store_code, STORE_SEPARATOR
            )));
        }

        let ids = normalize_ids(ids);
        if let Some(bad) = ids.iter().find(|id| id.contains(STORE_SEPARATOR)) {
            return Err(ReindexError::Validation(format!(
                "id '{}' must not contain '{}'",
                bad, STORE_SEPARATOR
            )));
        }
        if ids.is_empty() && entity.requires_ids() {
            return Err(ReindexError::Validation(format!(
                "entity '{}' requires an explicit id list",
                entity
            )));
        }

        Ok(Self {
            entity,
            ids,
            store_code,
            priority,
        })
    }

    /// Build a request from raw CLI/API strings
    pub fn parse(
        entity: &str,
        ids_csv: Option<&str>,
        store_code: &str,
        priority: Option<&str>,
    ) -> Result<Self> {
        let entity: EntityType = entity.parse()?;
        let priority = match priority {
            Some(p) => p.parse()?,
            None => Priority::default(),
        };
        let ids: Vec<&str> = ids_csv.map(|csv| csv.split(',').collect()).unwrap_or_default();
        Self::new(entity, ids, store_code, priority)
    }

    pub fn is_full(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Trim ids, drop blanks and duplicates (first occurrence wins)
///
/// Any literal `full` turns the whole list into a full reindex (empty list).
pub fn normalize_ids<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut normalized = Vec::new();
    for id in ids {
        let id = id.as_ref().trim();
        if id.is_empty() {
            continue;
        }
        if id.eq_ignore_ascii_case(FULL_REINDEX) {
            return Vec::new();
        }
        if seen.insert(id.to_string()) {
            normalized.push(id.to_string());
        }
    }
    normalized
}
