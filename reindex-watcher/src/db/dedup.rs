//! Dedup store
//!
//! Per-entity sets of ids that a current or future worker pass still owes.
//! Keys follow the persisted layout:
//!
//! - `i:<entity>:queue`  set of members
//! - `i:<entity>:status` hash member -> broker job id
//!
//! A member is `id` for the default store and `id:<storeCode>` for any other
//! store. Ids never contain `:` (rejected at request validation).

use reindex_common::Result;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashSet;

use crate::models::{EntityType, FULL_REINDEX};
use crate::utils::retry_on_lock;

/// Maximum bind parameters per IN (...) query
const CHUNK_SIZE: usize = 500;

pub fn set_key(entity: EntityType) -> String {
    format!("i:{}:queue", entity)
}

pub fn status_key(entity: EntityType) -> String {
    format!("i:{}:status", entity)
}

#[derive(Clone)]
pub struct DedupStore {
    pool: SqlitePool,
    default_store_code: String,
    max_lock_wait_ms: u64,
}

impl DedupStore {
    pub fn new(pool: SqlitePool, default_store_code: impl Into<String>, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            default_store_code: default_store_code.into(),
            max_lock_wait_ms,
        }
    }

    pub fn default_store_code(&self) -> &str {
        &self.default_store_code
    }

    pub fn is_default_store(&self, store_code: &str) -> bool {
        store_code == self.default_store_code
    }

    /// Persisted member for an id of a store
    pub fn encode_member(&self, id: &str, store_code: &str) -> String {
        if self.is_default_store(store_code) {
            id.to_string()
        } else {
            format!("{}:{}", id, store_code)
        }
    }

    fn decode_member(&self, member: &str, store_code: &str) -> Option<String> {
        match member.rsplit_once(':') {
            Some((id, store)) if store == store_code && !self.is_default_store(store_code) => {
                Some(id.to_string())
            }
            None if self.is_default_store(store_code) => Some(member.to_string()),
            _ => None,
        }
    }

    /// SQL predicate selecting the members of one store
    fn store_filter(&self, store_code: &str) -> (&'static str, Option<String>) {
        if self.is_default_store(store_code) {
            ("member NOT LIKE '%:%'", None)
        } else {
            let escaped = store_code
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            ("member LIKE ? ESCAPE '\\'", Some(format!("%:{}", escaped)))
        }
    }

    /// Ids of `requested` that no pending work covers yet
    ///
    /// An empty request means "everything" and yields `["full"]`. Otherwise
    /// ids already in the set are dropped; order of `requested` is kept.
    pub async fn compute_unclaimed(
        &self,
        entity: EntityType,
        store_code: &str,
        requested: &[String],
    ) -> Result<Vec<String>> {
        if requested.is_empty() {
            return Ok(vec![FULL_REINDEX.to_string()]);
        }

        let key = set_key(entity);
        let mut existing = HashSet::new();
        for chunk in requested.chunks(CHUNK_SIZE) {
            let members: Vec<String> = chunk
                .iter()
                .map(|id| self.encode_member(id, store_code))
                .collect();
            let placeholders = vec!["?"; members.len()].join(", ");
            let sql = format!(
                "SELECT member FROM kv_sets WHERE set_key = ? AND member IN ({placeholders})"
            );
            let mut query = sqlx::query_scalar::<_, String>(&sql).bind(&key);
            for member in &members {
                query = query.bind(member);
            }
            existing.extend(query.fetch_all(&self.pool).await?);
        }

        Ok(requested
            .iter()
            .filter(|id| !existing.contains(&self.encode_member(id, store_code)))
            .cloned()
            .collect())
    }

    /// Union-add ids to the set
    pub async fn enqueue(&self, entity: EntityType, store_code: &str, ids: &[String]) -> Result<()> {
        retry_on_lock("dedup enqueue", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin().await?;
            self.enqueue_on(&mut *tx, entity, store_code, ids).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// Union-add ids on an existing connection (usable inside a transaction)
    pub async fn enqueue_on(
        &self,
        conn: &mut SqliteConnection,
        entity: EntityType,
        store_code: &str,
        ids: &[String],
    ) -> Result<()> {
        let key = set_key(entity);
        for id in ids {
            sqlx::query("INSERT OR IGNORE INTO kv_sets (set_key, member) VALUES (?, ?)")
                .bind(&key)
                .bind(self.encode_member(id, store_code))
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// Record which broker job owns each id
    pub async fn record_status_on(
        &self,
        conn: &mut SqliteConnection,
        entity: EntityType,
        store_code: &str,
        ids: &[String],
        job_id: i64,
    ) -> Result<()> {
        let key = status_key(entity);
        for id in ids {
            sqlx::query(
                r#"
                INSERT INTO kv_hashes (hash_key, field, value) VALUES (?, ?, ?)
                ON CONFLICT(hash_key, field) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(&key)
            .bind(self.encode_member(id, store_code))
            .bind(job_id.to_string())
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// Remove ids and their status entries
    pub async fn dequeue(&self, entity: EntityType, store_code: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let set = set_key(entity);
        let status = status_key(entity);
        retry_on_lock("dedup dequeue", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin().await?;
            let mut removed = 0;
            for id in ids {
                let member = self.encode_member(id, store_code);
                removed += sqlx::query("DELETE FROM kv_sets WHERE set_key = ? AND member = ?")
                    .bind(&set)
                    .bind(&member)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                sqlx::query("DELETE FROM kv_hashes WHERE hash_key = ? AND field = ?")
                    .bind(&status)
                    .bind(&member)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(removed)
        })
        .await
    }

    /// Oldest pending ids of a store, at most `limit`
    pub async fn list(&self, entity: EntityType, store_code: &str, limit: usize) -> Result<Vec<String>> {
        let (filter, param) = self.store_filter(store_code);
        let sql = format!(
            "SELECT member FROM kv_sets WHERE set_key = ? AND {filter} ORDER BY id LIMIT ?"
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql).bind(set_key(entity));
        if let Some(param) = &param {
            query = query.bind(param);
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let members = query.bind(limit).fetch_all(&self.pool).await?;

        Ok(members
            .iter()
            .filter_map(|m| self.decode_member(m, store_code))
            .collect())
    }

    pub async fn pending_count(&self, entity: EntityType, store_code: &str) -> Result<u64> {
        let (filter, param) = self.store_filter(store_code);
        let sql = format!("SELECT COUNT(*) FROM kv_sets WHERE set_key = ? AND {filter}");
        let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(set_key(entity));
        if let Some(param) = &param {
            query = query.bind(param);
        }
        Ok(query.fetch_one(&self.pool).await?.max(0) as u64)
    }

    /// Owning broker job per id
    ///
    /// With no ids, reports every pending id of the store. Ids that are not
    /// pending are omitted.
    pub async fn status(
        &self,
        entity: EntityType,
        store_code: &str,
        ids: &[String],
    ) -> Result<Vec<(String, Option<i64>)>> {
        let ids = if ids.is_empty() {
            self.list(entity, store_code, usize::MAX).await?
        } else {
            ids.to_vec()
        };

        let mut statuses = Vec::new();
        for id in ids {
            let member = self.encode_member(&id, store_code);
            let pending: Option<i64> =
                sqlx::query_scalar("SELECT id FROM kv_sets WHERE set_key = ? AND member = ?")
                    .bind(set_key(entity))
                    .bind(&member)
                    .fetch_optional(&self.pool)
                    .await?;
            if pending.is_none() {
                continue;
            }
            let job: Option<String> =
                sqlx::query_scalar("SELECT value FROM kv_hashes WHERE hash_key = ? AND field = ?")
                    .bind(status_key(entity))
                    .bind(&member)
                    .fetch_optional(&self.pool)
                    .await?;
            statuses.push((id, job.and_then(|v| v.parse().ok())));
        }
        Ok(statuses)
    }

    /// Drop every pending id and status entry of every entity
    pub async fn clear_all(&self) -> Result<u64> {
        retry_on_lock("dedup clear", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin().await?;
            let removed = sqlx::query("DELETE FROM kv_sets WHERE set_key LIKE 'i:%:queue'")
                .execute(&mut *tx)
                .await?
                .rows_affected();
            sqlx::query("DELETE FROM kv_hashes WHERE hash_key LIKE 'i:%:status'")
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_store() -> DedupStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        reindex_common::db::create_schema(&pool).await.unwrap();
        DedupStore::new(pool, "default", 1000)
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_request_means_full() {
        let store = setup_store().await;
        let unclaimed = store
            .compute_unclaimed(EntityType::Category, "default", &[])
            .await
            .unwrap();
        assert_eq!(unclaimed, vec!["full"]);
    }

    #[tokio::test]
    async fn test_unclaimed_is_set_difference() {
        let store = setup_store().await;
        store.enqueue(EntityType::Product, "default", &ids(&["1", "2", "3"])).await.unwrap();

        let unclaimed = store
            .compute_unclaimed(EntityType::Product, "default", &ids(&["3", "4", "5"]))
            .await
            .unwrap();
        assert_eq!(unclaimed, vec!["4", "5"]);

        // Empty set returns the request unchanged
        let unclaimed = store
            .compute_unclaimed(EntityType::Review, "default", &ids(&["3", "4"]))
            .await
            .unwrap();
        assert_eq!(unclaimed, vec!["3", "4"]);
    }

    #[tokio::test]
    async fn test_stores_are_isolated() {
        let store = setup_store().await;
        store.enqueue(EntityType::Product, "default", &ids(&["1", "2"])).await.unwrap();
        store.enqueue(EntityType::Product, "de", &ids(&["2", "3"])).await.unwrap();

        assert_eq!(store.list(EntityType::Product, "default", 10).await.unwrap(), vec!["1", "2"]);
        assert_eq!(store.list(EntityType::Product, "de", 10).await.unwrap(), vec!["2", "3"]);
        assert!(store.list(EntityType::Product, "fr", 10).await.unwrap().is_empty());

        let unclaimed = store
            .compute_unclaimed(EntityType::Product, "de", &ids(&["1", "2"]))
            .await
            .unwrap();
        assert_eq!(unclaimed, vec!["1"]);
    }

    #[tokio::test]
    async fn test_list_is_bounded_and_oldest_first() {
        let store = setup_store().await;
        store.enqueue(EntityType::Page, "default", &ids(&["9", "3", "7"])).await.unwrap();
        store.enqueue(EntityType::Page, "default", &ids(&["3", "1"])).await.unwrap();

        assert_eq!(store.list(EntityType::Page, "default", 2).await.unwrap(), vec!["9", "3"]);
        assert_eq!(store.pending_count(EntityType::Page, "default").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_dequeue_removes_members_and_status() {
        let store = setup_store().await;
        let mut conn = store.pool.acquire().await.unwrap();
        store.enqueue_on(&mut conn, EntityType::Block, "de", &ids(&["5", "6"])).await.unwrap();
        store
            .record_status_on(&mut conn, EntityType::Block, "de", &ids(&["5", "6"]), 42)
            .await
            .unwrap();
        drop(conn);

        let status = store.status(EntityType::Block, "de", &[]).await.unwrap();
        assert_eq!(status, vec![("5".to_string(), Some(42)), ("6".to_string(), Some(42))]);

        assert_eq!(store.dequeue(EntityType::Block, "de", &ids(&["5"])).await.unwrap(), 1);
        let status = store.status(EntityType::Block, "de", &ids(&["5", "6"])).await.unwrap();
        assert_eq!(status, vec![("6".to_string(), Some(42))]);
    }

    #[tokio::test]
    async fn test_clear_all_resets_every_entity() {
        let store = setup_store().await;
        store.enqueue(EntityType::Product, "default", &ids(&["1"])).await.unwrap();
        store.enqueue(EntityType::Category, "de", &ids(&["full"])).await.unwrap();

        assert_eq!(store.clear_all().await.unwrap(), 2);
        assert_eq!(store.pending_count(EntityType::Product, "default").await.unwrap(), 0);
        assert_eq!(store.pending_count(EntityType::Category, "de").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_member_encoding() {
        let store = setup_store().await;
        assert_eq!(store.encode_member("10", "default"), "10");
        assert_eq!(store.encode_member("10", "de"), "10:de");
        assert_eq!(store.decode_member("10:de", "de").as_deref(), Some("10"));
        assert_eq!(store.decode_member("10", "de"), None);
        assert_eq!(store.decode_member("10:de", "default"), None);
        assert_eq!(set_key(EntityType::TaxRule), "i:tax_rule:queue");
        assert_eq!(status_key(EntityType::Product), "i:product:status");
    }
}
