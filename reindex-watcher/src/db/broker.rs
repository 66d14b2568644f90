//! Durable job broker
//!
//! A persistent priority queue on top of the `broker_jobs` table. Every state
//! transition is a single SQL statement, so concurrent consumers in one or
//! several processes never claim the same job twice.
//!
//! Job lifecycle: `inactive -> active -> (deleted | delayed -> active ... | failed)`.

use reindex_common::time::now_millis;
use reindex_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::time::Duration;

use crate::models::{BrokerJob, FailOutcome, JobState, NewJob, QueueCounts, QueueSelector};
use crate::utils::retry_on_lock;

const JOB_COLUMNS: &str =
    "id, queue_name, payload, priority, state, attempts, max_attempts, backoff_ms, run_at, last_error";

/// Scope key for the reindex consumer pause flag
pub const REINDEX_PAUSE_SCOPE: &str = "reindex";

/// SQLite-backed broker handle
#[derive(Clone)]
pub struct Broker {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
    /// Active jobs not renewed within this many ms lose their exclusive claim
    lease_ms: Option<i64>,
}

impl Broker {
    pub fn new(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            max_lock_wait_ms,
            lease_ms: None,
        }
    }

    /// Expire exclusive claims that are not renewed within `lease`
    ///
    /// A process that dies mid-job leaves its job `active`; once the lease
    /// runs out the job can be claimed again and stops blocking its queue.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease_ms = Some(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX));
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a job in state `inactive`
    pub async fn create(&self, job: &NewJob) -> Result<i64> {
        retry_on_lock("broker create", self.max_lock_wait_ms, || async {
            let mut conn = self.pool.acquire().await?;
            insert_job(&mut *conn, job).await
        })
        .await
    }

    /// Insert several jobs in one transaction
    pub async fn create_batch(&self, jobs: &[NewJob]) -> Result<Vec<i64>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        retry_on_lock("broker create batch", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin().await?;
            let mut ids = Vec::with_capacity(jobs.len());
            for job in jobs {
                ids.push(insert_job(&mut *tx, job).await?);
            }
            tx.commit().await?;
            Ok(ids)
        })
        .await
    }

    /// Atomically claim the next runnable job matching `selector`
    ///
    /// Runnable means `inactive`, or `delayed` with an elapsed `run_at`.
    /// Jobs are ordered by priority weight, then insertion order. With
    /// `exclusive`, a queue that already has an active job is skipped, so at
    /// most one job per queue is ever active. An exclusive claim whose lease
    /// expired no longer blocks its queue and is itself claimable again.
    pub async fn claim(
        &self,
        selector: &QueueSelector,
        exclusive: bool,
    ) -> Result<Option<BrokerJob>> {
        let (clause, params) = selector_sql(selector, "j.queue_name");
        let (expired_clause, exclusive_clause) = if exclusive {
            (
                "OR (j.state = 'active' AND j.updated_at <= ?)",
                "AND NOT EXISTS (SELECT 1 FROM broker_jobs a WHERE a.queue_name = j.queue_name AND a.state = 'active' AND a.updated_at > ? AND a.id != j.id)",
            )
        } else {
            ("", "")
        };
        let sql = format!(
            r#"
            UPDATE broker_jobs
            SET state = 'active', attempts = attempts + 1, updated_at = ?
            WHERE id = (
                SELECT j.id FROM broker_jobs j
                WHERE {clause}
                  AND (j.state = 'inactive' OR (j.state = 'delayed' AND j.run_at <= ?) {expired_clause})
                  {exclusive_clause}
                ORDER BY j.priority ASC, j.id ASC
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let now = now_millis();
        let expired_before = match self.lease_ms {
            Some(lease_ms) => now.saturating_sub(lease_ms),
            None => i64::MIN,
        };
        let lease_params = if exclusive {
            vec![expired_before, expired_before]
        } else {
            Vec::new()
        };
        let row = retry_on_lock("broker claim", self.max_lock_wait_ms, || {
            self.claim_once(&sql, &params, now, &lease_params)
        })
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim_once(
        &self,
        sql: &str,
        params: &[String],
        now: i64,
        lease_params: &[i64],
    ) -> Result<Option<SqliteRow>> {
        let mut query = sqlx::query(sql).bind(now);
        for param in params {
            query = query.bind(param.as_str());
        }
        query = query.bind(now);
        for expired_before in lease_params {
            query = query.bind(*expired_before);
        }
        Ok(query.fetch_optional(&self.pool).await?)
    }

    /// Renew the lease of an active job; false when it is no longer active
    pub async fn touch(&self, job_id: i64) -> Result<bool> {
        retry_on_lock("broker touch", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                "UPDATE broker_jobs SET updated_at = ? WHERE id = ? AND state = 'active'",
            )
            .bind(now_millis())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    /// Acknowledge an active job; completed jobs are deleted
    pub async fn complete(&self, job_id: i64) -> Result<bool> {
        retry_on_lock("broker complete", self.max_lock_wait_ms, || async {
            let result = sqlx::query("DELETE FROM broker_jobs WHERE id = ?")
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    /// Record a failed attempt
    ///
    /// With attempts left the job is delayed by its fixed backoff; otherwise it
    /// is parked in `failed`.
    pub async fn fail(&self, job_id: i64, error: &str) -> Result<FailOutcome> {
        let now = now_millis();
        let row = retry_on_lock("broker fail", self.max_lock_wait_ms, || async {
            Ok(sqlx::query_as::<_, (String, i64)>(
                r#"
                UPDATE broker_jobs
                SET state = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'delayed' END,
                    run_at = CASE WHEN attempts >= max_attempts THEN run_at ELSE ? + backoff_ms END,
                    last_error = ?,
                    updated_at = ?
                WHERE id = ? AND state = 'active'
                RETURNING state, run_at
                "#,
            )
            .bind(now)
            .bind(error)
            .bind(now)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?)
        })
        .await?;

        match row {
            Some((state, _)) if state == "failed" => Ok(FailOutcome::Failed),
            Some((_, run_at_ms)) => Ok(FailOutcome::Retrying { run_at_ms }),
            None => Err(Error::NotFound(format!("active job {}", job_id))),
        }
    }

    /// Fail an active job without retry
    pub async fn bury(&self, job_id: i64, error: &str) -> Result<()> {
        let now = now_millis();
        let updated = retry_on_lock("broker bury", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                "UPDATE broker_jobs SET state = 'failed', last_error = ?, updated_at = ? WHERE id = ? AND state = 'active'",
            )
            .bind(error)
            .bind(now)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if updated == 0 {
            return Err(Error::NotFound(format!("active job {}", job_id)));
        }
        Ok(())
    }

    pub async fn get(&self, job_id: i64) -> Result<Option<BrokerJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM broker_jobs WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Current state of a job; jobs no longer present have completed
    pub async fn job_state(&self, job_id: i64) -> Result<JobState> {
        Ok(self
            .get(job_id)
            .await?
            .map(|job| job.state)
            .unwrap_or(JobState::Complete))
    }

    /// Per-state counts for the matching queues
    pub async fn counts(&self, selector: &QueueSelector) -> Result<QueueCounts> {
        let (clause, params) = selector_sql(selector, "queue_name");
        let sql = format!(
            "SELECT state, COUNT(*) AS n FROM broker_jobs WHERE {clause} GROUP BY state"
        );
        let mut query = sqlx::query(&sql);
        for param in &params {
            query = query.bind(param.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            let n = n.max(0) as u64;
            match JobState::from_db(&state) {
                Some(JobState::Inactive) => counts.inactive = n,
                Some(JobState::Active) => counts.active = n,
                Some(JobState::Delayed) => counts.delayed = n,
                Some(JobState::Failed) => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Jobs of a queue that will still be processed (inactive, active, delayed)
    pub async fn pending_count(&self, queue_name: &str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM broker_jobs WHERE queue_name = ? AND state IN ('inactive', 'active', 'delayed')",
        )
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(n.max(0) as u64)
    }

    /// Put active (possibly stuck) jobs back to `inactive`
    pub async fn requeue_active(&self, selector: &QueueSelector) -> Result<u64> {
        self.execute_matching(
            "broker requeue",
            selector,
            "UPDATE broker_jobs SET state = 'inactive' WHERE state = 'active' AND",
        )
        .await
    }

    /// Delete active (possibly stuck) jobs
    pub async fn remove_active(&self, selector: &QueueSelector) -> Result<u64> {
        self.execute_matching(
            "broker remove",
            selector,
            "DELETE FROM broker_jobs WHERE state = 'active' AND",
        )
        .await
    }

    /// Delete jobs that have not been claimed yet
    pub async fn clear_inactive(&self, selector: &QueueSelector) -> Result<u64> {
        self.execute_matching(
            "broker clear",
            selector,
            "DELETE FROM broker_jobs WHERE state = 'inactive' AND",
        )
        .await
    }

    /// Delete parked failed jobs
    pub async fn purge_failed(&self, selector: &QueueSelector) -> Result<u64> {
        self.execute_matching(
            "broker purge failed",
            selector,
            "DELETE FROM broker_jobs WHERE state = 'failed' AND",
        )
        .await
    }

    /// Run `<statement> <selector clause>` and return the affected row count
    async fn execute_matching(
        &self,
        operation: &str,
        selector: &QueueSelector,
        statement: &str,
    ) -> Result<u64> {
        let (clause, params) = selector_sql(selector, "queue_name");
        let sql = format!("{statement} {clause}");

        retry_on_lock(operation, self.max_lock_wait_ms, || async {
            let mut query = sqlx::query(&sql);
            for param in &params {
                query = query.bind(param.as_str());
            }
            Ok(query.execute(&self.pool).await?.rows_affected())
        })
        .await
    }

    /// Persist the pause flag for a consumer scope
    pub async fn set_paused(&self, scope: &str, paused: bool) -> Result<()> {
        retry_on_lock("broker pause flag", self.max_lock_wait_ms, || async {
            sqlx::query(
                r#"
                INSERT INTO queue_control (scope, paused, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
                ON CONFLICT(scope) DO UPDATE SET paused = excluded.paused, updated_at = CURRENT_TIMESTAMP
                "#,
            )
            .bind(scope)
            .bind(paused)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn is_paused(&self, scope: &str) -> Result<bool> {
        let paused: Option<bool> =
            sqlx::query_scalar("SELECT paused FROM queue_control WHERE scope = ?")
                .bind(scope)
                .fetch_optional(&self.pool)
                .await?;
        Ok(paused.unwrap_or(false))
    }
}

/// Insert a job on an existing connection (usable inside a transaction)
pub async fn insert_job(conn: &mut SqliteConnection, job: &NewJob) -> Result<i64> {
    let now = now_millis();
    let payload = serde_json::to_string(&job.payload)?;
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO broker_jobs
            (queue_name, payload, priority, state, attempts, max_attempts, backoff_ms, run_at, created_at, updated_at)
        VALUES (?, ?, ?, 'inactive', 0, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(&job.queue_name)
    .bind(payload)
    .bind(job.priority)
    .bind(job.max_attempts as i64)
    .bind(job.backoff_ms as i64)
    .bind(now)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    tracing::debug!(job_id = id, queue = %job.queue_name, priority = job.priority, "Job created");
    Ok(id)
}

/// SQL predicate and bind values for a queue selector
fn selector_sql(selector: &QueueSelector, column: &str) -> (String, Vec<String>) {
    match selector {
        QueueSelector::Prefix(prefix) => {
            let escaped = prefix
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            (
                format!("{column} LIKE ? ESCAPE '\\'"),
                vec![format!("{escaped}%")],
            )
        }
        QueueSelector::Names(names) if names.is_empty() => ("0".to_string(), Vec::new()),
        QueueSelector::Names(names) => {
            let placeholders = vec!["?"; names.len()].join(", ");
            (format!("{column} IN ({placeholders})"), names.clone())
        }
    }
}

fn job_from_row(row: &SqliteRow) -> Result<BrokerJob> {
    let payload: String = row.try_get("payload")?;
    let state: String = row.try_get("state")?;
    let attempts: i64 = row.try_get("attempts")?;
    let max_attempts: i64 = row.try_get("max_attempts")?;
    let backoff_ms: i64 = row.try_get("backoff_ms")?;

    Ok(BrokerJob {
        id: row.try_get("id")?,
        queue_name: row.try_get("queue_name")?,
        payload: serde_json::from_str(&payload)?,
        priority: row.try_get("priority")?,
        state: JobState::from_db(&state)
            .ok_or_else(|| Error::Internal(format!("unknown job state '{}'", state)))?,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        backoff_ms: backoff_ms.max(0) as u64,
        run_at_ms: row.try_get("run_at")?,
        last_error: row.try_get("last_error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_broker() -> Broker {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        reindex_common::db::create_schema(&pool).await.unwrap();
        Broker::new(pool, 1000)
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_fifo() {
        let broker = setup_broker().await;
        let low = broker.create(&NewJob::new("queue:a", json!({"n": 1})).priority(10)).await.unwrap();
        let first_normal = broker.create(&NewJob::new("queue:b", json!({"n": 2}))).await.unwrap();
        let critical = broker.create(&NewJob::new("queue:c", json!({"n": 3})).priority(-15)).await.unwrap();
        let second_normal = broker.create(&NewJob::new("queue:d", json!({"n": 4}))).await.unwrap();

        let selector = QueueSelector::all_reindex_queues();
        let mut order = Vec::new();
        while let Some(job) = broker.claim(&selector, false).await.unwrap() {
            assert_eq!(job.state, JobState::Active);
            assert_eq!(job.attempts, 1);
            order.push(job.id);
        }

        assert_eq!(order, vec![critical, first_normal, second_normal, low]);
    }

    #[tokio::test]
    async fn test_exclusive_claim_allows_one_active_per_queue() {
        let broker = setup_broker().await;
        broker.create(&NewJob::new("queue:product", json!({}))).await.unwrap();
        broker.create(&NewJob::new("queue:product", json!({}))).await.unwrap();
        broker.create(&NewJob::new("queue:category", json!({}))).await.unwrap();

        let selector = QueueSelector::all_reindex_queues();
        let first = broker.claim(&selector, true).await.unwrap().unwrap();
        let second = broker.claim(&selector, true).await.unwrap().unwrap();
        assert_ne!(first.queue_name, second.queue_name);
        assert!(broker.claim(&selector, true).await.unwrap().is_none());

        // Completing frees the queue for its next job
        let product = if first.queue_name == "queue:product" { first } else { second };
        assert!(broker.complete(product.id).await.unwrap());
        let next = broker.claim(&selector, true).await.unwrap().unwrap();
        assert_eq!(next.queue_name, "queue:product");
    }

    #[tokio::test]
    async fn test_fail_delays_then_parks_after_max_attempts() {
        let broker = setup_broker().await;
        let id = broker
            .create(&NewJob::new("items:product", json!({})).attempts(2).backoff_ms(0))
            .await
            .unwrap();
        let selector = QueueSelector::name("items:product");

        let job = broker.claim(&selector, false).await.unwrap().unwrap();
        assert!(!job.is_last_attempt());
        let outcome = broker.fail(job.id, "boom").await.unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { .. }));
        assert_eq!(broker.job_state(id).await.unwrap(), JobState::Delayed);

        let job = broker.claim(&selector, false).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert!(job.is_last_attempt());
        assert_eq!(broker.fail(job.id, "boom again").await.unwrap(), FailOutcome::Failed);

        let parked = broker.get(id).await.unwrap().unwrap();
        assert_eq!(parked.state, JobState::Failed);
        assert_eq!(parked.last_error.as_deref(), Some("boom again"));
        assert!(broker.claim(&selector, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_job_waits_for_backoff() {
        let broker = setup_broker().await;
        broker
            .create(&NewJob::new("items:page", json!({})).attempts(3).backoff_ms(60_000))
            .await
            .unwrap();
        let selector = QueueSelector::name("items:page");

        let job = broker.claim(&selector, false).await.unwrap().unwrap();
        broker.fail(job.id, "transient").await.unwrap();

        assert!(broker.claim(&selector, false).await.unwrap().is_none());
        assert_eq!(broker.pending_count("items:page").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_lease_releases_queue() {
        let broker = setup_broker().await.with_lease(Duration::from_secs(60));
        let orphan = broker.create(&NewJob::new("queue:product", json!({}))).await.unwrap();
        let waiting = broker.create(&NewJob::new("queue:product", json!({}))).await.unwrap();

        let selector = QueueSelector::all_reindex_queues();
        assert_eq!(broker.claim(&selector, true).await.unwrap().unwrap().id, orphan);
        assert!(broker.claim(&selector, true).await.unwrap().is_none());

        // A renewed lease keeps the queue blocked
        assert!(broker.touch(orphan).await.unwrap());
        assert!(broker.claim(&selector, true).await.unwrap().is_none());

        // The owner died long ago
        sqlx::query("UPDATE broker_jobs SET updated_at = 0 WHERE id = ?")
            .bind(orphan)
            .execute(broker.pool())
            .await
            .unwrap();
        let reclaimed = broker.claim(&selector, true).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, orphan);
        assert_eq!(reclaimed.attempts, 2);
        assert!(broker.claim(&selector, true).await.unwrap().is_none());

        assert!(broker.complete(orphan).await.unwrap());
        assert_eq!(broker.claim(&selector, true).await.unwrap().unwrap().id, waiting);
    }

    #[tokio::test]
    async fn test_without_lease_active_job_keeps_queue() {
        let broker = setup_broker().await;
        let orphan = broker.create(&NewJob::new("queue:product", json!({}))).await.unwrap();
        broker.create(&NewJob::new("queue:product", json!({}))).await.unwrap();

        let selector = QueueSelector::all_reindex_queues();
        broker.claim(&selector, true).await.unwrap().unwrap();
        sqlx::query("UPDATE broker_jobs SET updated_at = 0 WHERE id = ?")
            .bind(orphan)
            .execute(broker.pool())
            .await
            .unwrap();
        assert!(broker.claim(&selector, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_requires_active_job() {
        let broker = setup_broker().await;
        let id = broker.create(&NewJob::new("queue:x", json!({}))).await.unwrap();
        assert!(matches!(broker.fail(id, "nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_completed_job_reports_complete() {
        let broker = setup_broker().await;
        let id = broker.create(&NewJob::new("queue:x", json!({}))).await.unwrap();
        assert_eq!(broker.job_state(id).await.unwrap(), JobState::Inactive);

        let job = broker.claim(&QueueSelector::name("queue:x"), true).await.unwrap().unwrap();
        broker.complete(job.id).await.unwrap();
        assert_eq!(broker.job_state(id).await.unwrap(), JobState::Complete);
    }

    #[tokio::test]
    async fn test_counts_requeue_remove_clear() {
        let broker = setup_broker().await;
        for _ in 0..3 {
            broker.create(&NewJob::new("queue:product", json!({}))).await.unwrap();
        }
        broker.create(&NewJob::new("items:product", json!({}))).await.unwrap();

        let selector = QueueSelector::all_reindex_queues();
        broker.claim(&selector, false).await.unwrap().unwrap();
        broker.claim(&selector, false).await.unwrap().unwrap();

        let counts = broker.counts(&selector).await.unwrap();
        assert_eq!(counts, QueueCounts { inactive: 1, active: 2, delayed: 0, failed: 0 });

        assert_eq!(broker.requeue_active(&selector).await.unwrap(), 2);
        assert_eq!(broker.counts(&selector).await.unwrap().inactive, 3);

        broker.claim(&selector, false).await.unwrap().unwrap();
        assert_eq!(broker.remove_active(&selector).await.unwrap(), 1);
        assert_eq!(broker.clear_inactive(&selector).await.unwrap(), 2);
        assert_eq!(broker.counts(&selector).await.unwrap().pending(), 0);

        // Item queue untouched by the reindex selector
        assert_eq!(broker.pending_count("items:product").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_prefix_selector_escapes_like_wildcards() {
        let broker = setup_broker().await;
        broker.create(&NewJob::new("items:de_product", json!({}))).await.unwrap();
        broker.create(&NewJob::new("items:deXproduct", json!({}))).await.unwrap();

        let counts = broker
            .counts(&QueueSelector::Prefix("items:de_".to_string()))
            .await
            .unwrap();
        assert_eq!(counts.inactive, 1);
    }

    #[tokio::test]
    async fn test_batch_create_and_pause_flag() {
        let broker = setup_broker().await;
        let jobs: Vec<_> = (0..5)
            .map(|n| NewJob::new("items:category", json!({ "n": n })))
            .collect();
        let ids = broker.create_batch(&jobs).await.unwrap();
        assert_eq!(ids.len(), 5);
        assert_eq!(broker.pending_count("items:category").await.unwrap(), 5);

        assert!(!broker.is_paused(REINDEX_PAUSE_SCOPE).await.unwrap());
        broker.set_paused(REINDEX_PAUSE_SCOPE, true).await.unwrap();
        assert!(broker.is_paused(REINDEX_PAUSE_SCOPE).await.unwrap());
        broker.set_paused(REINDEX_PAUSE_SCOPE, false).await.unwrap();
        assert!(!broker.is_paused(REINDEX_PAUSE_SCOPE).await.unwrap());
    }
}
