//! Reindex job creation
//!
//! A request only creates a job for ids that no pending job already covers.
//! The dedup set is the source of truth for which ids a job will process: the
//! job payload carries no ids, so ids added while a job waits are picked up
//! by that job.

use reindex_common::events::{EventBus, ReindexEvent};

use crate::db::broker::insert_job;
use crate::db::{Broker, DedupStore};
use crate::error::Result;
use crate::models::{reindex_queue_name, JobPayload, NewJob, ReindexRequest, FULL_REINDEX};
use crate::utils::db_retry::retry_on_lock;

/// Attempts per reindex job
pub const JOB_ATTEMPTS: u32 = 2;

#[derive(Clone)]
pub struct JobCreator {
    broker: Broker,
    dedup: DedupStore,
    events: EventBus,
    job_backoff_ms: u64,
    max_lock_wait_ms: u64,
}

impl JobCreator {
    pub fn new(
        broker: Broker,
        dedup: DedupStore,
        events: EventBus,
        job_backoff_ms: u64,
        max_lock_wait_ms: u64,
    ) -> Self {
        Self {
            broker,
            dedup,
            events,
            job_backoff_ms,
            max_lock_wait_ms,
        }
    }

    /// Create a reindex job for the unclaimed ids of `request`
    ///
    /// Returns `None` when every requested id is already pending. The dedup
    /// entries, the broker job and the status entries are written in one
    /// transaction.
    pub async fn create_reindex_job(&self, request: &ReindexRequest) -> Result<Option<i64>> {
        let unclaimed = self
            .dedup
            .compute_unclaimed(request.entity, &request.store_code, &request.ids)
            .await?;

        if !request.is_full() && unclaimed.is_empty() {
            tracing::info!(
                entity = %request.entity,
                store_code = %request.store_code,
                ids = ?request.ids,
                "All ids already pending, no job created"
            );
            self.events.emit_lossy(ReindexEvent::JobSkipped {
                entity: request.entity.to_string(),
                store_code: request.store_code.clone(),
                ids: request.ids.clone(),
                timestamp: chrono::Utc::now(),
            });
            return Ok(None);
        }

        let queue = reindex_queue_name(request.entity, &request.store_code, self.dedup.default_store_code());
        let payload = serde_json::to_value(JobPayload {
            entity: request.entity,
            store_code: request.store_code.clone(),
            priority: request.priority,
        })?;
        let job = NewJob::new(queue.as_str(), payload)
            .priority(request.priority.weight())
            .attempts(JOB_ATTEMPTS)
            .backoff_ms(self.job_backoff_ms);

        let job_id = retry_on_lock("create reindex job", self.max_lock_wait_ms, || async {
            let mut tx = self.broker.pool().begin().await?;
            self.dedup
                .enqueue_on(&mut *tx, request.entity, &request.store_code, &unclaimed)
                .await?;
            let job_id = insert_job(&mut *tx, &job).await?;
            // The "full" marker has no status entry; it is reported through the job itself
            let tracked: Vec<String> = unclaimed
                .iter()
                .filter(|id| id.as_str() != FULL_REINDEX)
                .cloned()
                .collect();
            self.dedup
                .record_status_on(&mut *tx, request.entity, &request.store_code, &tracked, job_id)
                .await?;
            tx.commit().await?;
            Ok(job_id)
        })
        .await?;

        tracing::info!(
            job_id,
            queue = %queue,
            entity = %request.entity,
            store_code = %request.store_code,
            priority = %request.priority.as_str(),
            ids = unclaimed.len(),
            "Reindex job created"
        );
        self.events.emit_lossy(ReindexEvent::JobCreated {
            job_id,
            entity: request.entity.to_string(),
            store_code: request.store_code.clone(),
            ids: unclaimed,
            timestamp: chrono::Utc::now(),
        });

        Ok(Some(job_id))
    }
}
