//! Reindex job worker
//!
//! Runs `max_active_jobs` consumer slots against the reindex queues. A slot
//! claims the next job exclusively (never two active jobs on one queue),
//! reads the ids the job covers from the dedup set and hands them to the
//! [`Executor`]. Ids are only removed from the dedup set once their run
//! succeeded or their job has no attempts left.

use reindex_common::config::WorkerConfig;
use reindex_common::events::{EventBus, ReindexEvent};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::db::broker::insert_job;
use crate::db::{Broker, DedupStore, REINDEX_PAUSE_SCOPE};
use crate::error::{ReindexError, Result};
use crate::models::{
    BrokerJob, EntityType, FailOutcome, JobPayload, JobState, NewJob, QueueSelector, FULL_REINDEX,
};
use crate::services::executor::Executor;
use crate::services::job_creator::JOB_ATTEMPTS;
use crate::services::watchdog::Heartbeat;
use crate::utils::retry_on_lock;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_active_jobs: usize,
    pub poll_interval: Duration,
    /// Maximum ids handed to one run
    pub dedup_page_limit: usize,
    pub job_backoff_ms: u64,
    pub max_lock_wait_ms: u64,
    /// Only drain this store's queues
    pub store_code: Option<String>,
    /// Claim lease of a running job; renewed four times per lease
    pub lease: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &WorkerConfig, store_code: Option<String>) -> Self {
        Self {
            max_active_jobs: config.max_active_jobs.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            dedup_page_limit: config.dedup_page_limit.max(1),
            job_backoff_ms: config.job_backoff_ms,
            max_lock_wait_ms: config.max_lock_wait_ms,
            store_code,
            lease: Duration::from_secs(config.watchdog_secs.max(1)),
        }
    }
}

/// Broker job counts plus whether a run is executing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerHealth {
    pub inactive_jobs: u64,
    pub active_jobs: u64,
    pub delayed_jobs: u64,
    pub failed_jobs: u64,
    pub busy: bool,
    pub paused: bool,
}

/// Pending state of one id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdStatus {
    pub id: String,
    pub job_id: Option<i64>,
    pub state: Option<JobState>,
}

struct BusyGuard(Arc<AtomicUsize>);

impl BusyGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct Worker {
    broker: Broker,
    dedup: DedupStore,
    executor: Executor,
    events: EventBus,
    heartbeat: Heartbeat,
    settings: WorkerSettings,
    busy: Arc<AtomicUsize>,
}

impl Worker {
    pub fn new(
        broker: Broker,
        dedup: DedupStore,
        executor: Executor,
        events: EventBus,
        heartbeat: Heartbeat,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            broker,
            dedup,
            executor,
            events,
            heartbeat,
            settings,
            busy: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queues this worker drains
    pub fn selector(&self) -> QueueSelector {
        match &self.settings.store_code {
            Some(store) => QueueSelector::reindex_queues_for_store(store, self.dedup.default_store_code()),
            None => QueueSelector::all_reindex_queues(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst) > 0
    }

    /// Drain jobs until `shutdown` is cancelled
    ///
    /// In-flight jobs finish before this returns.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            slots = self.settings.max_active_jobs,
            store_code = ?self.settings.store_code,
            "Worker started"
        );
        let slots = (0..self.settings.max_active_jobs).map(|slot| self.run_slot(slot, shutdown.clone()));
        futures::future::join_all(slots).await;
        tracing::info!("Worker stopped");
        Ok(())
    }

    async fn run_slot(&self, slot: usize, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            let idle = match self.run_once().await {
                Ok(processed) => !processed,
                Err(e) => {
                    tracing::error!(slot, error = %e, "Worker slot iteration failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
            }
        }
        tracing::debug!(slot, "Worker slot exiting");
    }

    /// Claim and process at most one job; false when nothing was claimed
    pub async fn run_once(&self) -> Result<bool> {
        if self.broker.is_paused(REINDEX_PAUSE_SCOPE).await? {
            return Ok(false);
        }
        match self.broker.claim(&self.selector(), true).await? {
            Some(job) => {
                if let Err(e) = self.process_job(&job).await {
                    self.release_errored(&job, &e).await;
                    return Err(e);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Return a job whose bookkeeping failed to the broker
    ///
    /// Without this the job would stay `active` and hold its queue until the
    /// lease expires.
    async fn release_errored(&self, job: &BrokerJob, error: &ReindexError) {
        let outcome = match self.broker.fail(job.id, &error.to_string()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(job_id = job.id, error = %e, "Errored reindex job is no longer active");
                return;
            }
        };
        tracing::error!(
            job_id = job.id,
            terminal = outcome.is_terminal(),
            error = %error,
            "Reindex job errored outside the import run"
        );
        if !outcome.is_terminal() {
            return;
        }
        let Ok(payload) = job.payload_as::<JobPayload>() else {
            return;
        };
        let abandoned = async {
            let ids = self
                .dedup
                .list(payload.entity, &payload.store_code, self.settings.dedup_page_limit)
                .await?;
            self.dedup.dequeue(payload.entity, &payload.store_code, &ids).await
        };
        if let Err(e) = abandoned.await {
            tracing::warn!(job_id = job.id, error = %e, "Failed to abandon ids of errored job");
        }
    }

    /// Drive `run` while renewing the job's claim lease
    async fn run_with_lease<F, T>(&self, job_id: i64, run: F) -> T
    where
        F: Future<Output = T>,
    {
        tokio::pin!(run);
        let mut renew = tokio::time::interval(self.settings.lease / 4);
        renew.tick().await;
        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = renew.tick() => {
                    if let Err(e) = self.broker.touch(job_id).await {
                        tracing::warn!(job_id, error = %e, "Failed to renew reindex job lease");
                    }
                }
            }
        }
    }

    async fn process_job(&self, job: &BrokerJob) -> Result<()> {
        let payload: JobPayload = match job.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(job_id = job.id, queue = %job.queue_name, error = %e, "Unreadable reindex job");
                self.broker.bury(job.id, &e.to_string()).await?;
                return Ok(());
            }
        };
        let entity = payload.entity;
        let store_code = payload.store_code.as_str();

        let ids = self
            .dedup
            .list(entity, store_code, self.settings.dedup_page_limit)
            .await?;
        if ids.is_empty() {
            tracing::debug!(job_id = job.id, entity = %entity, store_code, "No pending ids, acknowledging job");
            self.broker.complete(job.id).await?;
            return Ok(());
        }

        let _busy = BusyGuard::new(&self.busy);
        tracing::info!(
            job_id = job.id,
            entity = %entity,
            store_code,
            attempt = job.attempts,
            pending_ids = ids.len(),
            "Processing reindex job"
        );
        self.events.emit_lossy(ReindexEvent::JobStarted {
            job_id: job.id,
            entity: entity.to_string(),
            store_code: store_code.to_string(),
            pending_ids: ids.len(),
            timestamp: chrono::Utc::now(),
        });

        let filter = if ids.iter().any(|id| id == FULL_REINDEX) {
            None
        } else {
            Some(ids.clone())
        };

        match self
            .run_with_lease(job.id, self.executor.run(entity, store_code, filter))
            .await
        {
            Ok(summary) => {
                self.dedup.dequeue(entity, store_code, &ids).await?;
                self.broker.complete(job.id).await?;
                self.heartbeat.beat();
                tracing::info!(
                    job_id = job.id,
                    entity = %entity,
                    store_code,
                    imported = summary.imported,
                    dropped = summary.dropped,
                    failed = summary.failed,
                    "Reindex job completed"
                );
                self.events.emit_lossy(ReindexEvent::JobCompleted {
                    job_id: job.id,
                    entity: entity.to_string(),
                    store_code: store_code.to_string(),
                    timestamp: chrono::Utc::now(),
                });
                self.schedule_continuation(job, &payload).await?;
            }
            Err(e) => {
                let outcome = if e.is_permanent() {
                    self.broker.bury(job.id, &e.to_string()).await?;
                    FailOutcome::Failed
                } else {
                    self.broker.fail(job.id, &e.to_string()).await?
                };
                let terminal = outcome.is_terminal();
                self.events.emit_lossy(ReindexEvent::JobFailed {
                    job_id: job.id,
                    entity: entity.to_string(),
                    store_code: store_code.to_string(),
                    error: e.to_string(),
                    terminal,
                    timestamp: chrono::Utc::now(),
                });

                if terminal {
                    let abandoned = self.dedup.dequeue(entity, store_code, &ids).await?;
                    tracing::error!(
                        job_id = job.id,
                        entity = %entity,
                        store_code,
                        abandoned,
                        error = %e,
                        "Reindex job failed permanently, pending ids abandoned"
                    );
                } else {
                    tracing::warn!(
                        job_id = job.id,
                        entity = %entity,
                        store_code,
                        attempt = job.attempts,
                        error = %e,
                        "Reindex job failed, will retry"
                    );
                }
            }
        }
        Ok(())
    }

    /// Queue another job when ids beyond the page limit are still pending
    async fn schedule_continuation(&self, job: &BrokerJob, payload: &JobPayload) -> Result<()> {
        let entity = payload.entity;
        let store_code = payload.store_code.as_str();
        let remaining = self.dedup.list(entity, store_code, usize::MAX).await?;
        if remaining.is_empty() || self.broker.pending_count(&job.queue_name).await? > 0 {
            return Ok(());
        }

        let tracked: Vec<String> = remaining
            .iter()
            .filter(|id| id.as_str() != FULL_REINDEX)
            .cloned()
            .collect();
        let new_job = NewJob::new(job.queue_name.as_str(), job.payload.clone())
            .priority(job.priority)
            .attempts(JOB_ATTEMPTS)
            .backoff_ms(self.settings.job_backoff_ms);

        let job_id = retry_on_lock("continuation job", self.settings.max_lock_wait_ms, || async {
            let mut tx = self.broker.pool().begin().await?;
            let job_id = insert_job(&mut *tx, &new_job).await?;
            self.dedup
                .record_status_on(&mut *tx, entity, store_code, &tracked, job_id)
                .await?;
            tx.commit().await?;
            Ok(job_id)
        })
        .await?;

        tracing::info!(
            job_id,
            previous_job_id = job.id,
            entity = %entity,
            store_code,
            remaining = remaining.len(),
            "Continuation job created for remaining ids"
        );
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        self.broker.set_paused(REINDEX_PAUSE_SCOPE, true).await?;
        tracing::info!("Reindex queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.broker.set_paused(REINDEX_PAUSE_SCOPE, false).await?;
        tracing::info!("Reindex queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool> {
        Ok(self.broker.is_paused(REINDEX_PAUSE_SCOPE).await?)
    }

    pub async fn health(&self) -> Result<WorkerHealth> {
        let counts = self.broker.counts(&self.selector()).await?;
        Ok(WorkerHealth {
            inactive_jobs: counts.inactive,
            active_jobs: counts.active,
            delayed_jobs: counts.delayed,
            failed_jobs: counts.failed,
            busy: self.is_busy(),
            paused: self.is_paused().await?,
        })
    }

    /// Move stuck active jobs back to inactive
    pub async fn requeue(&self) -> Result<u64> {
        let requeued = self.broker.requeue_active(&self.selector()).await?;
        tracing::info!(requeued, "Requeued active reindex jobs");
        Ok(requeued)
    }

    /// Delete stuck active jobs
    pub async fn remove(&self) -> Result<u64> {
        let removed = self.broker.remove_active(&self.selector()).await?;
        tracing::info!(removed, "Removed active reindex jobs");
        Ok(removed)
    }

    /// Delete waiting jobs and reset the dedup store
    pub async fn clear(&self) -> Result<u64> {
        let cleared = self.broker.clear_inactive(&self.selector()).await?;
        let ids = self.dedup.clear_all().await?;
        tracing::info!(cleared, ids, "Cleared inactive reindex jobs and pending ids");
        Ok(cleared)
    }

    /// Job state of pending ids (every pending id when `ids` is empty)
    pub async fn status(&self, entity: EntityType, store_code: &str, ids: &[String]) -> Result<Vec<IdStatus>> {
        let mut statuses = Vec::new();
        for (id, job_id) in self.dedup.status(entity, store_code, ids).await? {
            let state = match job_id {
                Some(job_id) => Some(self.broker.job_state(job_id).await?),
                None => None,
            };
            statuses.push(IdStatus { id, job_id, state });
        }
        Ok(statuses)
    }
}
