//! Bulk import engine
//!
//! One generic engine runs every entity import. A run walks the source page by
//! page:
//!
//! ```text
//! FetchPage -> Enqueue -> DrainConcurrent -> { next page | AllDone }
//!                                                            |
//!                                                      UnstablePass
//! ```
//!
//! Items of a page are queued as broker tasks on the run's item queue and
//! drained by `max_active_item_workers` consumers. Item failures never fail
//! the run: enrichment errors move the item to the unstable queue, upsert
//! errors are retried by the broker and counted once exhausted. Only a source
//! page that cannot be fetched fails the run.

mod tree;
mod unstable;

pub use tree::{flatten, FlatItem, CHILDREN_FIELD};

use reindex_common::config::WorkerConfig;
use reindex_common::events::{EventBus, ReindexEvent};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::ImportAdapter;
use crate::db::Broker;
use crate::error::{ReindexError, Result};
use crate::models::{
    item_queue_name, unstable_queue_name, BrokerJob, ImportContext, ItemTask, NewJob,
    QueueSelector, RunSummary,
};
use crate::services::document_store::{DocumentStore, TRANSACTION_KEY_FIELD};
use crate::services::source_client::SourcePage;
use crate::services::watchdog::Heartbeat;

/// Immediate attempts per source page before the run fails
pub const PAGE_FETCH_ATTEMPTS: u32 = 3;

/// Broker attempts per item upsert
pub const ITEM_ATTEMPTS: u32 = 3;

/// Attempts per unstable item, retried without backoff
pub const UNSTABLE_ATTEMPTS: u32 = 2;

/// Engine tuning
#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub page_size: u32,
    pub max_active_item_workers: usize,
    pub item_backoff_ms: u64,
    /// Idle sleep of a consumer while tasks are still delayed or active
    pub poll_interval: Duration,
    pub cleanup_stale: bool,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

impl ImportSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            page_size: config.page_size.max(1),
            max_active_item_workers: config.max_active_item_workers.max(1),
            item_backoff_ms: config.item_backoff_ms,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            cleanup_stale: config.cleanup_stale,
        }
    }
}

/// Item outcome counters shared by the consumers of a run
#[derive(Default)]
struct RunCounters {
    imported: AtomicUsize,
    unstable: AtomicUsize,
    dropped: AtomicUsize,
    failed: AtomicUsize,
}

impl RunCounters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn write_to(&self, summary: &mut RunSummary) {
        summary.imported = self.imported.load(Ordering::Relaxed);
        summary.unstable = self.unstable.load(Ordering::Relaxed);
        summary.dropped = self.dropped.load(Ordering::Relaxed);
        summary.failed = self.failed.load(Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct BulkImportEngine {
    broker: Broker,
    store: Arc<dyn DocumentStore>,
    events: EventBus,
    heartbeat: Heartbeat,
    settings: ImportSettings,
}

impl BulkImportEngine {
    pub fn new(
        broker: Broker,
        store: Arc<dyn DocumentStore>,
        events: EventBus,
        heartbeat: Heartbeat,
        settings: ImportSettings,
    ) -> Self {
        Self {
            broker,
            store,
            events,
            heartbeat,
            settings,
        }
    }

    pub fn settings(&self) -> &ImportSettings {
        &self.settings
    }

    /// Run one import to completion
    pub async fn run(&self, adapter: Arc<dyn ImportAdapter>, mut ctx: ImportContext) -> Result<RunSummary> {
        let _activity = self.heartbeat.activity();
        let adapter = adapter.as_ref();
        let item_queue = item_queue_name(ctx.entity, &ctx.collection);
        let unstable_queue = unstable_queue_name(ctx.entity, &ctx.collection);
        let run_queues = QueueSelector::Names(vec![item_queue.clone(), unstable_queue.clone()]);

        tracing::info!(
            run_id = %ctx.run_id,
            entity = %ctx.entity,
            store_code = %ctx.store_code,
            collection = %ctx.collection,
            transaction_key = ctx.transaction_key,
            full = ctx.is_full(),
            "Starting import run"
        );

        let orphaned = self.broker.requeue_active(&run_queues).await?;
        if orphaned > 0 {
            tracing::warn!(run_id = %ctx.run_id, orphaned, "Requeued item tasks left active by an earlier run");
        }

        let counters = RunCounters::default();
        let mut summary = RunSummary::for_context(&ctx);

        loop {
            let page = self.fetch_page(adapter, &ctx).await?;
            summary.pages_fetched += 1;

            if summary.pages_fetched == 1 {
                ctx.total_count = page.total_count;
                ctx.page_count = ctx.compute_page_count();
                summary.total_count = ctx.total_count;
                if ctx.total_count == 0 && page.items.is_empty() {
                    tracing::info!(run_id = %ctx.run_id, entity = %ctx.entity, "No records to process");
                    break;
                }
            }

            let queued = self.enqueue_page(adapter, &ctx, page, &item_queue).await?;
            summary.items_enqueued += queued;
            tracing::info!(
                run_id = %ctx.run_id,
                page = ctx.page,
                page_count = ctx.page_count,
                items = queued,
                "Page enqueued"
            );
            self.events.emit_lossy(ReindexEvent::PageFetched {
                run_id: ctx.run_id,
                entity: ctx.entity.to_string(),
                page: ctx.page,
                page_count: ctx.page_count,
                items: queued,
                timestamp: chrono::Utc::now(),
            });

            self.drain_items(adapter, &ctx, &item_queue, &unstable_queue, &counters)
                .await?;

            if !ctx.has_more_pages() {
                break;
            }
            ctx.page += 1;
        }

        self.drain_unstable(adapter, &ctx, &unstable_queue, &counters)
            .await?;

        // Exhausted tasks were already counted and logged
        self.broker.purge_failed(&run_queues).await?;

        counters.write_to(&mut summary);

        if self.settings.cleanup_stale && ctx.is_full() && adapter.should_overwrite() {
            if summary.is_clean() {
                summary.stale_removed = self
                    .store
                    .delete_stale(&ctx.collection, ctx.transaction_key)
                    .await?;
            } else {
                tracing::warn!(
                    run_id = %ctx.run_id,
                    dropped = summary.dropped,
                    failed = summary.failed,
                    "Skipping stale document cleanup after incomplete run"
                );
            }
        }

        tracing::info!(
            run_id = %ctx.run_id,
            entity = %ctx.entity,
            store_code = %ctx.store_code,
            imported = summary.imported,
            unstable = summary.unstable,
            dropped = summary.dropped,
            failed = summary.failed,
            "Import run completed"
        );
        self.events.emit_lossy(ReindexEvent::RunCompleted {
            run_id: ctx.run_id,
            entity: ctx.entity.to_string(),
            store_code: ctx.store_code.clone(),
            transaction_key: ctx.transaction_key,
            imported: summary.imported,
            dropped: summary.dropped,
            failed: summary.failed,
            timestamp: chrono::Utc::now(),
        });

        Ok(summary)
    }

    async fn fetch_page(&self, adapter: &dyn ImportAdapter, ctx: &ImportContext) -> Result<SourcePage> {
        let mut attempt = 1;
        loop {
            match adapter.source_data(ctx).await {
                Ok(page) => return Ok(page),
                Err(e) if attempt < PAGE_FETCH_ATTEMPTS => {
                    tracing::warn!(
                        run_id = %ctx.run_id,
                        page = ctx.page,
                        attempt,
                        error = %e,
                        "Source page fetch failed, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        run_id = %ctx.run_id,
                        page = ctx.page,
                        attempts = attempt,
                        error = %e,
                        "Source page fetch failed"
                    );
                    return Err(ReindexError::Source(e));
                }
            }
        }
    }

    /// Flatten the page and queue one task per item in a single transaction
    async fn enqueue_page(
        &self,
        adapter: &dyn ImportAdapter,
        ctx: &ImportContext,
        page: SourcePage,
        item_queue: &str,
    ) -> Result<usize> {
        let flat = flatten(adapter.prepare_items(page));
        let mut jobs = Vec::with_capacity(flat.len());
        for FlatItem { item, depth } in flat {
            let task = ItemTask {
                raw_item: item,
                collection_name: ctx.collection.clone(),
                depth,
            };
            jobs.push(
                NewJob::new(item_queue, serde_json::to_value(&task)?)
                    .attempts(ITEM_ATTEMPTS)
                    .backoff_ms(self.settings.item_backoff_ms),
            );
        }
        self.broker.create_batch(&jobs).await?;
        Ok(jobs.len())
    }

    async fn drain_items(
        &self,
        adapter: &dyn ImportAdapter,
        ctx: &ImportContext,
        item_queue: &str,
        unstable_queue: &str,
        counters: &RunCounters,
    ) -> Result<()> {
        let consumers = (0..ctx.max_active_item_workers.max(1)).map(move |_| {
            self.consume(item_queue, move |job| {
                self.process_item(adapter, ctx, job, unstable_queue, counters)
            })
        });
        futures::future::try_join_all(consumers).await?;
        Ok(())
    }

    /// Claim and handle tasks until the queue has nothing pending
    ///
    /// Delayed or in-flight tasks keep the consumer polling; it exits once
    /// no task is inactive, active or delayed.
    async fn consume<F, Fut>(&self, queue: &str, mut handle: F) -> Result<()>
    where
        F: FnMut(BrokerJob) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let selector = QueueSelector::name(queue);
        loop {
            match self.broker.claim(&selector, false).await? {
                Some(job) => handle(job).await?,
                None => {
                    if self.broker.pending_count(queue).await? == 0 {
                        return Ok(());
                    }
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        }
    }

    async fn process_item(
        &self,
        adapter: &dyn ImportAdapter,
        ctx: &ImportContext,
        job: BrokerJob,
        unstable_queue: &str,
        counters: &RunCounters,
    ) -> Result<()> {
        let task: ItemTask = match job.payload_as() {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Unreadable item task");
                self.broker.bury(job.id, &e.to_string()).await?;
                self.heartbeat.beat();
                RunCounters::bump(&counters.failed);
                return Ok(());
            }
        };
        let label = adapter.label(&task.raw_item);

        let document = match adapter.enrich_item(ctx, task.raw_item).await {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!(
                    run_id = %ctx.run_id,
                    item = %label,
                    depth = task.depth,
                    error = %e,
                    "Enrichment failed, moving item to unstable queue"
                );
                self.broker
                    .create(&NewJob::new(unstable_queue, job.payload.clone()).attempts(UNSTABLE_ATTEMPTS))
                    .await?;
                self.broker.complete(job.id).await?;
                self.heartbeat.beat();
                RunCounters::bump(&counters.unstable);
                self.events.emit_lossy(ReindexEvent::ItemUnstable {
                    run_id: ctx.run_id,
                    entity: ctx.entity.to_string(),
                    label,
                    error: e.to_string(),
                    timestamp: chrono::Utc::now(),
                });
                return Ok(());
            }
        };

        let Some((id, document)) = self.prepare_document(adapter, ctx, document) else {
            tracing::warn!(run_id = %ctx.run_id, item = %label, "Item has no document id, skipping");
            self.broker.complete(job.id).await?;
            self.heartbeat.beat();
            RunCounters::bump(&counters.failed);
            return Ok(());
        };

        match self
            .store
            .upsert(&ctx.collection, &id, &document, adapter.should_overwrite())
            .await
        {
            Ok(()) => {
                self.broker.complete(job.id).await?;
                self.heartbeat.beat();
                RunCounters::bump(&counters.imported);
                tracing::debug!(run_id = %ctx.run_id, item = %label, "Item imported");
            }
            Err(e) => {
                let outcome = self.broker.fail(job.id, &e.to_string()).await?;
                if outcome.is_terminal() {
                    tracing::error!(
                        run_id = %ctx.run_id,
                        item = %label,
                        attempts = job.attempts,
                        error = %e,
                        "Item upsert failed on every attempt"
                    );
                    self.heartbeat.beat();
                    RunCounters::bump(&counters.failed);
                } else {
                    tracing::warn!(
                        run_id = %ctx.run_id,
                        item = %label,
                        attempt = job.attempts,
                        error = %e,
                        "Item upsert failed, will retry"
                    );
                }
            }
        }
        Ok(())
    }

    /// Stamp the run's transaction key and resolve the document id
    fn prepare_document(
        &self,
        adapter: &dyn ImportAdapter,
        ctx: &ImportContext,
        mut document: Value,
    ) -> Option<(String, Value)> {
        let id = adapter.document_id(&document)?;
        document
            .as_object_mut()?
            .insert(TRANSACTION_KEY_FIELD.to_string(), Value::from(ctx.transaction_key));
        Some((id, document))
    }
}
