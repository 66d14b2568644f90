//! Unstable-item pass
//!
//! Items whose enrichment failed during the main pass get one more chance
//! after every page is done. A single consumer retries them without backoff;
//! an item that fails on its last attempt is dropped with a warning and an
//! `ItemDropped` event. Dropping never fails the run.

use reindex_common::events::ReindexEvent;

use super::{BulkImportEngine, RunCounters};
use crate::adapters::ImportAdapter;
use crate::error::Result;
use crate::models::{BrokerJob, ImportContext, ItemTask};

impl BulkImportEngine {
    pub(super) async fn drain_unstable(
        &self,
        adapter: &dyn ImportAdapter,
        ctx: &ImportContext,
        unstable_queue: &str,
        counters: &RunCounters,
    ) -> Result<()> {
        let pending = self.broker.pending_count(unstable_queue).await?;
        if pending == 0 {
            return Ok(());
        }

        tracing::info!(run_id = %ctx.run_id, pending, "Retrying unstable items");
        self.consume(unstable_queue, move |job| {
            self.retry_unstable(adapter, ctx, job, counters)
        })
        .await
    }

    async fn retry_unstable(
        &self,
        adapter: &dyn ImportAdapter,
        ctx: &ImportContext,
        job: BrokerJob,
        counters: &RunCounters,
    ) -> Result<()> {
        let task: ItemTask = match job.payload_as() {
            Ok(task) => task,
            Err(e) => {
                self.broker.bury(job.id, &e.to_string()).await?;
                self.heartbeat.beat();
                RunCounters::bump(&counters.dropped);
                return Ok(());
            }
        };
        let label = adapter.label(&task.raw_item);

        let error = match adapter.enrich_item(ctx, task.raw_item).await {
            Ok(document) => match self.prepare_document(adapter, ctx, document) {
                Some((id, document)) => match self
                    .store
                    .upsert(&ctx.collection, &id, &document, adapter.should_overwrite())
                    .await
                {
                    Ok(()) => {
                        self.broker.complete(job.id).await?;
                        self.heartbeat.beat();
                        RunCounters::bump(&counters.imported);
                        tracing::info!(run_id = %ctx.run_id, item = %label, "Unstable item imported on retry");
                        return Ok(());
                    }
                    Err(e) => e.to_string(),
                },
                None => "item has no document id".to_string(),
            },
            Err(e) => e.to_string(),
        };

        let outcome = self.broker.fail(job.id, &error).await?;
        if outcome.is_terminal() {
            tracing::warn!(
                run_id = %ctx.run_id,
                item = %label,
                attempts = job.attempts,
                error = %error,
                "Dropping unstable item"
            );
            self.heartbeat.beat();
            RunCounters::bump(&counters.dropped);
            self.events.emit_lossy(ReindexEvent::ItemDropped {
                run_id: ctx.run_id,
                entity: ctx.entity.to_string(),
                label,
                error,
                timestamp: chrono::Utc::now(),
            });
        } else {
            tracing::debug!(run_id = %ctx.run_id, item = %label, attempt = job.attempts, "Unstable item failed again");
        }
        Ok(())
    }
}
