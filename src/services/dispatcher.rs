//! Work dispatch: the worker-facing claim path and the scheduler pump.
//!
//! Two delivery modes share the same claim logic. A worker polling the work
//! API claims straight from the database and receives the item RUNNING. The
//! scheduler pump drains "service has ready work" signals, claims items as
//! QUEUED, and publishes them to the per-service FIFO queue, where a later
//! poll picks them up.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::models::{WorkItemStatus, WorkflowStep};
use crate::queue::{Queue, SchedulerMessage, WorkMessage};
use crate::repository::{BatchRepository, JobRepository, RepositoryError};

use super::CoreContext;

/// Upper bound on items published per scheduler signal, so one very large
/// job cannot monopolize a pump iteration.
const MAX_PUBLISH_PER_SIGNAL: usize = 10;

/// Serves `get_work` polls and runs the scheduler pump.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: CoreContext,
}

impl Dispatcher {
    pub fn new(ctx: CoreContext) -> Self {
        Self { ctx }
    }

    /// Answer one worker poll for a service.
    ///
    /// Queue delivery wins when present (the item moves QUEUED to RUNNING);
    /// otherwise the database is claimed directly. Messages for items that
    /// went terminal while queued are dropped and the poll moves on.
    pub async fn get_work(&self, service_id: &str) -> crate::repository::Result<Option<WorkMessage>> {
        let queue = self.ctx.queues.work_queue(service_id);
        loop {
            let messages = queue.receive(1).await.map_err(queue_error)?;
            let Some(message) = messages.into_iter().next() else {
                break;
            };
            let parsed: WorkMessage = match serde_json::from_str(&message.body) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(service_id, "dropping malformed work message: {e}");
                    let _ = queue.delete(&message.receipt).await;
                    continue;
                }
            };
            match self.ctx.work_items.mark_running(parsed.work_item.id).await {
                Ok(_) => {
                    queue.delete(&message.receipt).await.map_err(queue_error)?;
                    return Ok(Some(parsed));
                }
                Err(RepositoryError::Conflict(reason)) => {
                    // Canceled while queued; the worker never sees it.
                    debug!(
                        work_item_id = parsed.work_item.id,
                        "dropping queued work: {reason}"
                    );
                    let _ = queue.delete(&message.receipt).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        let Some(item) = self
            .ctx
            .work_items
            .claim_next(service_id, WorkItemStatus::Running)
            .await?
        else {
            return Ok(None);
        };
        let message = self.build_message(&item).await?;
        Ok(Some(message))
    }

    /// Drain one round of scheduler signals, publishing claimed work to the
    /// per-service queues. Returns the number of items published.
    pub async fn pump_scheduler_once(&self) -> crate::repository::Result<usize> {
        let scheduler = self.ctx.queues.scheduler_queue();
        let signals = scheduler.receive(10).await.map_err(queue_error)?;
        let mut published = 0;
        for signal in signals {
            let parsed: Result<SchedulerMessage, _> = serde_json::from_str(&signal.body);
            match parsed {
                Ok(SchedulerMessage { service_id }) => {
                    published += self.publish_for_service(&service_id).await?;
                }
                Err(e) => warn!("dropping malformed scheduler message: {e}"),
            }
            scheduler.delete(&signal.receipt).await.map_err(queue_error)?;
        }
        Ok(published)
    }

    async fn publish_for_service(&self, service_id: &str) -> crate::repository::Result<usize> {
        let queue = self.ctx.queues.work_queue(service_id);
        let mut published = 0;
        while published < MAX_PUBLISH_PER_SIGNAL {
            let Some(item) = self
                .ctx
                .work_items
                .claim_next(service_id, WorkItemStatus::Queued)
                .await?
            else {
                break;
            };
            let message = self.build_message(&item).await?;
            let body = serde_json::to_string(&message)?;
            // Group by job so FIFO queue services get the id they require.
            queue
                .send(&body, Some(&item.job_id))
                .await
                .map_err(queue_error)?;
            published += 1;
        }
        Ok(published)
    }

    async fn build_message(
        &self,
        item: &crate::models::WorkItem,
    ) -> crate::repository::Result<WorkMessage> {
        let mut conn = self.ctx.pool.get().await?;
        let step: WorkflowStep = JobRepository::step_in(
            &mut conn,
            &item.job_id,
            item.workflow_step_index,
        )
        .await?
        .ok_or_else(|| {
            RepositoryError::NotFound(format!(
                "workflow step {} of job {}",
                item.workflow_step_index, item.job_id
            ))
        })?;
        let batch_catalogs = match item.batch_id {
            Some(batch_id) => {
                let items = BatchRepository::items_in(&mut conn, batch_id).await?;
                Some(items.into_iter().map(|i| i.stac_location).collect())
            }
            None => None,
        };
        Ok(WorkMessage::for_item(
            item,
            &step,
            Some(self.ctx.settings.cmr_max_page_size),
            batch_catalogs,
        )?)
    }

    /// Run the scheduler pump until shutdown flips.
    pub async fn run_scheduler_pump(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let poll = std::time::Duration::from_millis(self.ctx.settings.queue_poll_interval_ms);
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.pump_scheduler_once().await {
                Ok(0) => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("scheduler pump error: {e}");
                    tokio::time::sleep(poll).await;
                }
            }
        }
        debug!("scheduler pump stopped");
    }
}

fn queue_error(e: crate::queue::QueueError) -> RepositoryError {
    RepositoryError::System(format!("queue failure: {e}"))
}
