//! The update processor: ingests work-item status reports and advances the
//! pipeline.
//!
//! Each update is applied inside one transaction under the owning job's
//! lock: the item moves to its next status, counters fold, the error policy
//! runs, downstream items materialize (directly or through batches), and
//! the job's progress and completion verdict are re-evaluated. Updates for
//! items or jobs that already went terminal are dropped, which is what
//! makes at-least-once delivery safe.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::models::{
    ErrorCategory, Job, JobLink, JobStatus, ReportedStatus, WorkItem, WorkItemStatus,
    WorkItemUpdate, WorkflowStep,
};
use crate::queue::{Queue, SchedulerMessage};
use crate::repository::work_items::StepCounterDelta;
use crate::repository::{
    BatchRepository, JobRepository, RepositoryError, Result, SqliteConn, UserWorkRepository,
    WorkItemRepository,
};

use super::CoreContext;

/// What processing one update amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDisposition {
    /// Item went terminal and the pipeline advanced.
    Applied,
    /// Item failed but was put back in line for another attempt.
    Requeued,
    /// The failure tripped the error policy and the job is now FAILED.
    JobFailed,
    /// This update completed the job.
    JobCompleted,
    /// The update had no effect (terminal item, terminal job, stale, or
    /// unknown item).
    Dropped(&'static str),
}

/// Send "ready work" signals for freshly created items.
pub async fn announce_services(queue: &Arc<dyn Queue>, service_ids: &[String]) {
    let mut seen = std::collections::HashSet::new();
    for service_id in service_ids {
        if !seen.insert(service_id.clone()) {
            continue;
        }
        let message = SchedulerMessage {
            service_id: service_id.clone(),
        };
        let body = match serde_json::to_string(&message) {
            Ok(body) => body,
            Err(e) => {
                error!("failed to serialize scheduler message: {e}");
                continue;
            }
        };
        if let Err(e) = queue.send(&body, None).await {
            error!(%service_id, "failed to announce ready work: {e}");
        }
    }
}

/// Consumes work-item updates and drives jobs forward.
#[derive(Clone)]
pub struct UpdateProcessor {
    ctx: CoreContext,
}

impl UpdateProcessor {
    pub fn new(ctx: CoreContext) -> Self {
        Self { ctx }
    }

    /// Put an update on the update queue.
    pub async fn enqueue(&self, update: &WorkItemUpdate) -> Result<()> {
        let body = serde_json::to_string(update)?;
        let group = update.work_item_id.to_string();
        self.ctx
            .queues
            .update_queue()
            .send(&body, Some(&group))
            .await
            .map_err(|e| RepositoryError::System(format!("queue failure: {e}")))?;
        Ok(())
    }

    /// Apply one update end to end. Safe to call again with the same update.
    pub async fn process(&self, update: &WorkItemUpdate) -> Result<UpdateDisposition> {
        // Resolve the owning job outside the lock.
        let probe = match self.ctx.work_items.get(update.work_item_id).await {
            Ok(item) => item,
            Err(RepositoryError::NotFound(_)) => {
                debug!(work_item_id = update.work_item_id, "update for unknown work item");
                return Ok(UpdateDisposition::Dropped("unknown work item"));
            }
            Err(e) => return Err(e),
        };

        let _guard = self.ctx.locks.lock(&probe.job_id).await;

        let update = update.clone();
        let this = self.clone();
        let mut conn = self.ctx.pool.get().await?;
        use diesel_async::AsyncConnection;
        let (disposition, announced) = conn
            .transaction(|conn| {
                Box::pin(async move { this.apply(conn, &update).await })
            })
            .await?;

        if !announced.is_empty() {
            announce_services(&self.ctx.queues.scheduler_queue(), &announced).await;
        }
        Ok(disposition)
    }

    /// The per-update algorithm, inside one transaction.
    async fn apply(
        &self,
        conn: &mut SqliteConn,
        update: &WorkItemUpdate,
    ) -> Result<(UpdateDisposition, Vec<String>)> {
        let mut item = WorkItemRepository::get_in(conn, update.work_item_id).await?;
        if item.status.is_terminal() {
            return Ok((UpdateDisposition::Dropped("terminal work item"), vec![]));
        }
        if !matches!(item.status, WorkItemStatus::Queued | WorkItemStatus::Running) {
            // A READY item has no outstanding delivery; this is a duplicate
            // of an already-absorbed failure.
            return Ok((UpdateDisposition::Dropped("stale update"), vec![]));
        }

        let job = JobRepository::get_in(conn, &item.job_id).await?;
        if job.status.is_terminal() {
            return Ok((UpdateDisposition::Dropped("terminal job"), vec![]));
        }

        let step = JobRepository::step_in(conn, &item.job_id, item.workflow_step_index)
            .await?
            .ok_or_else(|| {
                RepositoryError::NotFound(format!(
                    "workflow step {} of job {}",
                    item.workflow_step_index, item.job_id
                ))
            })?;

        let old_status = item.status;
        let mut announced: Vec<String> = Vec::new();

        // Retry path: a failure below the retry limit goes back in line.
        if update.status == ReportedStatus::Failed {
            let next_retry = item.retry_count + 1;
            if next_retry <= self.ctx.settings.work_item_retry_limit {
                item.retry_count = next_retry;
                item.status = WorkItemStatus::Ready;
                if let Some(message) = &update.message {
                    item.message = Some(message.clone());
                }
                WorkItemRepository::persist_in(conn, &item).await?;
                WorkItemRepository::bump_step_counters_in(
                    conn,
                    &item.job_id,
                    item.workflow_step_index,
                    status_delta(old_status, WorkItemStatus::Ready),
                )
                .await?;
                UserWorkRepository::adjust_in(
                    conn,
                    &job.username,
                    &item.service_id,
                    &item.job_id,
                    1,
                    -1,
                )
                .await?;
                info!(
                    work_item_id = item.id,
                    retry_count = item.retry_count,
                    "work item failed, retrying"
                );
                announced.push(item.service_id.clone());
                return Ok((UpdateDisposition::Requeued, announced));
            }
        }

        // Terminal application.
        let new_status = WorkItemStatus::from(update.status);
        item.status = new_status;
        if let Some(message) = &update.message {
            item.message = Some(message.clone());
        }
        item.results = update.results.clone();
        item.output_item_sizes = update.output_item_sizes.clone();
        item.total_items_size = update.effective_total_size();
        if let Some(duration) = update.duration_ms {
            item.duration_ms = duration;
        }
        item.scroll_id = update.scroll_id.clone();
        WorkItemRepository::persist_in(conn, &item).await?;
        WorkItemRepository::bump_step_counters_in(
            conn,
            &item.job_id,
            item.workflow_step_index,
            status_delta(old_status, new_status),
        )
        .await?;
        UserWorkRepository::adjust_in(conn, &job.username, &item.service_id, &item.job_id, 0, -1)
            .await?;

        let disposition = match new_status {
            WorkItemStatus::Failed => {
                let failed_job = self.handle_failure(conn, &job, &step, &item, update).await?;
                if failed_job {
                    return Ok((UpdateDisposition::JobFailed, vec![]));
                }
                // Absorbed under ignore_errors: the failed item may still be
                // the last terminal event its downstream batch was waiting
                // for.
                self.seal_last_batch_if_ready(conn, &job, step.step_index, &mut announced)
                    .await?;
                UpdateDisposition::Applied
            }
            WorkItemStatus::Successful | WorkItemStatus::Warning => {
                if new_status == WorkItemStatus::Warning {
                    let url = error_url(&job, &item);
                    let message = item
                        .message
                        .clone()
                        .unwrap_or_else(|| "the service reported a warning".to_string());
                    JobRepository::append_error_in(
                        conn,
                        &job.id,
                        &url,
                        &message,
                        ErrorCategory::Warning,
                    )
                    .await?;
                }
                self.advance_pipeline(conn, &job, &step, &item, update, &mut announced)
                    .await?;
                self.seal_last_batch_if_ready(conn, &job, step.step_index, &mut announced)
                    .await?;
                UpdateDisposition::Applied
            }
            _ => UpdateDisposition::Applied,
        };

        // Auto-pause a previewing job once downstream work exists.
        let job = JobRepository::get_in(conn, &job.id).await?;
        if job.status == JobStatus::Previewing {
            let downstream_exists = JobRepository::step_in(conn, &job.id, step.step_index + 1)
                .await?
                .map(|next| next.work_item_count > 0)
                .unwrap_or(false);
            if downstream_exists {
                info!(job_id = %job.id, "preview ready, pausing job");
                JobRepository::set_status_in(conn, &job.id, JobStatus::Paused, None).await?;
            }
        }

        self.update_progress(conn, &job.id).await?;

        let job = JobRepository::get_in(conn, &job.id).await?;
        if self.complete_job_if_done(conn, &job).await? {
            return Ok((UpdateDisposition::JobCompleted, announced));
        }

        Ok((disposition, announced))
    }

    /// Error bookkeeping and policy for a terminally failed item. Returns
    /// true when the job was failed (and its remaining work canceled).
    async fn handle_failure(
        &self,
        conn: &mut SqliteConn,
        job: &Job,
        step: &WorkflowStep,
        item: &WorkItem,
        update: &WorkItemUpdate,
    ) -> Result<bool> {
        let reason = update
            .message
            .clone()
            .or_else(|| item.message.clone())
            .unwrap_or_else(|| "unknown error".to_string());
        let url = error_url(job, item);
        JobRepository::append_error_in(conn, &job.id, &url, &reason, ErrorCategory::Error).await?;
        warn!(job_id = %job.id, work_item_id = item.id, "work item failed: {reason}");

        // A failed catalog query starves the whole pipeline; ignore_errors
        // cannot absorb it.
        let ignore_effective = job.ignore_errors && !step.is_input_producer;
        if !ignore_effective {
            return self.fail_job(conn, job, &reason).await;
        }

        let settings = &self.ctx.settings;
        let error_count = JobRepository::count_errors_in(conn, &job.id, ErrorCategory::Error).await?;
        if error_count > settings.max_errors_for_job {
            return self.fail_job(conn, job, &reason).await;
        }
        let steps = JobRepository::steps_in(conn, &job.id).await?;
        let completed: i64 = steps.iter().map(|s| s.terminal_count() as i64).sum();
        if completed >= settings.min_completed_work_items_to_check_failure_percentage {
            let percent = error_count as f64 / completed as f64 * 100.0;
            if percent > settings.max_percent_errors_for_job {
                return self.fail_job(conn, job, &reason).await;
            }
        }

        if job.status == JobStatus::Running {
            JobRepository::set_status_in(conn, &job.id, JobStatus::RunningWithErrors, None).await?;
        }
        Ok(false)
    }

    /// Fail a job under policy. Returns false when the job's current status
    /// cannot legally fail (paused); the recorded error still stands and
    /// the verdict falls out of the completion path after resume.
    async fn fail_job(&self, conn: &mut SqliteConn, job: &Job, reason: &str) -> Result<bool> {
        let message = format!("WorkItem failed: {reason}");
        match JobRepository::set_status_in(conn, &job.id, JobStatus::Failed, Some(&message)).await {
            Ok(_) => {}
            Err(RepositoryError::IllegalStateTransition { from, to }) => {
                warn!(job_id = %job.id, "deferring status change {from} -> {to}");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        let canceled = WorkItemRepository::cancel_all_for_job_in(conn, &job.id).await?;
        info!(job_id = %job.id, canceled, "job failed, remaining work canceled");
        Ok(true)
    }

    /// Materialize downstream work for a successful (or warning) item.
    async fn advance_pipeline(
        &self,
        conn: &mut SqliteConn,
        job: &Job,
        step: &WorkflowStep,
        item: &WorkItem,
        update: &WorkItemUpdate,
        announced: &mut Vec<String>,
    ) -> Result<()> {
        // A catalog query with pages left spawns its own successor.
        if step.is_input_producer {
            if let Some(scroll_id) = &update.scroll_id {
                let successor = WorkItem::new(&job.id, &step.service_id, step.step_index)
                    .with_scroll_id(scroll_id.clone());
                WorkItemRepository::create_in(conn, &job.username, &[successor]).await?;
                announced.push(step.service_id.clone());
            }
        }

        let Some(next) = JobRepository::step_in(conn, &job.id, step.step_index + 1).await? else {
            // Final step: results become the job's data links.
            let links: Vec<JobLink> = update
                .results
                .iter()
                .map(|href| JobLink::data(href.clone(), None))
                .collect();
            JobRepository::add_links_in(conn, &job.id, &links).await?;
            return Ok(());
        };

        if next.is_batched {
            self.batch_results(conn, job, &next, item, update, announced)
                .await?;
        } else {
            let items: Vec<WorkItem> = update
                .results
                .iter()
                .map(|uri| {
                    WorkItem::new(&job.id, &next.service_id, next.step_index)
                        .with_catalog(uri.clone())
                })
                .collect();
            if !items.is_empty() {
                WorkItemRepository::create_in(conn, &job.username, &items).await?;
                announced.push(next.service_id.clone());
            }
        }
        Ok(())
    }

    /// Fold results into the open batch of a batched step, sealing and
    /// spawning aggregate items as caps are reached.
    async fn batch_results(
        &self,
        conn: &mut SqliteConn,
        job: &Job,
        next: &WorkflowStep,
        item: &WorkItem,
        update: &WorkItemUpdate,
        announced: &mut Vec<String>,
    ) -> Result<()> {
        let settings = &self.ctx.settings;
        let max_inputs = next.max_batch_inputs.or(Some(settings.max_batch_inputs));
        let max_size = next
            .max_batch_size_in_bytes
            .or(Some(settings.max_batch_size_in_bytes));

        for (index, uri) in update.results.iter().enumerate() {
            let size = update
                .output_item_sizes
                .get(index)
                .copied()
                .unwrap_or_default();

            let mut open = match BatchRepository::open_batch_in(conn, &job.id, next.step_index)
                .await?
            {
                Some(open) => open,
                None => BatchRepository::create_batch_in(conn, &job.id, next.step_index).await?,
            };
            if open.would_overflow(size, max_inputs, max_size) {
                self.seal_and_spawn(conn, job, next, open.id, false, announced)
                    .await?;
                open = BatchRepository::create_batch_in(conn, &job.id, next.step_index).await?;
            }
            let open = BatchRepository::add_item_in(conn, &open, item.id, uri, size).await?;
            if open.is_full(max_inputs, max_size) {
                self.seal_and_spawn(conn, job, next, open.id, false, announced)
                    .await?;
            }
        }
        Ok(())
    }

    /// Seal a batch and create the aggregate work item that consumes it.
    async fn seal_and_spawn(
        &self,
        conn: &mut SqliteConn,
        job: &Job,
        next: &WorkflowStep,
        batch_id: i32,
        is_last: bool,
        announced: &mut Vec<String>,
    ) -> Result<()> {
        BatchRepository::seal_in(conn, batch_id, is_last).await?;
        let mut aggregate = WorkItem::new(&job.id, &next.service_id, next.step_index);
        aggregate.batch_id = Some(batch_id);
        WorkItemRepository::create_in(conn, &job.username, &[aggregate]).await?;
        announced.push(next.service_id.clone());
        Ok(())
    }

    /// When every item of steps 1..=k is terminal, nothing further can feed
    /// step k+1: seal its open batch as the last one (or tag the newest
    /// sealed batch when the final input exactly filled one).
    async fn seal_last_batch_if_ready(
        &self,
        conn: &mut SqliteConn,
        job: &Job,
        step_index: i32,
        announced: &mut Vec<String>,
    ) -> Result<()> {
        let Some(next) = JobRepository::step_in(conn, &job.id, step_index + 1).await? else {
            return Ok(());
        };
        if !next.is_batched {
            return Ok(());
        }
        let steps = JobRepository::steps_in(conn, &job.id).await?;
        let upstream_complete = steps
            .iter()
            .filter(|s| s.step_index <= step_index)
            .all(|s| s.work_item_count > 0 && s.terminal_count() >= s.work_item_count);
        if !upstream_complete {
            return Ok(());
        }
        match BatchRepository::open_batch_in(conn, &job.id, next.step_index).await? {
            Some(open) => {
                self.seal_and_spawn(conn, job, &next, open.id, true, announced)
                    .await?;
            }
            None => {
                BatchRepository::mark_last_sealed_in(conn, &job.id, next.step_index).await?;
            }
        }
        Ok(())
    }

    /// Recompute progress from the step counters; monotone by construction.
    ///
    /// 100 is reserved for the completion path, so a job that is merely
    /// "all observed items terminal" with an open batch cannot report done.
    async fn update_progress(&self, conn: &mut SqliteConn, job_id: &str) -> Result<()> {
        let steps = JobRepository::steps_in(conn, job_id).await?;
        let expected: i64 = steps.iter().map(|s| s.work_item_count as i64).sum();
        if expected == 0 {
            return Ok(());
        }
        let terminal: i64 = steps.iter().map(|s| s.terminal_count() as i64).sum();
        let progress = ((terminal * 100) / expected).clamp(0, 99) as i32;
        JobRepository::update_progress_in(conn, job_id, progress).await
    }

    /// Evaluate the completion predicate and apply the final verdict.
    ///
    /// Returns true when this call completed the job. Paused and previewing
    /// jobs are left alone; the control surface re-runs this after resume.
    pub async fn complete_job_if_done(&self, conn: &mut SqliteConn, job: &Job) -> Result<bool> {
        if job.status.is_terminal()
            || matches!(job.status, JobStatus::Paused | JobStatus::Previewing)
        {
            return Ok(false);
        }
        let steps = JobRepository::steps_in(conn, &job.id).await?;
        if steps.is_empty() || steps.iter().any(|s| s.step_index == 1 && s.work_item_count == 0) {
            return Ok(false);
        }
        let all_terminal = steps
            .iter()
            .all(|s| s.terminal_count() >= s.work_item_count);
        if !all_terminal {
            return Ok(false);
        }
        if BatchRepository::has_open_batch_in(conn, &job.id).await? {
            return Ok(false);
        }

        let errors = JobRepository::count_errors_in(conn, &job.id, ErrorCategory::Error).await?;
        let warnings =
            JobRepository::count_errors_in(conn, &job.id, ErrorCategory::Warning).await?;

        if errors > 0 {
            if job.status == JobStatus::Running {
                JobRepository::set_status_in(conn, &job.id, JobStatus::RunningWithErrors, None)
                    .await?;
            }
            JobRepository::set_status_in(conn, &job.id, JobStatus::CompleteWithErrors, None)
                .await?;
        } else if warnings > 0 {
            JobRepository::set_status_in(
                conn,
                &job.id,
                JobStatus::Successful,
                Some("The job has completed successfully, but with warnings. See the errors field for details"),
            )
            .await?;
        } else {
            JobRepository::set_status_in(conn, &job.id, JobStatus::Successful, None).await?;
        }
        UserWorkRepository::delete_for_job_in(conn, &job.id).await?;
        info!(job_id = %job.id, "job complete");
        Ok(true)
    }

    /// Drain one round of the update queue. Returns how many updates were
    /// consumed.
    pub async fn process_queued_once(&self) -> Result<usize> {
        let queue = self.ctx.queues.update_queue();
        let messages = queue
            .receive(10)
            .await
            .map_err(|e| RepositoryError::System(format!("queue failure: {e}")))?;
        let mut consumed = 0;
        for message in messages {
            let update: WorkItemUpdate = match serde_json::from_str(&message.body) {
                Ok(update) => update,
                Err(e) => {
                    warn!("dropping malformed work item update: {e}");
                    let _ = queue.delete(&message.receipt).await;
                    continue;
                }
            };
            match self.process(&update).await {
                Ok(disposition) => {
                    debug!(work_item_id = update.work_item_id, ?disposition, "update applied");
                    queue
                        .delete(&message.receipt)
                        .await
                        .map_err(|e| RepositoryError::System(format!("queue failure: {e}")))?;
                    consumed += 1;
                }
                Err(e) => {
                    // Leave the receipt untouched; redelivery retries it.
                    error!(work_item_id = update.work_item_id, "update failed: {e}");
                }
            }
        }
        Ok(consumed)
    }

    /// Consume the update queue until shutdown flips.
    pub async fn run_consumer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let poll = std::time::Duration::from_millis(self.ctx.settings.queue_poll_interval_ms);
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.process_queued_once().await {
                Ok(0) => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("update consumer error: {e}");
                    tokio::time::sleep(poll).await;
                }
            }
        }
        debug!("update consumer stopped");
    }
}

/// Per-step counter movement for a status change.
fn status_delta(from: WorkItemStatus, to: WorkItemStatus) -> StepCounterDelta {
    let mut delta = StepCounterDelta::default();
    match from {
        WorkItemStatus::Ready => delta.ready -= 1,
        WorkItemStatus::Queued | WorkItemStatus::Running => delta.running -= 1,
        WorkItemStatus::Successful | WorkItemStatus::Warning => delta.successful -= 1,
        WorkItemStatus::Failed => delta.failed -= 1,
        WorkItemStatus::Canceled => delta.canceled -= 1,
    }
    match to {
        WorkItemStatus::Ready => delta.ready += 1,
        WorkItemStatus::Queued | WorkItemStatus::Running => delta.running += 1,
        WorkItemStatus::Successful | WorkItemStatus::Warning => delta.successful += 1,
        WorkItemStatus::Failed => delta.failed += 1,
        WorkItemStatus::Canceled => delta.canceled += 1,
    }
    delta
}

/// The URL a job error is recorded against.
fn error_url(job: &Job, item: &WorkItem) -> String {
    item.results
        .first()
        .cloned()
        .or_else(|| item.stac_catalog_location.clone())
        .unwrap_or_else(|| job.request_url.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_delta_moves_between_buckets() {
        let delta = status_delta(WorkItemStatus::Running, WorkItemStatus::Successful);
        assert_eq!(delta.running, -1);
        assert_eq!(delta.successful, 1);
        assert_eq!(delta.ready, 0);

        let delta = status_delta(WorkItemStatus::Queued, WorkItemStatus::Ready);
        assert_eq!(delta.running, -1);
        assert_eq!(delta.ready, 1);

        let delta = status_delta(WorkItemStatus::Ready, WorkItemStatus::Canceled);
        assert_eq!(delta.ready, -1);
        assert_eq!(delta.canceled, 1);
    }
}
