//! The work failer: a periodic sweeper that times out stuck work.
//!
//! Items sitting QUEUED or RUNNING past their threshold get a synthetic
//! FAILED update fed through the normal update pipeline, so retries and the
//! error policy behave exactly as they do for worker-reported failures.
//! Timeouts are enforced nowhere else.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::models::{JobStatus, WorkItem, WorkItemStatus, WorkItemUpdate};
use crate::queue::Queue;
use crate::repository::{Result, StaleItemQuery};

use super::{CoreContext, UpdateProcessor};

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub examined: usize,
    pub expired: usize,
    /// True when backpressure skipped the sweep entirely.
    pub skipped: bool,
}

/// Periodic timeout sweeper.
#[derive(Clone)]
pub struct WorkFailer {
    ctx: CoreContext,
    updater: UpdateProcessor,
}

impl WorkFailer {
    pub fn new(ctx: CoreContext, updater: UpdateProcessor) -> Self {
        Self { ctx, updater }
    }

    /// Examine overdue items and enqueue synthetic failures for the ones
    /// past their outlier threshold.
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        let settings = &self.ctx.settings;
        let mut stats = SweepStats::default();

        let max_depth = settings.max_work_items_on_update_queue_failer;
        if max_depth >= 0 {
            let depth = self
                .ctx
                .queues
                .update_queue()
                .approx_depth()
                .await
                .map_err(|e| {
                    crate::repository::RepositoryError::System(format!("queue failure: {e}"))
                })?;
            if depth > max_depth {
                info!(depth, max_depth, "update queue backlog, skipping sweep");
                stats.skipped = true;
                return Ok(stats);
            }
        }

        let now = Utc::now();
        let cutoff = now - Duration::minutes(settings.failable_work_age_minutes);
        // Thresholds are uniform per (job, service, step); compute each once.
        let mut thresholds: HashMap<(String, String, i32), i64> = HashMap::new();
        let mut starting_id = 0;

        loop {
            let candidates = self
                .ctx
                .work_items
                .stale_items(&StaleItemQuery {
                    older_than: cutoff,
                    statuses: vec![WorkItemStatus::Running, WorkItemStatus::Queued],
                    job_statuses: vec![JobStatus::Running, JobStatus::RunningWithErrors],
                    limit: settings.work_failer_batch_size,
                    starting_id,
                })
                .await?;
            if candidates.is_empty() {
                break;
            }
            starting_id = candidates.last().map(|item| item.id).unwrap_or(starting_id);

            for item in &candidates {
                stats.examined += 1;
                let threshold_ms = self.threshold_ms(&mut thresholds, item).await?;
                let running_ms = item
                    .started_at
                    .map(|started| (now - started).num_milliseconds())
                    .unwrap_or_else(|| item.age_ms(now));
                if running_ms > threshold_ms {
                    let update = WorkItemUpdate::failure(
                        item.id,
                        format!(
                            "Work item {} has exceeded the {} ms duration threshold.",
                            item.id, threshold_ms
                        ),
                    );
                    self.updater.enqueue(&update).await?;
                    stats.expired += 1;
                }
            }
        }

        if stats.expired > 0 {
            info!(examined = stats.examined, expired = stats.expired, "failer sweep done");
        } else {
            debug!(examined = stats.examined, "failer sweep done");
        }
        Ok(stats)
    }

    /// Outlier threshold for an item's (job, service, step): twice the
    /// slowest successful run when at least two exist, otherwise the
    /// configured per-service timeout.
    async fn threshold_ms(
        &self,
        cache: &mut HashMap<(String, String, i32), i64>,
        item: &WorkItem,
    ) -> Result<i64> {
        let key = (
            item.job_id.clone(),
            item.service_id.clone(),
            item.workflow_step_index,
        );
        if let Some(threshold) = cache.get(&key) {
            return Ok(*threshold);
        }
        let durations = self
            .ctx
            .work_items
            .successful_durations(&item.job_id, &item.service_id, item.workflow_step_index)
            .await?;
        let threshold = if durations.len() >= 2 {
            durations.iter().copied().max().unwrap_or(0) * 2
        } else {
            self.ctx
                .settings
                .timeout_seconds_for_service(&item.service_id)
                * 1000
        };
        cache.insert(key, threshold);
        Ok(threshold)
    }

    /// Sweep on a timer until shutdown flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = std::time::Duration::from_secs(self.ctx.settings.work_failer_period_sec);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.sweep_once().await {
                error!("failer sweep error: {e}");
            }
        }
        debug!("work failer stopped");
    }
}
