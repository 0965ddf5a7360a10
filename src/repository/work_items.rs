//! Work item store: creation, claiming, guarded updates, and sweeps.
//!
//! Work items move READY → QUEUED → RUNNING → terminal. Every transition
//! here also maintains the per-step counters and the user-work rows inside
//! the same transaction, which is what keeps dispatch selection O(1).

use chrono::{DateTime, Utc};
use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::sql_types::Integer;
use diesel_async::{AsyncConnection, RunQueryDsl};

use crate::models::{JobStatus, WorkItem, WorkItemStatus};
use crate::schema::{jobs, work_items, workflow_steps};
use crate::with_conn;

use super::records::{NewWorkItem, WorkItemRecord};
use super::user_work::UserWorkRepository;
use super::{RepositoryError, Result, SqliteConn, SqlitePool};

/// Counter deltas applied to a workflow step row.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepCounterDelta {
    pub total: i32,
    pub ready: i32,
    pub running: i32,
    pub successful: i32,
    pub failed: i32,
    pub canceled: i32,
}

/// Selection for the failer sweep.
#[derive(Debug, Clone)]
pub struct StaleItemQuery {
    /// Items last touched before this instant are candidates.
    pub older_than: DateTime<Utc>,
    pub statuses: Vec<WorkItemStatus>,
    pub job_statuses: Vec<JobStatus>,
    pub limit: i64,
    /// Resume cursor: only items with id greater than this are returned.
    pub starting_id: i32,
}

/// SQLite-backed work item store.
#[derive(Clone)]
pub struct WorkItemRepository {
    pool: SqlitePool,
}

impl WorkItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert work items on an existing connection, maintaining the step and
    /// user-work counters. Returns the items with assigned ids.
    pub async fn create_in(
        conn: &mut SqliteConn,
        username: &str,
        items: &[WorkItem],
    ) -> Result<Vec<WorkItem>> {
        let mut created = Vec::with_capacity(items.len());
        for item in items {
            if item.status != WorkItemStatus::Ready {
                return Err(RepositoryError::Validation(format!(
                    "new work items must be ready, got {}",
                    item.status.as_str()
                )));
            }
            let now = Utc::now().to_rfc3339();
            diesel::insert_into(work_items::table)
                .values(NewWorkItem {
                    job_id: &item.job_id,
                    service_id: &item.service_id,
                    workflow_step_index: item.workflow_step_index,
                    status: item.status.as_str(),
                    stac_catalog_location: item.stac_catalog_location.as_deref(),
                    batch_id: item.batch_id,
                    scroll_id: item.scroll_id.as_deref(),
                    retry_count: item.retry_count,
                    message: item.message.as_deref(),
                    results: serde_json::to_string(&item.results)?,
                    output_item_sizes: serde_json::to_string(&item.output_item_sizes)?,
                    total_items_size: item.total_items_size,
                    duration_ms: item.duration_ms,
                    created_at: now.clone(),
                    updated_at: now,
                    started_at: None,
                })
                .execute(conn)
                .await?;
            let id: i32 = diesel::select(sql::<Integer>("last_insert_rowid()"))
                .first(conn)
                .await?;

            let mut item = item.clone();
            item.id = id;

            Self::bump_step_counters_in(
                conn,
                &item.job_id,
                item.workflow_step_index,
                StepCounterDelta {
                    total: 1,
                    ready: 1,
                    ..Default::default()
                },
            )
            .await?;
            UserWorkRepository::adjust_in(conn, username, &item.service_id, &item.job_id, 1, 0)
                .await?;
            created.push(item);
        }
        Ok(created)
    }

    /// Insert work items in their own transaction.
    pub async fn create(&self, username: &str, items: &[WorkItem]) -> Result<Vec<WorkItem>> {
        let username = username.to_string();
        let items = items.to_vec();
        with_conn!(self.pool, conn => {
            conn.transaction(|conn| {
                Box::pin(async move { Self::create_in(conn, &username, &items).await })
            })
            .await
        })
    }

    pub async fn get_in(conn: &mut SqliteConn, id: i32) -> Result<WorkItem> {
        let record: Option<WorkItemRecord> = work_items::table
            .find(id)
            .first(conn)
            .await
            .optional()?;
        record
            .map(WorkItem::from)
            .ok_or_else(|| RepositoryError::NotFound(format!("work item {id}")))
    }

    pub async fn get(&self, id: i32) -> Result<WorkItem> {
        with_conn!(self.pool, conn => Self::get_in(&mut conn, id).await)
    }

    pub async fn list_by_job(&self, job_id: &str) -> Result<Vec<WorkItem>> {
        with_conn!(self.pool, conn => {
            let records: Vec<WorkItemRecord> = work_items::table
                .filter(work_items::job_id.eq(job_id))
                .order(work_items::id.asc())
                .load(&mut conn)
                .await?;
            Ok(records.into_iter().map(WorkItem::from).collect())
        })
    }

    /// Items of one step, ordered by id.
    pub async fn list_by_step_in(
        conn: &mut SqliteConn,
        job_id: &str,
        step_index: i32,
    ) -> Result<Vec<WorkItem>> {
        let records: Vec<WorkItemRecord> = work_items::table
            .filter(work_items::job_id.eq(job_id))
            .filter(work_items::workflow_step_index.eq(step_index))
            .order(work_items::id.asc())
            .load(conn)
            .await?;
        Ok(records.into_iter().map(WorkItem::from).collect())
    }

    /// Whether any item of a step is still non-terminal.
    pub async fn step_has_active_items_in(
        conn: &mut SqliteConn,
        job_id: &str,
        step_index: i32,
    ) -> Result<bool> {
        use diesel::dsl::count_star;
        let active = [
            WorkItemStatus::Ready.as_str(),
            WorkItemStatus::Queued.as_str(),
            WorkItemStatus::Running.as_str(),
        ];
        let count: i64 = work_items::table
            .filter(work_items::job_id.eq(job_id))
            .filter(work_items::workflow_step_index.eq(step_index))
            .filter(work_items::status.eq_any(active))
            .select(count_star())
            .first(conn)
            .await?;
        Ok(count > 0)
    }

    /// Atomically claim the next ready item for a service.
    ///
    /// Selection walks the user-work table: least recently worked
    /// (username, service) pair first, job id ascending as the tie-break,
    /// jobs that are not dispatchable excluded. The claimed item moves to
    /// `to_status` (QUEUED when headed for a queue, RUNNING when handed
    /// straight to a worker).
    pub async fn claim_next(
        &self,
        service_id: &str,
        to_status: WorkItemStatus,
    ) -> Result<Option<WorkItem>> {
        let service_id = service_id.to_string();
        with_conn!(self.pool, conn => {
            conn.transaction(|conn| {
                Box::pin(async move { Self::claim_next_in(conn, &service_id, to_status).await })
            })
            .await
        })
    }

    pub async fn claim_next_in(
        conn: &mut SqliteConn,
        service_id: &str,
        to_status: WorkItemStatus,
    ) -> Result<Option<WorkItem>> {
        debug_assert!(matches!(
            to_status,
            WorkItemStatus::Queued | WorkItemStatus::Running
        ));

        let Some(user_work) = UserWorkRepository::next_for_service_in(conn, service_id).await?
        else {
            return Ok(None);
        };

        let record: Option<WorkItemRecord> = work_items::table
            .filter(work_items::job_id.eq(&user_work.job_id))
            .filter(work_items::service_id.eq(service_id))
            .filter(work_items::status.eq(WorkItemStatus::Ready.as_str()))
            .order(work_items::id.asc())
            .first(conn)
            .await
            .optional()?;
        let Some(record) = record else {
            return Ok(None);
        };

        let now = Utc::now();
        let started_at = matches!(to_status, WorkItemStatus::Running).then(|| now.to_rfc3339());
        diesel::update(work_items::table.find(record.id))
            .set((
                work_items::status.eq(to_status.as_str()),
                work_items::updated_at.eq(now.to_rfc3339()),
                work_items::started_at.eq(started_at.clone()),
            ))
            .execute(conn)
            .await?;

        Self::bump_step_counters_in(
            conn,
            &record.job_id,
            record.workflow_step_index,
            StepCounterDelta {
                ready: -1,
                running: 1,
                ..Default::default()
            },
        )
        .await?;
        UserWorkRepository::adjust_in(
            conn,
            &user_work.username,
            service_id,
            &record.job_id,
            -1,
            1,
        )
        .await?;
        UserWorkRepository::touch_last_worked_in(conn, user_work.id).await?;

        let mut item = WorkItem::from(record);
        item.status = to_status;
        item.updated_at = now;
        item.started_at = super::parse_datetime_opt(started_at);
        Ok(Some(item))
    }

    /// Mark a queued item running once a worker picks it up.
    ///
    /// Idempotent for items already running; a terminal item is a conflict.
    pub async fn mark_running(&self, id: i32) -> Result<WorkItem> {
        let id_owned = id;
        with_conn!(self.pool, conn => {
            conn.transaction(|conn| {
                Box::pin(async move {
                    let mut item = Self::get_in(conn, id_owned).await?;
                    match item.status {
                        WorkItemStatus::Queued => {
                            let now = Utc::now();
                            diesel::update(work_items::table.find(id_owned))
                                .set((
                                    work_items::status.eq(WorkItemStatus::Running.as_str()),
                                    work_items::updated_at.eq(now.to_rfc3339()),
                                    work_items::started_at.eq(now.to_rfc3339()),
                                ))
                                .execute(conn)
                                .await?;
                            item.status = WorkItemStatus::Running;
                            item.updated_at = now;
                            item.started_at = Some(now);
                            Ok(item)
                        }
                        WorkItemStatus::Running => Ok(item),
                        status => Err(RepositoryError::Conflict(format!(
                            "work item {id_owned} is {}",
                            status.as_str()
                        ))),
                    }
                })
            })
            .await
        })
    }

    /// Persist the mutable fields of a work item from its domain value.
    ///
    /// The caller (the update processor) has already decided the next state;
    /// this writes it. Counter maintenance stays with the caller because the
    /// delta depends on the transition taken.
    pub async fn persist_in(conn: &mut SqliteConn, item: &WorkItem) -> Result<()> {
        diesel::update(work_items::table.find(item.id))
            .set((
                work_items::status.eq(item.status.as_str()),
                work_items::scroll_id.eq(item.scroll_id.as_deref()),
                work_items::retry_count.eq(item.retry_count),
                work_items::message.eq(item.message.as_deref()),
                work_items::results.eq(serde_json::to_string(&item.results)?),
                work_items::output_item_sizes.eq(serde_json::to_string(&item.output_item_sizes)?),
                work_items::total_items_size.eq(item.total_items_size),
                work_items::duration_ms.eq(item.duration_ms),
                work_items::updated_at.eq(Utc::now().to_rfc3339()),
                work_items::started_at.eq(item.started_at.map(|dt| dt.to_rfc3339())),
            ))
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Apply counter deltas to one workflow step row.
    pub async fn bump_step_counters_in(
        conn: &mut SqliteConn,
        job_id: &str,
        step_index: i32,
        delta: StepCounterDelta,
    ) -> Result<()> {
        use crate::schema::workflow_steps::dsl;
        let target = workflow_steps::table
            .filter(dsl::job_id.eq(job_id))
            .filter(dsl::step_index.eq(step_index));
        diesel::update(target)
            .set((
                dsl::work_item_count.eq(dsl::work_item_count + delta.total),
                dsl::ready_count.eq(dsl::ready_count + delta.ready),
                dsl::running_count.eq(dsl::running_count + delta.running),
                dsl::successful_count.eq(dsl::successful_count + delta.successful),
                dsl::failed_count.eq(dsl::failed_count + delta.failed),
                dsl::canceled_count.eq(dsl::canceled_count + delta.canceled),
                dsl::updated_at.eq(Utc::now().to_rfc3339()),
            ))
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Cancel every non-terminal item of a job; returns how many changed.
    ///
    /// Per-step counters are folded in the same transaction and the job's
    /// user-work rows are removed, so dispatch stops seeing the job at the
    /// commit boundary.
    pub async fn cancel_all_for_job_in(conn: &mut SqliteConn, job_id: &str) -> Result<i64> {
        let active = [
            WorkItemStatus::Ready.as_str(),
            WorkItemStatus::Queued.as_str(),
            WorkItemStatus::Running.as_str(),
        ];
        let victims: Vec<WorkItemRecord> = work_items::table
            .filter(work_items::job_id.eq(job_id))
            .filter(work_items::status.eq_any(active))
            .load(conn)
            .await?;

        let now = Utc::now().to_rfc3339();
        diesel::update(
            work_items::table
                .filter(work_items::job_id.eq(job_id))
                .filter(work_items::status.eq_any(active)),
        )
        .set((
            work_items::status.eq(WorkItemStatus::Canceled.as_str()),
            work_items::updated_at.eq(now),
        ))
        .execute(conn)
        .await?;

        // Fold the per-step effect of mass cancellation into the counters.
        let mut per_step: std::collections::HashMap<i32, StepCounterDelta> =
            std::collections::HashMap::new();
        for victim in &victims {
            let delta = per_step.entry(victim.workflow_step_index).or_default();
            match WorkItemStatus::from_str(&victim.status) {
                Some(WorkItemStatus::Ready) => delta.ready -= 1,
                _ => delta.running -= 1,
            }
            delta.canceled += 1;
        }
        for (step_index, delta) in per_step {
            Self::bump_step_counters_in(conn, job_id, step_index, delta).await?;
        }
        UserWorkRepository::delete_for_job_in(conn, job_id).await?;
        Ok(victims.len() as i64)
    }

    /// Items that have sat in the given statuses past the cutoff, for jobs
    /// in the given statuses, ordered by id ascending.
    pub async fn stale_items(&self, query: &StaleItemQuery) -> Result<Vec<WorkItem>> {
        let statuses: Vec<&'static str> = query.statuses.iter().map(|s| s.as_str()).collect();
        let job_statuses: Vec<&'static str> =
            query.job_statuses.iter().map(|s| s.as_str()).collect();
        let cutoff = query.older_than.to_rfc3339();
        with_conn!(self.pool, conn => {
            let records: Vec<WorkItemRecord> = work_items::table
                .inner_join(jobs::table)
                .filter(work_items::status.eq_any(statuses))
                .filter(jobs::status.eq_any(job_statuses))
                .filter(work_items::updated_at.lt(cutoff))
                .filter(work_items::id.gt(query.starting_id))
                .order(work_items::id.asc())
                .limit(query.limit)
                .select(WorkItemRecord::as_select())
                .load(&mut conn)
                .await?;
            Ok(records.into_iter().map(WorkItem::from).collect())
        })
    }

    /// Durations of successful runs for (job, service, step), for the
    /// failer's outlier threshold.
    pub async fn successful_durations(
        &self,
        job_id: &str,
        service_id: &str,
        step_index: i32,
    ) -> Result<Vec<i64>> {
        with_conn!(self.pool, conn => {
            let rows: Vec<i64> = work_items::table
                .filter(work_items::job_id.eq(job_id))
                .filter(work_items::service_id.eq(service_id))
                .filter(work_items::workflow_step_index.eq(step_index))
                .filter(work_items::status.eq(WorkItemStatus::Successful.as_str()))
                .select(work_items::duration_ms)
                .load(&mut conn)
                .await?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Job, WorkflowStep};
    use crate::repository::{migrations, JobRepository};

    async fn stores() -> (JobRepository, WorkItemRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = SqlitePool::from_path(&dir.path().join("test.db"));
        migrations::ensure_schema(&pool).await.unwrap();
        (
            JobRepository::new(pool.clone()),
            WorkItemRepository::new(pool),
            dir,
        )
    }

    async fn seeded_job(jobs: &JobRepository, items: &WorkItemRepository) -> Job {
        let job = Job::new("ada", "https://example.com/req", 2, false);
        let steps = vec![WorkflowStep::new(1, "query-cmr", "{}").input_producer()];
        jobs.create(&job, &steps).await.unwrap();
        jobs.set_status(&job.id, crate::models::JobStatus::Running, None)
            .await
            .unwrap();
        items
            .create(
                &job.username,
                &[WorkItem::new(&job.id, "query-cmr", 1)],
            )
            .await
            .unwrap();
        job
    }

    #[tokio::test]
    async fn creation_maintains_counters() {
        let (jobs, items, _dir) = stores().await;
        let job = seeded_job(&jobs, &items).await;

        let steps = jobs.steps(&job.id).await.unwrap();
        assert_eq!(steps[0].work_item_count, 1);
        assert_eq!(steps[0].ready_count, 1);
        assert_eq!(steps[0].running_count, 0);
    }

    #[tokio::test]
    async fn claim_moves_item_and_counters() {
        let (jobs, items, _dir) = stores().await;
        let job = seeded_job(&jobs, &items).await;

        let claimed = items
            .claim_next("query-cmr", WorkItemStatus::Running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, WorkItemStatus::Running);
        assert!(claimed.started_at.is_some());

        let steps = jobs.steps(&job.id).await.unwrap();
        assert_eq!(steps[0].ready_count, 0);
        assert_eq!(steps[0].running_count, 1);

        // Nothing left to claim.
        let next = items
            .claim_next("query-cmr", WorkItemStatus::Running)
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn claims_skip_non_dispatchable_jobs() {
        let (jobs, items, _dir) = stores().await;
        let job = seeded_job(&jobs, &items).await;
        jobs.set_status(&job.id, crate::models::JobStatus::Paused, None)
            .await
            .unwrap();

        let claimed = items
            .claim_next("query-cmr", WorkItemStatus::Queued)
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn cancel_all_folds_counters_and_clears_user_work() {
        let (jobs, items, _dir) = stores().await;
        let job = seeded_job(&jobs, &items).await;
        items
            .claim_next("query-cmr", WorkItemStatus::Running)
            .await
            .unwrap()
            .unwrap();
        items
            .create(&job.username, &[WorkItem::new(&job.id, "query-cmr", 1)])
            .await
            .unwrap();

        let mut conn = items.pool().get().await.unwrap();
        let canceled = WorkItemRepository::cancel_all_for_job_in(&mut conn, &job.id)
            .await
            .unwrap();
        assert_eq!(canceled, 2);

        let steps = jobs.steps(&job.id).await.unwrap();
        assert_eq!(steps[0].ready_count, 0);
        assert_eq!(steps[0].running_count, 0);
        assert_eq!(steps[0].canceled_count, 2);
    }

    #[tokio::test]
    async fn mark_running_rejects_terminal_items() {
        let (jobs, items, _dir) = stores().await;
        let _job = seeded_job(&jobs, &items).await;
        let claimed = items
            .claim_next("query-cmr", WorkItemStatus::Running)
            .await
            .unwrap()
            .unwrap();

        let mut conn = items.pool().get().await.unwrap();
        let mut done = claimed.clone();
        done.status = WorkItemStatus::Successful;
        WorkItemRepository::persist_in(&mut conn, &done).await.unwrap();

        let err = items.mark_running(claimed.id).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }
}
