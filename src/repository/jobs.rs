//! Job store: jobs, their workflow steps, links, and errors.
//!
//! Status changes are funneled through [`JobRepository::set_status`], which
//! enforces the legal-transition table and applies default messages. The
//! `_in` functions operate on a caller-supplied connection so the update
//! processor can compose them into one transaction.

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};

use crate::models::{ErrorCategory, Job, JobError, JobLink, JobStatus, WorkflowStep};
use crate::schema::{job_errors, job_links, jobs, workflow_steps};
use crate::with_conn;

use super::records::{
    JobErrorRecord, JobLinkRecord, JobRecord, NewJob, NewJobError, NewJobLink, NewWorkflowStep,
    WorkflowStepRecord,
};
use super::{RepositoryError, Result, SqliteConn, SqlitePool};

/// Filter and page selection for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobListFilter {
    pub status: Option<JobStatus>,
    /// 1-based page number.
    pub page: i64,
    pub per_page: i64,
}

impl JobListFilter {
    pub fn page(page: i64, per_page: i64) -> Self {
        Self {
            status: None,
            page: page.max(1),
            per_page: per_page.clamp(1, 2000),
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn offset(&self) -> i64 {
        (self.page.max(1) - 1) * self.per_page
    }
}

/// One page of a job listing.
#[derive(Debug, Clone)]
pub struct JobListPage {
    pub jobs: Vec<Job>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

/// SQLite-backed job store.
#[derive(Clone)]
pub struct JobRepository {
    pool: SqlitePool,
}

impl JobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a job and its workflow steps in one transaction.
    ///
    /// Steps must be dense and 1-based; anything else is a validation error.
    pub async fn create(&self, job: &Job, steps: &[WorkflowStep]) -> Result<()> {
        for (position, step) in steps.iter().enumerate() {
            if step.step_index != position as i32 + 1 {
                return Err(RepositoryError::Validation(format!(
                    "workflow steps must be dense and 1-based, found index {} at position {}",
                    step.step_index, position
                )));
            }
        }
        if !(0..=100).contains(&job.progress) {
            return Err(RepositoryError::Validation(format!(
                "progress {} out of range",
                job.progress
            )));
        }

        let job = job.clone();
        let steps = steps.to_vec();
        with_conn!(self.pool, conn => {
            conn.transaction(|conn| {
                Box::pin(async move {
                    let now = Utc::now().to_rfc3339();
                    let collection_ids = serde_json::to_string(&job.collection_ids)?;
                    diesel::insert_into(jobs::table)
                        .values(NewJob {
                            id: &job.id,
                            username: &job.username,
                            status: job.status.as_str(),
                            message: &job.message,
                            progress: job.progress,
                            request_url: &job.request_url,
                            ignore_errors: job.ignore_errors as i32,
                            num_input_granules: job.num_input_granules,
                            collection_ids,
                            created_at: now.clone(),
                            updated_at: now.clone(),
                        })
                        .execute(conn)
                        .await?;

                    for step in &steps {
                        diesel::insert_into(workflow_steps::table)
                            .values(NewWorkflowStep {
                                job_id: &job.id,
                                step_index: step.step_index,
                                service_id: &step.service_id,
                                operation: &step.operation,
                                is_input_producer: step.is_input_producer as i32,
                                is_batched: step.is_batched as i32,
                                max_batch_inputs: step.max_batch_inputs,
                                max_batch_size_in_bytes: step.max_batch_size_in_bytes,
                                work_item_count: step.work_item_count,
                                ready_count: 0,
                                running_count: 0,
                                successful_count: 0,
                                failed_count: 0,
                                canceled_count: 0,
                                created_at: now.clone(),
                                updated_at: now.clone(),
                            })
                            .execute(conn)
                            .await?;
                    }
                    Ok::<_, RepositoryError>(())
                })
            })
            .await
        })
    }

    /// Fetch a job with links and errors embedded.
    pub async fn get(&self, job_id: &str) -> Result<Job> {
        with_conn!(self.pool, conn => {
            let mut job = Self::get_in(&mut conn, job_id).await?;
            job.links = job_links::table
                .filter(job_links::job_id.eq(job_id))
                .order(job_links::id.asc())
                .load::<JobLinkRecord>(&mut conn)
                .await?
                .into_iter()
                .map(JobLink::from)
                .collect();
            job.errors = job_errors::table
                .filter(job_errors::job_id.eq(job_id))
                .order(job_errors::id.asc())
                .load::<JobErrorRecord>(&mut conn)
                .await?
                .into_iter()
                .map(JobError::from)
                .collect();
            Ok(job)
        })
    }

    /// Fetch the bare job row on an existing connection.
    pub async fn get_in(conn: &mut SqliteConn, job_id: &str) -> Result<Job> {
        let record: Option<JobRecord> = jobs::table
            .find(job_id)
            .first(conn)
            .await
            .optional()?;
        record
            .map(Job::from)
            .ok_or_else(|| RepositoryError::NotFound(format!("job {job_id}")))
    }

    /// Fetch a job's workflow steps ordered by step index.
    pub async fn steps_in(conn: &mut SqliteConn, job_id: &str) -> Result<Vec<WorkflowStep>> {
        Ok(workflow_steps::table
            .filter(workflow_steps::job_id.eq(job_id))
            .order(workflow_steps::step_index.asc())
            .load::<WorkflowStepRecord>(conn)
            .await?
            .into_iter()
            .map(WorkflowStep::from)
            .collect())
    }

    pub async fn steps(&self, job_id: &str) -> Result<Vec<WorkflowStep>> {
        with_conn!(self.pool, conn => Self::steps_in(&mut conn, job_id).await)
    }

    /// Fetch one workflow step by index.
    pub async fn step_in(
        conn: &mut SqliteConn,
        job_id: &str,
        step_index: i32,
    ) -> Result<Option<WorkflowStep>> {
        Ok(workflow_steps::table
            .filter(workflow_steps::job_id.eq(job_id))
            .filter(workflow_steps::step_index.eq(step_index))
            .first::<WorkflowStepRecord>(conn)
            .await
            .optional()?
            .map(WorkflowStep::from))
    }

    /// Change a job's status, enforcing the transition table.
    ///
    /// Terminal completion statuses set progress to 100 atomically. When no
    /// message is supplied the status default is applied.
    pub async fn set_status(
        &self,
        job_id: &str,
        new_status: JobStatus,
        message: Option<&str>,
    ) -> Result<Job> {
        let job_id = job_id.to_string();
        let message = message.map(|m| m.to_string());
        with_conn!(self.pool, conn => {
            conn.transaction(|conn| {
                Box::pin(async move {
                    Self::set_status_in(conn, &job_id, new_status, message.as_deref()).await
                })
            })
            .await
        })
    }

    /// Transition a job on an existing connection (no nested transaction).
    pub async fn set_status_in(
        conn: &mut SqliteConn,
        job_id: &str,
        new_status: JobStatus,
        message: Option<&str>,
    ) -> Result<Job> {
        let mut job = Self::get_in(conn, job_id).await?;
        if !job.status.can_transition_to(new_status) {
            return Err(RepositoryError::IllegalStateTransition {
                from: job.status.as_str().to_string(),
                to: new_status.as_str().to_string(),
            });
        }

        let message = message
            .map(|m| m.to_string())
            .unwrap_or_else(|| new_status.default_message().to_string());
        let progress = match new_status {
            JobStatus::Successful | JobStatus::CompleteWithErrors => 100,
            _ => job.progress,
        };
        let now = Utc::now();
        diesel::update(jobs::table.find(job_id))
            .set((
                jobs::status.eq(new_status.as_str()),
                jobs::message.eq(&message),
                jobs::progress.eq(progress),
                jobs::updated_at.eq(now.to_rfc3339()),
            ))
            .execute(conn)
            .await?;

        job.status = new_status;
        job.message = message;
        job.progress = progress;
        job.updated_at = now;
        Ok(job)
    }

    /// Raise a job's progress; never lowers it.
    pub async fn update_progress_in(conn: &mut SqliteConn, job_id: &str, progress: i32) -> Result<()> {
        let progress = progress.clamp(0, 100);
        diesel::update(
            jobs::table
                .find(job_id)
                .filter(jobs::progress.lt(progress)),
        )
        .set((
            jobs::progress.eq(progress),
            jobs::updated_at.eq(Utc::now().to_rfc3339()),
        ))
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Record a per-granule error or warning against a job.
    pub async fn append_error_in(
        conn: &mut SqliteConn,
        job_id: &str,
        url: &str,
        message: &str,
        category: ErrorCategory,
    ) -> Result<()> {
        diesel::insert_into(job_errors::table)
            .values(NewJobError {
                job_id,
                url,
                message,
                category: category.as_str(),
                created_at: Utc::now().to_rfc3339(),
            })
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn append_error(
        &self,
        job_id: &str,
        url: &str,
        message: &str,
        category: ErrorCategory,
    ) -> Result<()> {
        with_conn!(self.pool, conn => {
            Self::append_error_in(&mut conn, job_id, url, message, category).await
        })
    }

    /// Count recorded errors of one category.
    pub async fn count_errors_in(
        conn: &mut SqliteConn,
        job_id: &str,
        category: ErrorCategory,
    ) -> Result<i64> {
        use diesel::dsl::count_star;
        Ok(job_errors::table
            .filter(job_errors::job_id.eq(job_id))
            .filter(job_errors::category.eq(category.as_str()))
            .select(count_star())
            .first(conn)
            .await?)
    }

    /// Attach links to a job, preserving order.
    pub async fn add_links_in(conn: &mut SqliteConn, job_id: &str, links: &[JobLink]) -> Result<()> {
        for link in links {
            diesel::insert_into(job_links::table)
                .values(NewJobLink {
                    job_id,
                    href: &link.href,
                    title: link.title.as_deref(),
                    rel: &link.rel,
                    content_type: link.content_type.as_deref(),
                    created_at: Utc::now().to_rfc3339(),
                })
                .execute(conn)
                .await?;
        }
        Ok(())
    }

    pub async fn add_links(&self, job_id: &str, links: &[JobLink]) -> Result<()> {
        with_conn!(self.pool, conn => Self::add_links_in(&mut conn, job_id, links).await)
    }

    /// List one user's jobs, newest first.
    pub async fn list_for_user(&self, username: &str, filter: &JobListFilter) -> Result<JobListPage> {
        use diesel::dsl::count_star;
        with_conn!(self.pool, conn => {
            let mut count_query = jobs::table
                .select(count_star())
                .filter(jobs::username.eq(username))
                .into_boxed();
            let mut page_query = jobs::table
                .filter(jobs::username.eq(username))
                .into_boxed();
            if let Some(status) = filter.status {
                count_query = count_query.filter(jobs::status.eq(status.as_str()));
                page_query = page_query.filter(jobs::status.eq(status.as_str()));
            }
            let total: i64 = count_query.first(&mut conn).await?;
            let records: Vec<JobRecord> = page_query
                .order(jobs::created_at.desc())
                .limit(filter.per_page)
                .offset(filter.offset())
                .load(&mut conn)
                .await?;
            Ok(JobListPage {
                jobs: records.into_iter().map(Job::from).collect(),
                total,
                page: filter.page,
                per_page: filter.per_page,
            })
        })
    }

    /// List jobs across all users, newest first.
    pub async fn list(&self, filter: &JobListFilter) -> Result<JobListPage> {
        use diesel::dsl::count_star;
        with_conn!(self.pool, conn => {
            let mut count_query = jobs::table.select(count_star()).into_boxed();
            let mut page_query = jobs::table.into_boxed();
            if let Some(status) = filter.status {
                count_query = count_query.filter(jobs::status.eq(status.as_str()));
                page_query = page_query.filter(jobs::status.eq(status.as_str()));
            }
            let total: i64 = count_query.first(&mut conn).await?;
            let records: Vec<JobRecord> = page_query
                .order(jobs::created_at.desc())
                .limit(filter.per_page)
                .offset(filter.offset())
                .load(&mut conn)
                .await?;
            Ok(JobListPage {
                jobs: records.into_iter().map(Job::from).collect(),
                total,
                page: filter.page,
                per_page: filter.per_page,
            })
        })
    }

    /// Rewrite each step's serialized operation with a fresh access token.
    pub async fn refresh_access_token_in(
        conn: &mut SqliteConn,
        job_id: &str,
        token: &str,
    ) -> Result<()> {
        let steps = Self::steps_in(conn, job_id).await?;
        for step in steps {
            let operation = step.with_access_token(token)?;
            diesel::update(workflow_steps::table.find(step.id))
                .set((
                    workflow_steps::operation.eq(operation),
                    workflow_steps::updated_at.eq(Utc::now().to_rfc3339()),
                ))
                .execute(conn)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::migrations;

    async fn repo() -> (JobRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = SqlitePool::from_path(&dir.path().join("test.db"));
        migrations::ensure_schema(&pool).await.unwrap();
        (JobRepository::new(pool), dir)
    }

    fn sample_job() -> (Job, Vec<WorkflowStep>) {
        let job = Job::new("ada", "https://example.com/req", 3, false);
        let steps = vec![
            WorkflowStep::new(1, "query-cmr", "{}").input_producer(),
            WorkflowStep::new(2, "subsetter", "{}"),
        ];
        (job, steps)
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let (repo, _dir) = repo().await;
        let (job, steps) = sample_job();
        repo.create(&job, &steps).await.unwrap();

        let fetched = repo.get(&job.id).await.unwrap();
        assert_eq!(fetched.username, "ada");
        assert_eq!(fetched.status, JobStatus::Accepted);
        assert_eq!(fetched.num_input_granules, 3);

        let steps = repo.steps(&job.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps[0].is_input_producer);
        assert!(!steps[1].is_input_producer);
    }

    #[tokio::test]
    async fn sparse_step_indexes_are_rejected() {
        let (repo, _dir) = repo().await;
        let job = Job::new("ada", "https://example.com/req", 1, false);
        let steps = vec![
            WorkflowStep::new(1, "query-cmr", "{}"),
            WorkflowStep::new(3, "subsetter", "{}"),
        ];
        let err = repo.create(&job, &steps).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Validation(_)));
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_and_leaves_job_alone() {
        let (repo, _dir) = repo().await;
        let (job, steps) = sample_job();
        repo.create(&job, &steps).await.unwrap();

        repo.set_status(&job.id, JobStatus::Running, None).await.unwrap();
        let err = repo
            .set_status(&job.id, JobStatus::CompleteWithErrors, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::IllegalStateTransition { .. }));
        assert_eq!(repo.get(&job.id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn default_message_and_progress_on_completion() {
        let (repo, _dir) = repo().await;
        let (job, steps) = sample_job();
        repo.create(&job, &steps).await.unwrap();

        let running = repo.set_status(&job.id, JobStatus::Running, None).await.unwrap();
        assert_eq!(running.message, "The job is being processed");

        let done = repo
            .set_status(&job.id, JobStatus::Successful, None)
            .await
            .unwrap();
        assert_eq!(done.progress, 100);
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let (repo, _dir) = repo().await;
        let (job, steps) = sample_job();
        repo.create(&job, &steps).await.unwrap();

        let mut conn = repo.pool.get().await.unwrap();
        JobRepository::update_progress_in(&mut conn, &job.id, 60).await.unwrap();
        JobRepository::update_progress_in(&mut conn, &job.id, 40).await.unwrap();
        assert_eq!(repo.get(&job.id).await.unwrap().progress, 60);
    }

    #[tokio::test]
    async fn listing_filters_by_status_and_pages() {
        let (repo, _dir) = repo().await;
        for _ in 0..3 {
            let (job, steps) = sample_job();
            repo.create(&job, &steps).await.unwrap();
        }

        let all = repo
            .list_for_user("ada", &JobListFilter::page(1, 2))
            .await
            .unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.jobs.len(), 2);

        let running = repo
            .list_for_user(
                "ada",
                &JobListFilter::page(1, 10).with_status(JobStatus::Running),
            )
            .await
            .unwrap();
        assert_eq!(running.total, 0);
    }
}
