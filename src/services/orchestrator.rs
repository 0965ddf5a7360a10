//! The library-level control surface frontends call.
//!
//! Jobs are created with an ordered pipeline and one initial catalog-query
//! item; cancel, pause, resume, and skip-preview run under the same per-job
//! lock as the update processor, so control actions and status updates for
//! one job never interleave.

use tracing::{info, warn};

use crate::models::{Job, JobStatus, WorkItem, WorkflowStep};
use crate::repository::{
    JobListFilter, JobListPage, JobRepository, RepositoryError, Result, WorkItemRepository,
};

use super::updater::announce_services;
use super::{CoreContext, UpdateProcessor};

/// Everything needed to admit one user request.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub username: String,
    pub request_url: String,
    pub ignore_errors: bool,
    pub num_input_granules: i32,
    pub collection_ids: Vec<String>,
    /// Pipeline definition, step indexes 1..=n.
    pub steps: Vec<WorkflowStep>,
    /// Start in PREVIEWING instead of RUNNING.
    pub preview: bool,
}

/// Frontend facade over the orchestration core.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: CoreContext,
    updater: UpdateProcessor,
}

impl Orchestrator {
    pub fn new(ctx: CoreContext) -> Self {
        let updater = UpdateProcessor::new(ctx.clone());
        Self { ctx, updater }
    }

    /// Admit a job: persist it with its pipeline, seed the first catalog
    /// query item, and open it for dispatch.
    pub async fn create_job(&self, request: JobRequest) -> Result<Job> {
        if request.steps.is_empty() {
            return Err(RepositoryError::Validation(
                "a job needs at least one workflow step".to_string(),
            ));
        }
        if request.num_input_granules < 1 {
            return Err(RepositoryError::Validation(
                "a job needs at least one input granule".to_string(),
            ));
        }
        let mut granules = request.num_input_granules;
        let limit = self.ctx.settings.max_granule_limit;
        if granules > limit {
            warn!(
                requested = granules,
                limit, "granule count clamped to the system limit"
            );
            granules = limit;
        }

        let mut job = Job::new(
            &request.username,
            &request.request_url,
            granules,
            request.ignore_errors,
        );
        job.collection_ids = request.collection_ids.clone();
        self.ctx.jobs.create(&job, &request.steps).await?;

        let first = &request.steps[0];
        let seed = WorkItem::new(&job.id, &first.service_id, first.step_index);
        self.ctx
            .work_items
            .create(&request.username, &[seed])
            .await?;

        let opened = if request.preview {
            JobStatus::Previewing
        } else {
            JobStatus::Running
        };
        let job = self.ctx.jobs.set_status(&job.id, opened, None).await?;
        announce_services(
            &self.ctx.queues.scheduler_queue(),
            &[first.service_id.clone()],
        )
        .await;
        info!(job_id = %job.id, username = %job.username, "job created");
        Ok(job)
    }

    /// Fetch a job with links and errors embedded.
    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        self.ctx.jobs.get(job_id).await
    }

    /// A job's workflow steps with live counters.
    pub async fn job_steps(&self, job_id: &str) -> Result<Vec<WorkflowStep>> {
        self.ctx.jobs.steps(job_id).await
    }

    /// A job's work items.
    pub async fn job_items(&self, job_id: &str) -> Result<Vec<WorkItem>> {
        self.ctx.work_items.list_by_job(job_id).await
    }

    /// List one user's jobs.
    pub async fn list_jobs(&self, username: &str, filter: &JobListFilter) -> Result<JobListPage> {
        self.ctx.jobs.list_for_user(username, filter).await
    }

    /// List all jobs (operator surface).
    pub async fn list_all_jobs(&self, filter: &JobListFilter) -> Result<JobListPage> {
        self.ctx.jobs.list(filter).await
    }

    /// Cancel a job and every non-terminal item it owns.
    ///
    /// `admin` only changes the default message; both surfaces share the
    /// transition rules.
    pub async fn cancel_job(&self, job_id: &str, message: Option<&str>, admin: bool) -> Result<Job> {
        let _guard = self.ctx.locks.lock(job_id).await;
        let default = if admin {
            "Canceled by admin."
        } else {
            "Canceled by user."
        };
        let message = message.unwrap_or(default).to_string();
        let job_id = job_id.to_string();
        let mut conn = self.ctx.pool.get().await?;
        use diesel_async::AsyncConnection;
        let job = conn
            .transaction(|conn| {
                Box::pin(async move {
                    let job = JobRepository::set_status_in(
                        conn,
                        &job_id,
                        JobStatus::Canceled,
                        Some(&message),
                    )
                    .await?;
                    let canceled = WorkItemRepository::cancel_all_for_job_in(conn, &job_id).await?;
                    info!(job_id = %job_id, canceled, "job canceled");
                    Ok::<_, RepositoryError>(job)
                })
            })
            .await?;
        Ok(job)
    }

    /// Pause a job; its ready items stay put but dispatch stops seeing it.
    pub async fn pause_job(&self, job_id: &str) -> Result<Job> {
        let _guard = self.ctx.locks.lock(job_id).await;
        let job = self.ctx.jobs.set_status(job_id, JobStatus::Paused, None).await?;
        info!(job_id = %job_id, "job paused");
        Ok(job)
    }

    /// Resume a paused job and re-announce its ready work.
    ///
    /// A fresh access token, when supplied, replaces the one embedded in
    /// every step's operation; paused jobs routinely outlive token
    /// lifetimes.
    pub async fn resume_job(&self, job_id: &str, access_token: Option<&str>) -> Result<Job> {
        self.reopen(job_id, access_token).await
    }

    /// Move a previewing job straight to RUNNING.
    ///
    /// The embedded access tokens are refreshed: previews can sit long
    /// enough for the ones captured at creation to expire.
    pub async fn skip_preview(&self, job_id: &str, access_token: Option<&str>) -> Result<Job> {
        self.reopen(job_id, access_token).await
    }

    /// Shared PAUSED/PREVIEWING -> RUNNING path.
    async fn reopen(&self, job_id: &str, access_token: Option<&str>) -> Result<Job> {
        let _guard = self.ctx.locks.lock(job_id).await;
        let job_id_owned = job_id.to_string();
        let token = access_token.map(|t| t.to_string());
        let this = self.clone();
        let mut conn = self.ctx.pool.get().await?;
        use diesel_async::AsyncConnection;
        let job = conn
            .transaction(|conn| {
                Box::pin(async move {
                    if let Some(token) = &token {
                        JobRepository::refresh_access_token_in(conn, &job_id_owned, token).await?;
                    }
                    let job = JobRepository::set_status_in(
                        conn,
                        &job_id_owned,
                        JobStatus::Running,
                        None,
                    )
                    .await?;
                    // Everything may already be terminal; settle the verdict
                    // instead of waiting for an update that will never come.
                    this.updater.complete_job_if_done(conn, &job).await?;
                    JobRepository::get_in(conn, &job_id_owned).await
                })
            })
            .await?;

        if !job.status.is_terminal() {
            let ready: Vec<String> = self
                .ctx
                .user_work
                .list_for_job(job_id)
                .await?
                .into_iter()
                .filter(|row| row.has_ready_work())
                .map(|row| row.service_id)
                .collect();
            announce_services(&self.ctx.queues.scheduler_queue(), &ready).await;
        }
        info!(job_id = %job_id, status = job.status.as_str(), "job reopened");
        Ok(job)
    }
}
