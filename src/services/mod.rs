//! Orchestration services.
//!
//! Everything here operates on a [`CoreContext`]: the database pool, the
//! resolved settings, the queue provider, and the per-job lock registry,
//! constructed once at process start and passed explicitly.

pub mod dispatcher;
pub mod failer;
pub mod job_locks;
pub mod orchestrator;
pub mod updater;

pub use dispatcher::Dispatcher;
pub use failer::WorkFailer;
pub use job_locks::JobLockMap;
pub use orchestrator::{JobRequest, Orchestrator};
pub use updater::{UpdateDisposition, UpdateProcessor};

use std::sync::Arc;

use crate::config::Settings;
use crate::queue::QueueProvider;
use crate::repository::{
    BatchRepository, JobRepository, SqlitePool, UserWorkRepository, WorkItemRepository,
};

/// Shared state for every orchestration operation.
#[derive(Clone)]
pub struct CoreContext {
    pub settings: Settings,
    pub pool: SqlitePool,
    pub queues: Arc<dyn QueueProvider>,
    pub jobs: JobRepository,
    pub work_items: WorkItemRepository,
    pub batches: BatchRepository,
    pub user_work: UserWorkRepository,
    pub locks: Arc<JobLockMap>,
}

impl CoreContext {
    pub fn new(settings: Settings, pool: SqlitePool, queues: Arc<dyn QueueProvider>) -> Self {
        Self {
            settings,
            jobs: JobRepository::new(pool.clone()),
            work_items: WorkItemRepository::new(pool.clone()),
            batches: BatchRepository::new(pool.clone()),
            user_work: UserWorkRepository::new(pool.clone()),
            pool,
            queues,
            locks: Arc::new(JobLockMap::new()),
        }
    }
}
