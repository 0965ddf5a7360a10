//! Data models for stacflow.

mod batch;
mod job;
mod user_work;
mod work_item;
mod workflow_step;

pub use batch::{Batch, BatchItem};
pub use job::{ErrorCategory, Job, JobError, JobLink, JobStatus};
pub use user_work::UserWork;
pub use work_item::{ReportedStatus, WorkItem, WorkItemStatus, WorkItemUpdate};
pub use workflow_step::WorkflowStep;
