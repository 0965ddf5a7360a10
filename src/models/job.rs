//! Job model and status machine.
//!
//! A job represents one user request moving through a chained service
//! pipeline. Status changes are validated against a fixed transition
//! table; terminal statuses are absorbing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Accepted,
    Previewing,
    Paused,
    Running,
    RunningWithErrors,
    CompleteWithErrors,
    Successful,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Previewing => "previewing",
            Self::Paused => "paused",
            Self::Running => "running",
            Self::RunningWithErrors => "running_with_errors",
            Self::CompleteWithErrors => "complete_with_errors",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "accepted" => Some(Self::Accepted),
            "previewing" => Some(Self::Previewing),
            "paused" => Some(Self::Paused),
            "running" => Some(Self::Running),
            "running_with_errors" => Some(Self::RunningWithErrors),
            "complete_with_errors" => Some(Self::CompleteWithErrors),
            "successful" => Some(Self::Successful),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Whether no further transition is allowed from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Successful | Self::Failed | Self::Canceled | Self::CompleteWithErrors
        )
    }

    /// Whether work for this job may be dispatched to services.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Running | Self::RunningWithErrors | Self::Previewing)
    }

    /// Legal transitions out of each status.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Accepted => matches!(next, Previewing | Running | Failed | Canceled),
            Previewing => matches!(next, Paused | Running | Failed | Canceled),
            Paused => matches!(next, Running | Canceled),
            Running => {
                matches!(next, RunningWithErrors | Paused | Successful | Failed | Canceled)
            }
            RunningWithErrors => matches!(next, CompleteWithErrors | Failed | Canceled),
            CompleteWithErrors | Successful | Failed | Canceled => false,
        }
    }

    /// Message applied when a caller supplies none.
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::Accepted => "The job has been accepted and is waiting to be processed",
            Self::Previewing => "The job is generating a preview before processing",
            Self::Paused => "The job is paused and may be resumed",
            Self::Running | Self::RunningWithErrors => "The job is being processed",
            Self::CompleteWithErrors => "The job has completed with errors, see the errors field",
            Self::Successful => "The job has completed successfully",
            Self::Failed => "The job failed with an unknown error",
            Self::Canceled => "Canceled by user.",
        }
    }
}

/// Severity of a recorded per-granule problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Error,
    Warning,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "error" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            _ => None,
        }
    }
}

/// A problem recorded against a job, tied to the granule that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub id: i32,
    pub job_id: String,
    /// URL identifying the input that failed.
    pub url: String,
    pub message: String,
    pub category: ErrorCategory,
    pub created_at: DateTime<Utc>,
}

/// A link attached to a job: data results, STAC entries, status pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLink {
    pub id: i32,
    pub job_id: String,
    pub href: String,
    pub title: Option<String>,
    pub rel: String,
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobLink {
    pub fn data(href: impl Into<String>, title: Option<String>) -> Self {
        Self {
            id: 0,
            job_id: String::new(),
            href: href.into(),
            title,
            rel: "data".to_string(),
            content_type: None,
            created_at: Utc::now(),
        }
    }

    pub fn stac_item(href: impl Into<String>) -> Self {
        Self {
            id: 0,
            job_id: String::new(),
            href: href.into(),
            title: None,
            rel: "item".to_string(),
            content_type: Some("application/json".to_string()),
            created_at: Utc::now(),
        }
    }
}

/// One user request with a lifecycle, pipeline, and result links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque UUID assigned at creation.
    pub id: String,
    pub username: String,
    pub status: JobStatus,
    pub message: String,
    /// 0-100, monotone non-decreasing while the job is alive.
    pub progress: i32,
    /// Original request URL, treated as opaque.
    pub request_url: String,
    /// When true, individual granule failures do not fail the whole job.
    pub ignore_errors: bool,
    pub num_input_granules: i32,
    /// Collections referenced by the request.
    pub collection_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Populated on fetch, ordered by insertion.
    pub links: Vec<JobLink>,
    /// Populated on fetch, ordered by insertion.
    pub errors: Vec<JobError>,
}

impl Job {
    /// Build a new accepted job for a request.
    pub fn new(
        username: impl Into<String>,
        request_url: impl Into<String>,
        num_input_granules: i32,
        ignore_errors: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            username: username.into(),
            status: JobStatus::Accepted,
            message: JobStatus::Accepted.default_message().to_string(),
            progress: 0,
            request_url: request_url.into(),
            ignore_errors,
            num_input_granules,
            collection_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            links: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Errors recorded with category `error`.
    pub fn error_count(&self) -> usize {
        self.errors
            .iter()
            .filter(|e| e.category == ErrorCategory::Error)
            .count()
    }

    /// Errors recorded with category `warning`.
    pub fn warning_count(&self) -> usize {
        self.errors
            .iter()
            .filter(|e| e.category == ErrorCategory::Warning)
            .count()
    }
}
