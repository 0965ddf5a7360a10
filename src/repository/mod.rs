//! Repository layer for database persistence.

pub mod batches;
pub mod jobs;
pub mod migrations;
pub mod pool;
pub mod records;
pub mod user_work;
pub mod util;
pub mod work_items;

pub use batches::BatchRepository;
pub use jobs::{JobListFilter, JobListPage, JobRepository};
pub use pool::{DbError, SqliteConn, SqlitePool};
pub use user_work::UserWorkRepository;
pub use work_items::{StaleItemQuery, WorkItemRepository};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced by the stores.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("illegal status transition from {from} to {to}")]
    IllegalStateTransition { from: String, to: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("system error: {0}")]
    System(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse an optional datetime string from the database.
pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Parse a JSON string-array column, defaulting to empty on error.
pub fn parse_string_vec(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

/// Parse a JSON integer-array column, defaulting to empty on error.
pub fn parse_i64_vec(s: &str) -> Vec<i64> {
    serde_json::from_str(s).unwrap_or_default()
}
