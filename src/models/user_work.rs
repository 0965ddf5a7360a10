//! Materialized per-(user, service, job) work counters.
//!
//! These rows exist so dispatch can answer "which job should this service
//! work on next" without scanning the work-item table, and so selection can
//! rotate fairly across users.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters for one (username, service, job) combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserWork {
    pub id: i32,
    pub username: String,
    pub service_id: String,
    pub job_id: String,
    pub ready_count: i32,
    pub running_count: i32,
    pub is_async: bool,
    /// Last time dispatch handed out work for this row; drives fairness.
    pub last_worked: DateTime<Utc>,
}

impl UserWork {
    pub fn has_ready_work(&self) -> bool {
        self.ready_count > 0
    }
}
