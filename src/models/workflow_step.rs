//! Workflow step model.
//!
//! A job's pipeline is an ordered, dense list of steps. Each step names the
//! service image that performs it, carries the serialized operation handed
//! to workers, and tracks counters for the items flowing through it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stage in a job's service pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: i32,
    pub job_id: String,
    /// 1-based position in the pipeline, dense.
    pub step_index: i32,
    /// Service image reference, e.g. `ghcr.io/example/subsetter:latest`.
    pub service_id: String,
    /// Serialized work description handed to workers, JSON.
    pub operation: String,
    /// Steps that query the catalog produce the pipeline's inputs; their
    /// failures are never absorbed by `ignore_errors`.
    pub is_input_producer: bool,
    /// When true, completed inputs are grouped into batches before a single
    /// aggregate item is created for this step.
    pub is_batched: bool,
    pub max_batch_inputs: Option<i32>,
    pub max_batch_size_in_bytes: Option<i64>,
    /// Items created for this step so far. For an input-producer step this
    /// is fixed at creation from the granule count and page size.
    pub work_item_count: i32,
    pub ready_count: i32,
    pub running_count: i32,
    pub successful_count: i32,
    pub failed_count: i32,
    pub canceled_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowStep {
    /// Build a step definition for job creation; counters start at zero and
    /// ids are assigned by the store.
    pub fn new(
        step_index: i32,
        service_id: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            job_id: String::new(),
            step_index,
            service_id: service_id.into(),
            operation: operation.into(),
            is_input_producer: false,
            is_batched: false,
            max_batch_inputs: None,
            max_batch_size_in_bytes: None,
            work_item_count: 0,
            ready_count: 0,
            running_count: 0,
            successful_count: 0,
            failed_count: 0,
            canceled_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn input_producer(mut self) -> Self {
        self.is_input_producer = true;
        self
    }

    pub fn batched(mut self, max_inputs: i32, max_size_in_bytes: i64) -> Self {
        self.is_batched = true;
        self.max_batch_inputs = Some(max_inputs);
        self.max_batch_size_in_bytes = Some(max_size_in_bytes);
        self
    }

    /// Items that reached a terminal status.
    pub fn terminal_count(&self) -> i32 {
        self.successful_count + self.failed_count + self.canceled_count
    }

    /// Whether every created item has reached a terminal status.
    ///
    /// A step with no items yet is not complete; emptiness is resolved by
    /// the update processor, which knows whether the prior step can still
    /// produce inputs.
    pub fn all_items_terminal(&self) -> bool {
        self.work_item_count > 0 && self.terminal_count() >= self.work_item_count
    }

    /// Replace the access token inside the serialized operation.
    ///
    /// Tokens embedded at job creation can expire while a job sits paused or
    /// previewing; resume and skip-preview rewrite them before dispatch.
    pub fn with_access_token(&self, token: &str) -> serde_json::Result<String> {
        let mut op: serde_json::Value = serde_json::from_str(&self.operation)?;
        if let Some(obj) = op.as_object_mut() {
            obj.insert(
                "accessToken".to_string(),
                serde_json::Value::String(token.to_string()),
            );
        }
        serde_json::to_string(&op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_count_sums_terminal_statuses() {
        let mut step = WorkflowStep::new(1, "svc", "{}");
        step.work_item_count = 5;
        step.successful_count = 2;
        step.failed_count = 1;
        step.canceled_count = 1;
        assert_eq!(step.terminal_count(), 4);
        assert!(!step.all_items_terminal());
        step.successful_count = 3;
        assert!(step.all_items_terminal());
    }

    #[test]
    fn access_token_is_rewritten_in_place() {
        let step = WorkflowStep::new(
            1,
            "svc",
            r#"{"accessToken":"stale","sources":[{"collection":"C1"}]}"#,
        );
        let refreshed = step.with_access_token("fresh").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&refreshed).unwrap();
        assert_eq!(parsed["accessToken"], "fresh");
        assert_eq!(parsed["sources"][0]["collection"], "C1");
    }
}
