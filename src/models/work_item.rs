//! Work item model and update payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Ready,
    Queued,
    Running,
    Successful,
    Warning,
    Failed,
    Canceled,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Successful => "successful",
            Self::Warning => "warning",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ready" => Some(Self::Ready),
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "successful" => Some(Self::Successful),
            "warning" => Some(Self::Warning),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Successful | Self::Warning | Self::Failed | Self::Canceled)
    }

    /// Statuses that count as produced output for downstream steps.
    pub fn has_output(&self) -> bool {
        matches!(self, Self::Successful | Self::Warning)
    }
}

/// One executable unit for one step of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i32,
    pub job_id: String,
    pub service_id: String,
    /// 1-based index of the owning workflow step.
    pub workflow_step_index: i32,
    pub status: WorkItemStatus,
    /// Input STAC catalog for this item; absent for input-producer items,
    /// which query the catalog service instead.
    pub stac_catalog_location: Option<String>,
    /// For aggregate items, the sealed batch whose inputs this item covers.
    pub batch_id: Option<i32>,
    /// Pagination cursor carried between successive catalog-query items.
    pub scroll_id: Option<String>,
    pub retry_count: i32,
    pub message: Option<String>,
    /// Result catalog URIs reported by the worker.
    pub results: Vec<String>,
    /// Per-output sizes in bytes, parallel to `results`.
    pub output_item_sizes: Vec<i64>,
    pub total_items_size: i64,
    /// Wall-clock run time reported by the worker, milliseconds.
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Build a READY item for a step. Ids are assigned by the store.
    pub fn new(
        job_id: impl Into<String>,
        service_id: impl Into<String>,
        workflow_step_index: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            job_id: job_id.into(),
            service_id: service_id.into(),
            workflow_step_index,
            status: WorkItemStatus::Ready,
            stac_catalog_location: None,
            batch_id: None,
            scroll_id: None,
            retry_count: 0,
            message: None,
            results: Vec::new(),
            output_item_sizes: Vec::new(),
            total_items_size: 0,
            duration_ms: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
        }
    }

    pub fn with_catalog(mut self, location: impl Into<String>) -> Self {
        self.stac_catalog_location = Some(location.into());
        self
    }

    pub fn with_scroll_id(mut self, scroll_id: impl Into<String>) -> Self {
        self.scroll_id = Some(scroll_id.into());
        self
    }

    /// Milliseconds since the item was last touched.
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.updated_at).num_milliseconds()
    }
}

/// Statuses a worker may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Successful,
    Warning,
    Failed,
}

impl From<ReportedStatus> for WorkItemStatus {
    fn from(status: ReportedStatus) -> Self {
        match status {
            ReportedStatus::Successful => WorkItemStatus::Successful,
            ReportedStatus::Warning => WorkItemStatus::Warning,
            ReportedStatus::Failed => WorkItemStatus::Failed,
        }
    }
}

/// A status report for one work item, posted by a worker or synthesized by
/// the failer, and consumed from the update queue.
///
/// The failure reason travels as `errorMessage` on the wire (that spelling
/// is what deployed services emit, and what serialization produces), but
/// newer workers send `message`. Payloads are parsed through a wire struct
/// holding both keys as separate fields, so a body carrying both is not a
/// duplicate-key error; `message` takes precedence when both are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "WorkItemUpdateWire")]
pub struct WorkItemUpdate {
    /// Defaults to 0 so HTTP bodies may omit it; the handler fills it from
    /// the path.
    pub work_item_id: i32,
    pub status: ReportedStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_step_index: Option<i32>,
    pub results: Vec<String>,
    pub output_item_sizes: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_items_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroll_id: Option<String>,
    /// The single in-crate name for the human-readable failure reason.
    #[serde(rename = "errorMessage", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// Wire shape of [`WorkItemUpdate`]: `message` and `errorMessage` are
/// distinct optional fields here so both may appear in one payload.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkItemUpdateWire {
    #[serde(default)]
    work_item_id: i32,
    status: ReportedStatus,
    #[serde(default)]
    workflow_step_index: Option<i32>,
    #[serde(default)]
    results: Vec<String>,
    #[serde(default)]
    output_item_sizes: Vec<i64>,
    #[serde(default)]
    total_items_size: Option<i64>,
    #[serde(default)]
    scroll_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    duration_ms: Option<i64>,
}

impl From<WorkItemUpdateWire> for WorkItemUpdate {
    fn from(wire: WorkItemUpdateWire) -> Self {
        WorkItemUpdate {
            work_item_id: wire.work_item_id,
            status: wire.status,
            workflow_step_index: wire.workflow_step_index,
            results: wire.results,
            output_item_sizes: wire.output_item_sizes,
            total_items_size: wire.total_items_size,
            scroll_id: wire.scroll_id,
            message: wire.message.or(wire.error_message),
            duration_ms: wire.duration_ms,
        }
    }
}

impl WorkItemUpdate {
    pub fn success(work_item_id: i32, results: Vec<String>) -> Self {
        Self {
            work_item_id,
            status: ReportedStatus::Successful,
            workflow_step_index: None,
            results,
            output_item_sizes: Vec::new(),
            total_items_size: None,
            scroll_id: None,
            message: None,
            duration_ms: None,
        }
    }

    pub fn failure(work_item_id: i32, message: impl Into<String>) -> Self {
        Self {
            work_item_id,
            status: ReportedStatus::Failed,
            workflow_step_index: None,
            results: Vec::new(),
            output_item_sizes: Vec::new(),
            total_items_size: None,
            scroll_id: None,
            message: Some(message.into()),
            duration_ms: None,
        }
    }

    /// Total output size: the reported total when present, else the sum of
    /// the per-output sizes.
    pub fn effective_total_size(&self) -> i64 {
        self.total_items_size
            .unwrap_or_else(|| self.output_item_sizes.iter().sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(WorkItemStatus::Successful.is_terminal());
        assert!(WorkItemStatus::Warning.is_terminal());
        assert!(WorkItemStatus::Failed.is_terminal());
        assert!(WorkItemStatus::Canceled.is_terminal());
        assert!(!WorkItemStatus::Ready.is_terminal());
        assert!(!WorkItemStatus::Queued.is_terminal());
        assert!(!WorkItemStatus::Running.is_terminal());
    }

    #[test]
    fn update_accepts_error_message_key() {
        let update: WorkItemUpdate = serde_json::from_str(
            r#"{"workItemId": 7, "status": "failed", "errorMessage": "out of memory"}"#,
        )
        .unwrap();
        assert_eq!(update.message.as_deref(), Some("out of memory"));

        let update: WorkItemUpdate = serde_json::from_str(
            r#"{"workItemId": 7, "status": "failed", "message": "out of memory"}"#,
        )
        .unwrap();
        assert_eq!(update.message.as_deref(), Some("out of memory"));
    }

    #[test]
    fn message_wins_when_both_keys_are_present() {
        // Both spellings in one payload must not be a duplicate-key error.
        let update: WorkItemUpdate = serde_json::from_str(
            r#"{
                "workItemId": 7,
                "status": "failed",
                "message": "newer reason",
                "errorMessage": "legacy reason"
            }"#,
        )
        .unwrap();
        assert_eq!(update.message.as_deref(), Some("newer reason"));
    }

    #[test]
    fn update_serializes_the_wire_spelling() {
        let update = WorkItemUpdate::failure(7, "out of memory");
        let body = serde_json::to_value(&update).unwrap();
        assert_eq!(body["errorMessage"], "out of memory");
        assert!(body.get("message").is_none());

        // What the failer writes, the update consumer reads back.
        let parsed: WorkItemUpdate = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.message.as_deref(), Some("out of memory"));
    }

    #[test]
    fn effective_total_size_falls_back_to_sum() {
        let mut update = WorkItemUpdate::success(1, vec!["s3://a".into(), "s3://b".into()]);
        update.output_item_sizes = vec![10, 32];
        assert_eq!(update.effective_total_size(), 42);
        update.total_items_size = Some(100);
        assert_eq!(update.effective_total_size(), 100);
    }
}
