//! Queue message payloads.

use serde::{Deserialize, Serialize};

use crate::models::{WorkItem, WorkflowStep};

/// Signal that a service has ready work; drained by the scheduler pump.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerMessage {
    pub service_id: String,
}

/// The work-item view handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemPayload {
    pub id: i32,
    pub job_id: String,
    pub service_id: String,
    pub workflow_step_index: i32,
    /// The step's serialized operation, embedded as JSON.
    pub operation: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stac_catalog_location: Option<String>,
    /// For aggregate items, every input catalog of the sealed batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stac_catalog_locations: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroll_id: Option<String>,
}

/// One unit of deliverable work, published to a per-service queue and
/// returned by the work API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkMessage {
    pub work_item: WorkItemPayload,
    /// Page size limit for catalog-query items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cmr_granules: Option<i32>,
}

impl WorkMessage {
    /// Assemble the worker-facing message for a claimed item.
    pub fn for_item(
        item: &WorkItem,
        step: &WorkflowStep,
        max_cmr_granules: Option<i32>,
        batch_catalogs: Option<Vec<String>>,
    ) -> serde_json::Result<Self> {
        let operation: serde_json::Value = serde_json::from_str(&step.operation)?;
        Ok(Self {
            work_item: WorkItemPayload {
                id: item.id,
                job_id: item.job_id.clone(),
                service_id: item.service_id.clone(),
                workflow_step_index: item.workflow_step_index,
                operation,
                stac_catalog_location: item.stac_catalog_location.clone(),
                stac_catalog_locations: batch_catalogs,
                scroll_id: item.scroll_id.clone(),
            },
            max_cmr_granules: step.is_input_producer.then_some(max_cmr_granules).flatten(),
        })
    }
}
