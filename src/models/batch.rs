//! Batch models for aggregating step inputs.
//!
//! When a step is batched, completed outputs from the prior step accumulate
//! in an open batch until an input-count or byte-size cap is reached, at
//! which point the batch is sealed into a single aggregate work item. The
//! final batch is sealed when the prior step can produce nothing further.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An aggregation bucket for a batched step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: i32,
    pub job_id: String,
    /// The batched (downstream) step this bucket feeds.
    pub step_index: i32,
    /// Position of this batch among the step's batches, 0-based.
    pub sort_index: i32,
    pub is_last: bool,
    /// A sealed batch has produced its aggregate work item and accepts no
    /// further inputs.
    pub is_sealed: bool,
    pub item_count: i32,
    pub total_size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    /// Whether adding one more input of `size` bytes would overflow the caps.
    pub fn would_overflow(&self, size: i64, max_inputs: Option<i32>, max_size: Option<i64>) -> bool {
        if let Some(max) = max_inputs {
            if self.item_count + 1 > max {
                return true;
            }
        }
        if let Some(max) = max_size {
            if self.item_count > 0 && self.total_size + size > max {
                return true;
            }
        }
        false
    }

    /// Whether the batch has reached either cap exactly.
    pub fn is_full(&self, max_inputs: Option<i32>, max_size: Option<i64>) -> bool {
        if let Some(max) = max_inputs {
            if self.item_count >= max {
                return true;
            }
        }
        if let Some(max) = max_size {
            if self.total_size >= max {
                return true;
            }
        }
        false
    }
}

/// One input captured in a batch: a result catalog from the prior step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: i32,
    pub batch_id: i32,
    /// The work item whose output this is.
    pub source_work_item_id: i32,
    pub stac_location: String,
    pub item_size: i64,
    /// Position within the batch, 0-based.
    pub sort_index: i32,
}
