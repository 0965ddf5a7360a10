//! Queue surfaces: per-service work queues, the scheduler queue, and the
//! update queue.
//!
//! The engine consumes four queue operations (send, receive, delete, depth)
//! behind a trait so deployments can swap the in-memory implementation for
//! an external FIFO service without touching orchestration code.

mod memory;
mod messages;

pub use memory::{MemoryQueue, MemoryQueueProvider};
pub use messages::{SchedulerMessage, WorkMessage};

use async_trait::async_trait;
use thiserror::Error;

/// Errors from queue backends.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue send failed: {0}")]
    Send(String),
    #[error("queue receive failed: {0}")]
    Receive(String),
    #[error("unknown receipt: {0}")]
    UnknownReceipt(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// A message handed to a consumer; `receipt` acknowledges it via
/// [`Queue::delete`]. Until deleted, delivery may repeat.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub body: String,
    pub receipt: String,
}

/// Minimal FIFO queue contract.
///
/// FIFO holds within a queue; consumers may still interleave at receive
/// time, and the engine does not depend on cross-message order.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue a message. `group_id` exists because downstream FIFO queue
    /// services require one; ordering across groups is not relied on.
    async fn send(&self, body: &str, group_id: Option<&str>) -> Result<()>;

    /// Receive up to `max` messages without removing them permanently.
    async fn receive(&self, max: usize) -> Result<Vec<ReceivedMessage>>;

    /// Acknowledge and remove a received message.
    async fn delete(&self, receipt: &str) -> Result<()>;

    /// Approximate number of messages waiting (excluding in-flight).
    async fn approx_depth(&self) -> Result<i64>;
}

/// Hands out the queue surfaces the engine talks to.
pub trait QueueProvider: Send + Sync {
    /// The single queue carrying work-item status updates.
    fn update_queue(&self) -> std::sync::Arc<dyn Queue>;

    /// The queue carrying "service X has ready work" signals.
    fn scheduler_queue(&self) -> std::sync::Arc<dyn Queue>;

    /// The per-service delivery queue.
    fn work_queue(&self, service_id: &str) -> std::sync::Arc<dyn Queue>;
}
