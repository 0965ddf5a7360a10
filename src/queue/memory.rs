//! In-memory queue backend for single-process deployments and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Queue, QueueError, QueueProvider, ReceivedMessage, Result};

#[derive(Debug)]
struct Stored {
    body: String,
    #[allow(dead_code)]
    group_id: Option<String>,
}

#[derive(Default)]
struct Inner {
    waiting: VecDeque<Stored>,
    in_flight: HashMap<String, Stored>,
}

/// FIFO queue held in process memory.
///
/// Received messages move to an in-flight map until deleted, giving the
/// same at-least-once shape as an external queue service: an unacked
/// message is redelivered only by an explicit `requeue_in_flight`, which
/// tests use to simulate redelivery.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push every in-flight message back onto the queue (redelivery).
    pub async fn requeue_in_flight(&self) {
        let mut inner = self.inner.lock().await;
        let receipts: Vec<String> = inner.in_flight.keys().cloned().collect();
        for receipt in receipts {
            if let Some(stored) = inner.in_flight.remove(&receipt) {
                inner.waiting.push_back(stored);
            }
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn send(&self, body: &str, group_id: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.waiting.push_back(Stored {
            body: body.to_string(),
            group_id: group_id.map(|g| g.to_string()),
        });
        Ok(())
    }

    async fn receive(&self, max: usize) -> Result<Vec<ReceivedMessage>> {
        let mut inner = self.inner.lock().await;
        let mut received = Vec::new();
        while received.len() < max {
            let Some(stored) = inner.waiting.pop_front() else {
                break;
            };
            let receipt = Uuid::new_v4().to_string();
            received.push(ReceivedMessage {
                body: stored.body.clone(),
                receipt: receipt.clone(),
            });
            inner.in_flight.insert(receipt, stored);
        }
        Ok(received)
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .in_flight
            .remove(receipt)
            .map(|_| ())
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.to_string()))
    }

    async fn approx_depth(&self) -> Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner.waiting.len() as i64)
    }
}

/// Queue provider backed entirely by in-memory queues.
#[derive(Clone, Default)]
pub struct MemoryQueueProvider {
    update: MemoryQueue,
    scheduler: MemoryQueue,
    work: Arc<std::sync::Mutex<HashMap<String, Arc<MemoryQueue>>>>,
}

impl MemoryQueueProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueProvider for MemoryQueueProvider {
    fn update_queue(&self) -> Arc<dyn Queue> {
        Arc::new(self.update.clone())
    }

    fn scheduler_queue(&self) -> Arc<dyn Queue> {
        Arc::new(self.scheduler.clone())
    }

    fn work_queue(&self, service_id: &str) -> Arc<dyn Queue> {
        let mut map = self.work.lock().expect("work queue map poisoned");
        let queue = map
            .entry(service_id.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new()));
        queue.clone() as Arc<dyn Queue>
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_and_ack() {
        let queue = MemoryQueue::new();
        queue.send("a", None).await.unwrap();
        queue.send("b", Some("group")).await.unwrap();
        assert_eq!(queue.approx_depth().await.unwrap(), 2);

        let received = queue.receive(10).await.unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].body, "a");
        assert_eq!(received[1].body, "b");
        assert_eq!(queue.approx_depth().await.unwrap(), 0);

        queue.delete(&received[0].receipt).await.unwrap();
        assert!(queue.delete(&received[0].receipt).await.is_err());

        // Unacked messages can be redelivered.
        queue.requeue_in_flight().await;
        let again = queue.receive(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].body, "b");
    }

    #[tokio::test]
    async fn provider_reuses_service_queues() {
        let provider = MemoryQueueProvider::new();
        provider
            .work_queue("svc-a")
            .send("one", None)
            .await
            .unwrap();
        let depth = provider.work_queue("svc-a").approx_depth().await.unwrap();
        assert_eq!(depth, 1);
        let other = provider.work_queue("svc-b").approx_depth().await.unwrap();
        assert_eq!(other, 0);
    }
}
