//! Per-job serialization.
//!
//! SQLite has no row locks, so per-job ordering is enforced in process: the
//! update processor and the control surface hold a job's mutex for the whole
//! read-decide-write transaction. Updates for different jobs interleave
//! freely.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-job async mutexes.
#[derive(Default)]
pub struct JobLockMap {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JobLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a job, creating it on first use.
    pub async fn lock(&self, job_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("job lock map poisoned");
            // Drop entries nobody holds so the map tracks live jobs only.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(job_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.locks.lock().expect("job lock map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serializes_same_job_and_prunes() {
        let map = Arc::new(JobLockMap::new());
        let guard = map.lock("job-a").await;

        let contender = {
            let map = map.clone();
            tokio::spawn(async move {
                let _guard = map.lock("job-a").await;
            })
        };
        // The contender cannot finish while the guard is held.
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();

        // A different job's lock is independent and pruning clears dead rows.
        let _other = map.lock("job-b").await;
        assert_eq!(map.tracked(), 1);
    }
}
