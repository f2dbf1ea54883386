//! Bounded pool for blocking work (disk I/O, extraction, OCR).
//!
//! Tasks run on tokio's blocking threads, but at most `size` of them at a time; callers beyond
//! that wait for a permit instead of piling threads onto the runtime.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::domains::DomainError;

/// Semaphore-gated front for `spawn_blocking`.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// Create a pool running at most `size` blocking tasks concurrently.
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Run `task` on a blocking worker once a permit is available.
    pub async fn run<T, F>(&self, task: F) -> Result<T, DomainError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DomainError::Worker("worker pool closed".into()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            task()
        })
        .await
        .map_err(|error| DomainError::Worker(error.to_string()))
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn run_returns_task_output() {
        let pool = WorkerPool::new(2);
        let value = pool.run(|| 21 * 2).await.expect("task result");
        assert_eq!(value, 42);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_pool_size() {
        let pool = WorkerPool::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..6).map(|_| {
            let pool = pool.clone();
            let active = active.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                pool.run(move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            })
        });

        for task in futures_util::future::join_all(tasks).await {
            task.expect("join").expect("run");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn panicking_task_surfaces_worker_error() {
        let pool = WorkerPool::new(1);
        let result: Result<(), DomainError> = pool.run(|| panic!("boom")).await;
        assert!(matches!(result, Err(DomainError::Worker(_))));
        assert_eq!(pool.available(), 1);
    }
}
