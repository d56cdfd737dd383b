// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Bounded pool for blocking file work

use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::{Result, TidydeskError};

/// At most `max_workers` closures run at once; the rest wait for a permit.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Permits not currently held
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `f` on the blocking thread pool once a permit is free
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| TidydeskError::Pool("worker pool closed".to_string()))?;
        debug!("Worker acquired ({} free)", self.permits.available_permits());

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| TidydeskError::Pool(format!("worker task failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_closure() {
        let pool = WorkerPool::new(2);
        assert_eq!(pool.run(|| 40 + 2).await.unwrap(), 42);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_zero_workers_means_one() {
        assert_eq!(WorkerPool::new(0).max_workers(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_panicking_job_reports_pool_error() {
        let pool = WorkerPool::new(1);
        let result: Result<()> = pool.run(|| panic!("boom")).await;
        assert!(matches!(result, Err(TidydeskError::Pool(_))));
        // permit released after the panic
        assert_eq!(pool.run(|| 1).await.unwrap(), 1);
    }
}
