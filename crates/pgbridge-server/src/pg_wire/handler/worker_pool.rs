//! Bounded worker pool for backend calls
//!
//! Backend collaborators are synchronous. Every call runs on tokio's blocking
//! threads, gated by a semaphore shared across all sessions so a busy session
//! cannot take more than the configured number of workers.

use crate::metrics;
use pgbridge_common::PgWireError;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers not currently running a task
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `task` on a worker and wait for its result
    pub async fn run<F, T>(&self, task: F) -> Result<T, PgWireError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PgWireError::ExecutionFailure(anyhow::anyhow!("worker pool is shut down")))?;
        metrics::update_workers_busy(self.busy());
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            task()
        })
        .await
        .map_err(|e| {
            warn!("Worker task failed: {}", e);
            PgWireError::ExecutionFailure(anyhow::anyhow!("worker task failed: {}", e))
        });
        metrics::update_workers_busy(self.busy());
        result
    }

    fn busy(&self) -> usize {
        self.size.saturating_sub(self.available())
    }
}
