use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::CollaboratorError;

/// Bounded pool for CPU-bound collaborator work.
///
/// Calls run on tokio's blocking threads, but no more than `permits` at a
/// time, so model inference never starves the event loop or the disk.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
}

impl BlockingPool {
    pub fn new(threads: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(threads.max(1))),
        }
    }

    pub async fn run<F, T>(&self, work: F) -> Result<T, CollaboratorError>
    where
        F: FnOnce() -> Result<T, CollaboratorError> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CollaboratorError::Protocol("inference pool closed".into()))?;
        tokio::task::spawn_blocking(work).await?
    }
}
