//! Per-model bound on concurrently running compute
//!
//! Permits are held only while a synchronous closure runs on the blocking
//! pool, never across an `.await`. A task waiting on child work therefore
//! never holds a permit its children need.

use super::cancel::CancellationFlag;
use super::dispatcher::available_cores;
use crate::error::{ForgeResult, GraphForgeError};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct ParallelismLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl Default for ParallelismLimiter {
    fn default() -> Self {
        Self::new(available_cores())
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl ParallelismLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        ParallelismLimiter {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Closures currently holding a permit
    pub fn active(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    /// Run `work` on the blocking pool once a permit is free.
    ///
    /// Cancellation is checked after the permit is granted and before `work`
    /// starts; once started, `work` runs to completion.
    pub async fn run<R, F>(&self, cancel: &CancellationFlag, work: F) -> ForgeResult<R>
    where
        F: FnOnce() -> ForgeResult<R> + Send + 'static,
        R: Send + 'static,
    {
        cancel.check()?;
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| GraphForgeError::InternalError("parallelism limiter closed".to_string()))?;
        cancel.check()?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        });
        match handle.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => Err(GraphForgeError::TaskPanicked(panic_message(err.into_panic()))),
            Err(_) => Err(GraphForgeError::Cancelled),
        }
    }
}
