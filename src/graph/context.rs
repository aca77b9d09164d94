//! Per-invocation execution state handed to operators

use crate::error::ForgeResult;
use crate::memory::{AllocationContext, DataType, Element, TiledArray};
use crate::profiling::ProfilingContext;
use crate::runtime::{CancellationFlag, ParallelismLimiter, TaskGroup};
use crate::tensor::Tensor;
use std::sync::Arc;

/// Everything an operator needs from the invocation it runs in.
///
/// Cheap to clone; sub-tasks get their own clone.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    allocation: Arc<AllocationContext>,
    limiter: ParallelismLimiter,
    cancel: CancellationFlag,
    profiler: Option<Arc<ProfilingContext>>,
    invocation: u64,
}

impl ExecutionContext {
    pub fn new(
        allocation: Arc<AllocationContext>,
        limiter: ParallelismLimiter,
        cancel: CancellationFlag,
    ) -> Self {
        let invocation = allocation.id();
        ExecutionContext {
            allocation,
            limiter,
            cancel,
            profiler: None,
            invocation,
        }
    }

    pub fn with_profiler(mut self, profiler: Arc<ProfilingContext>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    pub fn allocation(&self) -> &Arc<AllocationContext> {
        &self.allocation
    }

    pub fn limiter(&self) -> &ParallelismLimiter {
        &self.limiter
    }

    pub fn cancel(&self) -> &CancellationFlag {
        &self.cancel
    }

    pub fn profiler(&self) -> Option<&Arc<ProfilingContext>> {
        self.profiler.as_ref()
    }

    pub fn invocation(&self) -> u64 {
        self.invocation
    }

    pub fn get_array<T: Element>(&self, shape: &[usize], fill_zeros: bool) -> ForgeResult<TiledArray<T>> {
        self.allocation.get_array(shape, fill_zeros)
    }

    pub fn get_tensor(
        &self,
        name: impl Into<String>,
        data_type: DataType,
        shape: &[usize],
        fill_zeros: bool,
    ) -> ForgeResult<Tensor> {
        self.allocation.get_tensor(name, data_type, shape, fill_zeros)
    }

    /// New sibling group bounded by this invocation's limiter
    pub fn task_group<T: Send + 'static>(&self) -> TaskGroup<T> {
        TaskGroup::new(&self.limiter, &self.cancel)
    }

    /// Run a single synchronous computation under a limiter permit
    pub async fn run_blocking<R, F>(&self, work: F) -> ForgeResult<R>
    where
        F: FnOnce() -> ForgeResult<R> + Send + 'static,
        R: Send + 'static,
    {
        self.limiter.run(&self.cancel, work).await
    }
}
