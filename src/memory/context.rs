//! Allocation contexts: the per-invocation view of a model's pools
//!
//! Every array an invocation allocates is registered with its context. When
//! the context closes, arrays whose blocks are all still reclaimable go back
//! to the pools; arrays holding an output block are left alone.
//!
//! A block is only pooled if the context can take sole ownership of it. A
//! block still referenced by some other array at close time is dropped from
//! the context's bookkeeping instead, so the pool never hands out a buffer
//! that a live array can still see.

use super::block::{block_size_for, blocks_for, Block, BlockCell};
use super::element::{DataType, Element};
use super::pool::BlockPool;
use super::storage::ModelArrayStorage;
use super::tiled::TiledArray;
use crate::error::{ForgeResult, GraphForgeError};
use crate::tensor::Tensor;
use crate::with_data_type;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// What happened to the blocks of a context when it closed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseSummary {
    /// Returned to a pool
    pub recycled_blocks: usize,
    /// Kept alive because their array was marked as an output
    pub retained_blocks: usize,
    /// Reclaimable but not pooled.
    ///
    /// Covers blocks still referenced outside the context (including by
    /// sub-tasks of a cancelled invocation that have not finished yet),
    /// poisoned blocks, and every block once the storage is closed. The pool
    /// counts the first kind as `abandoned_blocks` and the second as
    /// `dropped_blocks`; such blocks are freed when their last holder drops
    /// them and are never pooled again.
    pub dropped_blocks: usize,
}

impl CloseSummary {
    pub fn total(&self) -> usize {
        self.recycled_blocks + self.retained_blocks + self.dropped_blocks
    }
}

impl fmt::Display for CloseSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "recycled={} retained={} dropped={}",
            self.recycled_blocks, self.retained_blocks, self.dropped_blocks
        )
    }
}

/// An array registered with a context, type erased
trait Registration: Send {
    fn blocks_num(&self) -> usize;
    fn is_reclaimable(&self) -> bool;
    /// Hand blocks back to the pool. Returns `(recycled, dropped)`.
    fn reclaim(self: Box<Self>) -> (usize, usize);
}

struct Registered<T> {
    blocks: Vec<Block<T>>,
    pool: Option<Arc<BlockPool<T>>>,
}

impl<T: Element> Registration for Registered<T> {
    fn blocks_num(&self) -> usize {
        self.blocks.len()
    }

    fn is_reclaimable(&self) -> bool {
        self.blocks.iter().all(|b| b.marker().is_reclaimable())
    }

    fn reclaim(self: Box<Self>) -> (usize, usize) {
        let total = self.blocks.len();
        let owned: Vec<BlockCell<T>> = self
            .blocks
            .into_iter()
            .filter_map(|block| Arc::try_unwrap(block).ok())
            .collect();
        let recycled = match &self.pool {
            Some(pool) => {
                pool.note_abandoned(total - owned.len());
                pool.release(owned)
            }
            None => 0,
        };
        (recycled, total - recycled)
    }
}

#[derive(Default)]
struct ContextState {
    closed: bool,
    arrays: Vec<Box<dyn Registration>>,
    produced_blocks: usize,
}

/// Per-invocation allocator bound to one model's storage.
///
/// Shared across an invocation's sub-tasks behind an `Arc`. Closing is
/// idempotent; dropping an unclosed context closes it.
pub struct AllocationContext {
    id: u64,
    storage: Arc<ModelArrayStorage>,
    state: Mutex<ContextState>,
}

impl fmt::Debug for AllocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationContext")
            .field("id", &self.id)
            .field("model", &self.storage.model_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AllocationContext {
    pub(crate) fn new(storage: Arc<ModelArrayStorage>) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(context = id, model = %storage.model_id(), "opened allocation context");
        AllocationContext {
            id,
            storage,
            state: Mutex::new(ContextState::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn storage(&self) -> &Arc<ModelArrayStorage> {
        &self.storage
    }

    pub fn is_closed(&self) -> bool {
        match self.state.lock() {
            Ok(state) => state.closed,
            Err(poisoned) => poisoned.into_inner().closed,
        }
    }

    /// Blocks drawn through this context so far
    pub fn produced_blocks(&self) -> usize {
        match self.state.lock() {
            Ok(state) => state.produced_blocks,
            Err(poisoned) => poisoned.into_inner().produced_blocks,
        }
    }

    /// Allocate an array of `shape` from the model's pools.
    ///
    /// Blocks come back with `Unused` markers. Pooled blocks keep their old
    /// contents unless `fill_zeros` is set; fresh blocks are always zeroed.
    pub fn get_array<T: Element>(&self, shape: &[usize], fill_zeros: bool) -> ForgeResult<TiledArray<T>> {
        let block_size = block_size_for(shape);
        let count = blocks_for(shape, block_size);
        if self.is_closed() {
            return Err(GraphForgeError::ContextClosed(self.id));
        }

        // Drawn and zeroed outside the state lock; only registration is serialized
        let (cells, pool) = if self.storage.pooling_enabled() {
            let pool = self.storage.pool::<T>()?;
            (pool.acquire(block_size, count, fill_zeros), Some(pool))
        } else {
            let cells: Vec<BlockCell<T>> = (0..count).map(|_| BlockCell::zeroed(block_size)).collect();
            (cells, None)
        };

        let mut state = self.state.lock()?;
        if state.closed {
            drop(state);
            if let (Some(pool), false) = (&pool, self.storage.is_closed()) {
                pool.release(cells);
            }
            return Err(GraphForgeError::ContextClosed(self.id));
        }
        let blocks: Vec<Block<T>> = cells.into_iter().map(Arc::new).collect();
        state.produced_blocks += blocks.len();
        state.arrays.push(Box::new(Registered {
            blocks: blocks.clone(),
            pool,
        }));
        drop(state);

        TiledArray::from_blocks(shape, block_size, blocks)
    }

    /// Allocate a named tensor of a runtime element type
    pub fn get_tensor(
        &self,
        name: impl Into<String>,
        data_type: DataType,
        shape: &[usize],
        fill_zeros: bool,
    ) -> ForgeResult<Tensor> {
        let name = name.into();
        with_data_type!(data_type, T => Ok(Tensor::from_array(name, self.get_array::<T>(shape, fill_zeros)?)))
    }

    /// Allocate an array shaped like `like` with the same element type
    pub fn get_array_like<T: Element>(&self, like: &TiledArray<T>, fill_zeros: bool) -> ForgeResult<TiledArray<T>> {
        self.get_array(like.shape(), fill_zeros)
    }

    /// Promote a tensor to an output of this invocation
    pub fn mark_output(&self, tensor: &Tensor) {
        tensor.mark_output();
    }

    /// Promote a tensor to a value that outlives every context
    pub fn mark_global_output(&self, tensor: &Tensor) {
        tensor.mark_global_output();
    }

    /// Return reclaimable arrays to the pools.
    ///
    /// Second and later calls return an empty summary.
    pub fn close(&self) -> CloseSummary {
        let arrays = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.closed {
                return CloseSummary::default();
            }
            state.closed = true;
            std::mem::take(&mut state.arrays)
        };

        let pooling = !self.storage.is_closed();
        let mut summary = CloseSummary::default();
        for array in arrays {
            if !array.is_reclaimable() {
                summary.retained_blocks += array.blocks_num();
            } else if pooling {
                let (recycled, dropped) = array.reclaim();
                summary.recycled_blocks += recycled;
                summary.dropped_blocks += dropped;
            } else {
                summary.dropped_blocks += array.blocks_num();
            }
        }

        tracing::debug!(
            context = self.id,
            model = %self.storage.model_id(),
            recycled = summary.recycled_blocks,
            retained = summary.retained_blocks,
            dropped = summary.dropped_blocks,
            "closed allocation context"
        );
        summary
    }
}

impl Drop for AllocationContext {
    fn drop(&mut self) {
        self.close();
    }
}
