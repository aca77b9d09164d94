//! Free-lists of reusable blocks for one element type
//!
//! Buckets are keyed by block size. Each bucket has its own lock so that
//! invocations drawing blocks of different sizes never contend; the outer map
//! lock is only taken to look up or create a bucket.
//!
//! Pools are unbounded. Nothing is evicted implicitly; the owning model calls
//! [`BlockPool::clear`] when it wants the memory back.

use super::block::BlockCell;
use super::element::Element;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

type FreeList<T> = VecDeque<BlockCell<T>>;

/// Allocation counters for one pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Blocks allocated because the bucket was empty
    pub fresh_blocks: usize,
    /// Blocks handed out from a free-list
    pub reused_blocks: usize,
    /// Blocks returned to a free-list
    pub released_blocks: usize,
    /// Blocks refused on release (poisoned by a panicking writer)
    pub dropped_blocks: usize,
    /// Blocks a closing context could not take back because some array
    /// outside it still held them, such as a sub-task of a cancelled
    /// invocation that was still running
    pub abandoned_blocks: usize,
    /// Blocks currently sitting in free-lists
    pub free_blocks: usize,
}

impl PoolStats {
    pub fn merge(&mut self, other: &PoolStats) {
        self.fresh_blocks += other.fresh_blocks;
        self.reused_blocks += other.reused_blocks;
        self.released_blocks += other.released_blocks;
        self.dropped_blocks += other.dropped_blocks;
        self.abandoned_blocks += other.abandoned_blocks;
        self.free_blocks += other.free_blocks;
    }
}

/// Pool of blocks of element type `T`, keyed by block size
#[derive(Debug)]
pub struct BlockPool<T> {
    buckets: RwLock<HashMap<usize, Arc<Mutex<FreeList<T>>>>>,
    fresh: AtomicUsize,
    reused: AtomicUsize,
    released: AtomicUsize,
    dropped: AtomicUsize,
    abandoned: AtomicUsize,
}

impl<T: Element> Default for BlockPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> BlockPool<T> {
    pub fn new() -> Self {
        BlockPool {
            buckets: RwLock::new(HashMap::new()),
            fresh: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            abandoned: AtomicUsize::new(0),
        }
    }

    fn bucket(&self, block_size: usize) -> Arc<Mutex<FreeList<T>>> {
        {
            let buckets = self.buckets.read().unwrap_or_else(|p| p.into_inner());
            if let Some(bucket) = buckets.get(&block_size) {
                return Arc::clone(bucket);
            }
        }
        let mut buckets = self.buckets.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(buckets.entry(block_size).or_default())
    }

    // Free-list mutations cannot be observed half-done, so a poisoned bucket
    // is still consistent.
    fn lock(bucket: &Mutex<FreeList<T>>) -> MutexGuard<'_, FreeList<T>> {
        bucket.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Take `count` blocks of `block_size` elements.
    ///
    /// Pooled blocks are used first; the remainder is freshly allocated (and
    /// therefore already zeroed). With `fill_zeros`, pooled blocks are zeroed
    /// before being handed out.
    pub fn acquire(&self, block_size: usize, count: usize, fill_zeros: bool) -> Vec<BlockCell<T>> {
        let mut blocks = Vec::with_capacity(count);
        if count == 0 {
            return blocks;
        }

        let bucket = self.bucket(block_size);
        {
            let mut free = Self::lock(&bucket);
            let take = free.len().min(count);
            blocks.extend(free.drain(..take));
        }

        let reused = blocks.len();
        for block in &mut blocks {
            block.recycle(fill_zeros);
        }
        while blocks.len() < count {
            blocks.push(BlockCell::zeroed(block_size));
        }

        self.reused.fetch_add(reused, Ordering::Relaxed);
        self.fresh.fetch_add(count - reused, Ordering::Relaxed);
        tracing::trace!(
            element = %T::DATA_TYPE,
            block_size,
            reused,
            fresh = count - reused,
            "acquired blocks"
        );
        blocks
    }

    /// Return blocks to the free-lists for their size.
    ///
    /// Callers hand over ownership, so no live array can still reference the
    /// buffers. Blocks poisoned by a panicking writer are dropped instead.
    /// Returns the number of blocks that went back into a free-list.
    pub fn release(&self, blocks: impl IntoIterator<Item = BlockCell<T>>) -> usize {
        let mut by_size: HashMap<usize, Vec<BlockCell<T>>> = HashMap::new();
        let mut dropped = 0;
        for block in blocks {
            if block.is_poisoned() {
                dropped += 1;
                continue;
            }
            by_size.entry(block.len()).or_default().push(block);
        }

        let mut released = 0;
        for (block_size, group) in by_size {
            released += group.len();
            let bucket = self.bucket(block_size);
            Self::lock(&bucket).extend(group);
        }

        self.released.fetch_add(released, Ordering::Relaxed);
        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
            tracing::warn!(element = %T::DATA_TYPE, dropped, "dropped poisoned blocks on release");
        }
        released
    }

    /// Record blocks that left the pool for good without being released
    pub fn note_abandoned(&self, count: usize) {
        if count > 0 {
            self.abandoned.fetch_add(count, Ordering::Relaxed);
            tracing::debug!(element = %T::DATA_TYPE, count, "blocks still shared at close, not pooled");
        }
    }

    /// Free blocks available for `block_size`
    pub fn free_count(&self, block_size: usize) -> usize {
        let buckets = self.buckets.read().unwrap_or_else(|p| p.into_inner());
        buckets
            .get(&block_size)
            .map(|bucket| Self::lock(bucket).len())
            .unwrap_or(0)
    }

    pub fn total_free(&self) -> usize {
        let buckets = self.buckets.read().unwrap_or_else(|p| p.into_inner());
        buckets.values().map(|bucket| Self::lock(bucket).len()).sum()
    }

    /// Block sizes that currently have a bucket, ascending
    pub fn block_sizes(&self) -> Vec<usize> {
        let buckets = self.buckets.read().unwrap_or_else(|p| p.into_inner());
        let mut sizes: Vec<usize> = buckets.keys().copied().collect();
        sizes.sort_unstable();
        sizes
    }

    /// Drop every pooled block. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut buckets = self.buckets.write().unwrap_or_else(|p| p.into_inner());
        let cleared: usize = buckets.values().map(|bucket| Self::lock(bucket).len()).sum();
        buckets.clear();
        cleared
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            fresh_blocks: self.fresh.load(Ordering::Relaxed),
            reused_blocks: self.reused.load(Ordering::Relaxed),
            released_blocks: self.released.load(Ordering::Relaxed),
            dropped_blocks: self.dropped.load(Ordering::Relaxed),
            abandoned_blocks: self.abandoned.load(Ordering::Relaxed),
            free_blocks: self.total_free(),
        }
    }
}
