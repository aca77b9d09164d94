//! Fixed-size blocks, the unit of pooling

use super::element::Element;
use super::marker::{MarkerCell, UsageMarker};
use crate::error::{ForgeResult, GraphForgeError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Largest block a single array dimension is mapped onto
pub const MAX_BLOCK_SIZE: usize = 4096;

/// Process-unique block identifier, stable across pool round trips
pub type BlockId = u64;

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// One contiguous buffer plus its usage marker.
///
/// A cell is owned either by a pool free-list (by value) or by the arrays that
/// reference it (through [`Block`]). The pool only ever takes a cell back by
/// value, so a pooled buffer cannot be aliased by a live array.
#[derive(Debug)]
pub struct BlockCell<T> {
    id: BlockId,
    data: RwLock<Box<[T]>>,
    marker: MarkerCell,
}

/// Shared handle to a block, as held by tiled arrays and their views
pub type Block<T> = Arc<BlockCell<T>>;

impl<T: Element> BlockCell<T> {
    /// Allocate a zeroed block
    pub fn zeroed(block_size: usize) -> Self {
        Self::from_buffer(vec![T::default(); block_size].into_boxed_slice())
    }

    pub fn from_buffer(data: Box<[T]>) -> Self {
        BlockCell {
            id: NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed),
            data: RwLock::new(data),
            marker: MarkerCell::default(),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn len(&self) -> usize {
        match self.data.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn marker(&self) -> UsageMarker {
        self.marker.get()
    }

    /// Forward-only marker transition, see [`MarkerCell::advance`]
    pub fn advance(&self, to: UsageMarker) -> bool {
        self.marker.advance(to)
    }

    pub fn read<R>(&self, f: impl FnOnce(&[T]) -> R) -> ForgeResult<R> {
        let guard = self
            .data
            .read()
            .map_err(|_| GraphForgeError::LockPoisoned(format!("block {}", self.id)))?;
        Ok(f(&guard))
    }

    /// Mutate the buffer. Marks the block `Used`.
    pub fn write<R>(&self, f: impl FnOnce(&mut [T]) -> R) -> ForgeResult<R> {
        let mut guard = self
            .data
            .write()
            .map_err(|_| GraphForgeError::LockPoisoned(format!("block {}", self.id)))?;
        self.marker.advance(UsageMarker::Used);
        Ok(f(&mut guard))
    }

    /// A writer panicked while holding this block
    pub fn is_poisoned(&self) -> bool {
        self.data.is_poisoned()
    }

    /// Prepare an exclusively owned cell for reuse: marker back to `Unused`,
    /// optionally zero the contents.
    pub(crate) fn recycle(&mut self, fill_zeros: bool) {
        self.marker = MarkerCell::default();
        if fill_zeros {
            if let Ok(data) = self.data.get_mut() {
                data.fill(T::default());
            }
        }
    }
}

/// Block size used for an array of `shape`.
///
/// The last dimension is the natural tile; it is halved while it is larger
/// than [`MAX_BLOCK_SIZE`] and still even, so `block_size` always divides the
/// linear size. Scalars use a single one-element block.
pub fn block_size_for(shape: &[usize]) -> usize {
    let mut block_size = shape.last().copied().unwrap_or(1).max(1);
    while block_size > MAX_BLOCK_SIZE && block_size % 2 == 0 {
        block_size /= 2;
    }
    block_size
}

/// Number of blocks of `block_size` covering `shape`
pub fn blocks_for(shape: &[usize], block_size: usize) -> usize {
    let linear: usize = shape.iter().product();
    if linear == 0 {
        0
    } else {
        linear / block_size
    }
}
