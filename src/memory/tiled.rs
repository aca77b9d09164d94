//! Logical N-dimensional arrays backed by a sequence of pooled blocks

use super::block::{block_size_for, blocks_for, Block, BlockCell, BlockId};
use super::element::{DataType, Element};
use super::marker::UsageMarker;
use crate::error::{ForgeResult, GraphForgeError};
use std::ops::Range;
use std::sync::Arc;

/// Row-major strides for `shape`
pub fn strides_for(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; shape.len()];
    let mut stride = 1usize;
    for (i, dim) in shape.iter().enumerate().rev() {
        strides[i] = stride;
        stride = stride.saturating_mul(*dim);
    }
    strides
}

/// Tensor storage: a row-major shape mapped onto equally sized blocks.
///
/// Cloning an array, or cutting a view out of it, shares the underlying
/// blocks and their usage markers; no element is copied. Invariant:
/// `blocks_num() * block_size() == linear_size()`.
#[derive(Debug)]
pub struct TiledArray<T> {
    shape: Vec<usize>,
    strides: Vec<usize>,
    block_size: usize,
    blocks: Arc<[Block<T>]>,
}

impl<T> Clone for TiledArray<T> {
    fn clone(&self) -> Self {
        TiledArray {
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            block_size: self.block_size,
            blocks: Arc::clone(&self.blocks),
        }
    }
}

impl<T: Element> TiledArray<T> {
    pub(crate) fn from_blocks(
        shape: &[usize],
        block_size: usize,
        blocks: Vec<Block<T>>,
    ) -> ForgeResult<Self> {
        let linear: usize = shape.iter().product();
        if blocks.len() * block_size != linear {
            return Err(GraphForgeError::InvalidView(format!(
                "{} blocks of {} elements cannot hold shape {:?}",
                blocks.len(),
                block_size,
                shape
            )));
        }
        if let Some(bad) = blocks.iter().find(|b| b.len() != block_size) {
            return Err(GraphForgeError::InvalidView(format!(
                "block {} has {} elements, expected {}",
                bad.id(),
                bad.len(),
                block_size
            )));
        }
        Ok(TiledArray {
            shape: shape.to_vec(),
            strides: strides_for(shape),
            block_size,
            blocks: blocks.into(),
        })
    }

    /// Zeroed array that belongs to no allocation context
    pub fn new_detached(shape: &[usize]) -> Self {
        let block_size = block_size_for(shape);
        let blocks: Vec<Block<T>> = (0..blocks_for(shape, block_size))
            .map(|_| Arc::new(BlockCell::zeroed(block_size)))
            .collect();
        TiledArray {
            shape: shape.to_vec(),
            strides: strides_for(shape),
            block_size,
            blocks: blocks.into(),
        }
    }

    /// Detached array holding `data` in row-major order
    pub fn from_vec(shape: &[usize], data: Vec<T>) -> ForgeResult<Self> {
        let linear: usize = shape.iter().product();
        if data.len() != linear {
            return Err(GraphForgeError::ShapeMismatch(format!(
                "{} values do not fill shape {:?}",
                data.len(),
                shape
            )));
        }
        let block_size = block_size_for(shape);
        let blocks: Vec<Block<T>> = if linear == 0 {
            Vec::new()
        } else {
            data.chunks(block_size)
                .map(|chunk| Arc::new(BlockCell::from_buffer(chunk.to_vec().into_boxed_slice())))
                .collect()
        };
        Self::from_blocks(shape, block_size, blocks)
    }

    pub fn scalar(value: T) -> Self {
        let array = Self::new_detached(&[]);
        if let Some(block) = array.blocks.first() {
            // Freshly built, the lock cannot be poisoned
            let _ = block.write(|data| data[0] = value);
        }
        array
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn linear_size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn blocks_num(&self) -> usize {
        self.blocks.len()
    }

    pub fn data_type(&self) -> DataType {
        T::DATA_TYPE
    }

    pub fn blocks(&self) -> &[Block<T>] {
        &self.blocks
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.iter().map(|b| b.id()).collect()
    }

    fn block(&self, index: usize) -> ForgeResult<&Block<T>> {
        self.blocks.get(index).ok_or_else(|| {
            GraphForgeError::InvalidView(format!(
                "block index {} out of range ({} blocks)",
                index,
                self.blocks.len()
            ))
        })
    }

    pub fn read_block<R>(&self, index: usize, f: impl FnOnce(&[T]) -> R) -> ForgeResult<R> {
        self.block(index)?.read(f)
    }

    pub fn write_block<R>(&self, index: usize, f: impl FnOnce(&mut [T]) -> R) -> ForgeResult<R> {
        self.block(index)?.write(f)
    }

    /// Element at a row-major linear index
    pub fn get(&self, index: usize) -> ForgeResult<T> {
        let (block, offset) = (index / self.block_size, index % self.block_size);
        self.read_block(block, |data| data[offset])
    }

    /// Copy the contents out in row-major order
    pub fn to_vec(&self) -> ForgeResult<Vec<T>> {
        let mut out = Vec::with_capacity(self.linear_size());
        for block in self.blocks.iter() {
            block.read(|data| out.extend_from_slice(data))?;
        }
        Ok(out)
    }

    fn check_range(&self, start: usize, len: usize) -> ForgeResult<()> {
        if start + len > self.linear_size() {
            return Err(GraphForgeError::InvalidView(format!(
                "elements {}..{} out of bounds for shape {:?}",
                start,
                start + len,
                self.shape
            )));
        }
        Ok(())
    }

    /// Copy `len` elements starting at linear index `start`
    pub fn read_range(&self, start: usize, len: usize) -> ForgeResult<Vec<T>> {
        self.check_range(start, len)?;
        let mut out = Vec::with_capacity(len);
        let mut pos = start;
        while pos < start + len {
            let (block, offset) = (pos / self.block_size, pos % self.block_size);
            let take = (self.block_size - offset).min(start + len - pos);
            self.read_block(block, |data| out.extend_from_slice(&data[offset..offset + take]))?;
            pos += take;
        }
        Ok(out)
    }

    /// Overwrite elements starting at linear index `start`
    pub fn write_range(&self, start: usize, data: &[T]) -> ForgeResult<()> {
        self.check_range(start, data.len())?;
        let mut written = 0;
        while written < data.len() {
            let pos = start + written;
            let (block, offset) = (pos / self.block_size, pos % self.block_size);
            let take = (self.block_size - offset).min(data.len() - written);
            self.write_block(block, |dst| {
                dst[offset..offset + take].copy_from_slice(&data[written..written + take])
            })?;
            written += take;
        }
        Ok(())
    }

    pub fn copy_from_slice(&self, data: &[T]) -> ForgeResult<()> {
        if data.len() != self.linear_size() {
            return Err(GraphForgeError::ShapeMismatch(format!(
                "cannot copy {} values into shape {:?}",
                data.len(),
                self.shape
            )));
        }
        for (block, chunk) in self.blocks.iter().zip(data.chunks(self.block_size)) {
            block.write(|dst| dst.copy_from_slice(chunk))?;
        }
        Ok(())
    }

    pub fn fill(&self, value: T) -> ForgeResult<()> {
        for block in self.blocks.iter() {
            block.write(|data| data.fill(value))?;
        }
        Ok(())
    }

    fn slice_blocks(&self, shape: Vec<usize>, offset: usize, len: usize) -> ForgeResult<Self> {
        if offset % self.block_size != 0 || len % self.block_size != 0 {
            return Err(GraphForgeError::InvalidView(format!(
                "elements {}..{} of shape {:?} do not fall on {}-element block boundaries",
                offset,
                offset + len,
                self.shape,
                self.block_size
            )));
        }
        let range = offset / self.block_size..(offset + len) / self.block_size;
        Ok(TiledArray {
            strides: strides_for(&shape),
            shape,
            block_size: self.block_size,
            blocks: self.blocks[range].iter().cloned().collect::<Vec<_>>().into(),
        })
    }

    /// Sub-array at a leading-axes index, e.g. `[batch, head]` of a
    /// `[batch, heads, seq, dim]` array. Shares blocks with `self`.
    pub fn view(&self, index: &[usize]) -> ForgeResult<Self> {
        if index.len() > self.rank() {
            return Err(GraphForgeError::InvalidView(format!(
                "index {:?} has more axes than shape {:?}",
                index, self.shape
            )));
        }
        let mut offset = 0;
        for (axis, (&i, &dim)) in index.iter().zip(self.shape.iter()).enumerate() {
            if i >= dim {
                return Err(GraphForgeError::InvalidView(format!(
                    "index {} out of bounds for axis {} of shape {:?}",
                    i, axis, self.shape
                )));
            }
            offset += i * self.strides[axis];
        }
        let sub_shape = self.shape[index.len()..].to_vec();
        let len = sub_shape.iter().product();
        self.slice_blocks(sub_shape, offset, len)
    }

    /// Contiguous range along axis 0. Shares blocks with `self`.
    pub fn view_rows(&self, rows: Range<usize>) -> ForgeResult<Self> {
        let Some(&outer) = self.shape.first() else {
            return Err(GraphForgeError::InvalidView("cannot slice rows of a scalar".to_string()));
        };
        if rows.start > rows.end || rows.end > outer {
            return Err(GraphForgeError::InvalidView(format!(
                "rows {:?} out of bounds for shape {:?}",
                rows, self.shape
            )));
        }
        let mut shape = self.shape.clone();
        shape[0] = rows.len();
        let row_len = self.strides[0];
        self.slice_blocks(shape, rows.start * row_len, rows.len() * row_len)
    }

    /// Same blocks under a new shape with the same number of elements
    pub fn reshape(&self, shape: &[usize]) -> ForgeResult<Self> {
        let linear: usize = shape.iter().product();
        if linear != self.linear_size() {
            return Err(GraphForgeError::ShapeMismatch(format!(
                "cannot reshape {:?} into {:?}",
                self.shape, shape
            )));
        }
        Ok(TiledArray {
            shape: shape.to_vec(),
            strides: strides_for(shape),
            block_size: self.block_size,
            blocks: Arc::clone(&self.blocks),
        })
    }

    /// Array made of the concatenated block sequences of `parts`.
    ///
    /// Blocks and markers are shared with the parts, so marking the result
    /// as an output pins every part as well.
    pub fn concat_blocks(parts: &[&TiledArray<T>], shape: &[usize]) -> ForgeResult<Self> {
        let Some(first) = parts.first() else {
            return Err(GraphForgeError::InvalidView("nothing to concatenate".to_string()));
        };
        let block_size = first.block_size;
        if parts.iter().any(|p| p.block_size != block_size) {
            return Err(GraphForgeError::InvalidView(
                "cannot concatenate arrays with different block sizes".to_string(),
            ));
        }
        let blocks: Vec<Block<T>> = parts.iter().flat_map(|p| p.blocks.iter().cloned()).collect();
        Self::from_blocks(shape, block_size, blocks)
    }

    fn mark(&self, marker: UsageMarker) {
        for block in self.blocks.iter() {
            block.advance(marker);
        }
    }

    pub fn mark_used(&self) {
        self.mark(UsageMarker::Used);
    }

    /// Promote to an output of the current invocation
    pub fn mark_output(&self) {
        self.mark(UsageMarker::ContextOutput);
    }

    /// Promote to a value that outlives every allocation context
    pub fn mark_global_output(&self) {
        self.mark(UsageMarker::GlobalOutput);
    }

    pub fn markers(&self) -> Vec<UsageMarker> {
        self.blocks.iter().map(|b| b.marker()).collect()
    }

    /// Every block may still be returned to a pool
    pub fn is_reclaimable(&self) -> bool {
        self.blocks.iter().all(|b| b.marker().is_reclaimable())
    }

    pub fn shares_blocks_with(&self, other: &TiledArray<T>) -> bool {
        self.blocks
            .iter()
            .any(|a| other.blocks.iter().any(|b| Arc::ptr_eq(a, b)))
    }

    pub(crate) fn into_blocks(self) -> Arc<[Block<T>]> {
        self.blocks
    }
}
