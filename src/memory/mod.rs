//! Block-pooled tensor memory
//!
//! Arrays are tiled into fixed-size blocks drawn from per-model pools. An
//! [`AllocationContext`] tracks every block an invocation draws and, when the
//! invocation ends, returns the blocks that did not escape as outputs.
//!
//! ```text
//! ModelArrayStorage ── BlockPool<f32> ── bucket[block_size] ── free BlockCells
//!        │
//!        └─ create_context() ─> AllocationContext ─ get_array() ─> TiledArray<T>
//! ```

pub mod block;
pub mod context;
pub mod element;
pub mod marker;
pub mod pool;
pub mod storage;
pub mod tiled;

pub use block::{block_size_for, blocks_for, Block, BlockCell, BlockId, MAX_BLOCK_SIZE};
pub use context::{AllocationContext, CloseSummary};
pub use element::{DataType, Element, NumericElement};
pub use marker::{MarkerCell, UsageMarker};
pub use pool::{BlockPool, PoolStats};
pub use storage::{ModelArrayStorage, StorageStats};
pub use tiled::{strides_for, TiledArray};
