//! GraphForge - tensor-operator graph inference engine
//!
//! Loads a graph of tensor operators and runs it concurrently, drawing every
//! intermediate tensor from a block-pooled memory arena that is scoped to the
//! model and recycled between invocations.

#![allow(clippy::type_complexity)] // Boxed operator futures and factories
#![allow(clippy::needless_range_loop)] // Clearer for block-indexed loops

pub mod error;
pub mod graph;
pub mod logging;
pub mod memory;
pub mod model;
pub mod ops;
pub mod profiling;
pub mod runtime;
pub mod tensor;

pub use error::{ErrorCategory, ForgeResult, GraphForgeError};
pub use graph::{GraphDescription, NodeDescription, TensorData};
pub use memory::{AllocationContext, DataType, ModelArrayStorage, TiledArray, UsageMarker};
pub use model::{Model, ModelConfig};
pub use ops::{Operator, OperatorRegistry};
pub use profiling::{ProfileReport, ProfilingContext};
pub use runtime::{CancellationFlag, ParallelismLimiter, ResourceDispatcher};
pub use tensor::Tensor;
