//! Operator graphs: description, validation and execution

pub mod context;
pub mod description;
pub mod executor;
pub mod topology;

pub use context::ExecutionContext;
pub use description::{
    Attribute, GraphDescription, InitializerDescription, NodeDescription, OpsetImport, TensorData,
};
pub use executor::{ExecutionNode, GraphExecutor, NodeState};
pub use topology::GraphTopology;
