//! Model lifecycle: configuration, load, predict, close

pub mod config;
#[allow(clippy::module_inception)]
pub mod model;

pub use config::ModelConfig;
pub use model::Model;
