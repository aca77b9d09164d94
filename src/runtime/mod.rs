//! Concurrency runtime: process-wide dispatcher, per-model limiter,
//! cancellation and structured task groups

pub mod cancel;
pub mod dispatcher;
pub mod limiter;
pub mod task_group;

pub use cancel::{CancelOnDrop, CancellationFlag};
pub use dispatcher::{available_cores, CoreReservation, ResourceDispatcher};
pub use limiter::ParallelismLimiter;
pub use task_group::TaskGroup;
