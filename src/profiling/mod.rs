//! Node-level profiling
//!
//! When profiling is requested for an invocation, the executor times every
//! node with a [`NodeTimer`] and records it into a shared
//! [`ProfilingContext`]. Profiling only observes; it never changes scheduling.
//!
//! ```rust
//! use graphforge::profiling::{NodeTimer, ProfilingContext};
//!
//! let profiler = ProfilingContext::new("predict");
//! let mut timer = NodeTimer::started("relu_0");
//! timer.stop();
//! profiler.record("Relu", &timer);
//!
//! let report = profiler.into_report();
//! println!("{}", report);
//! ```

pub mod report;
pub mod timer;

pub use report::{OpSummary, ProfileEntry, ProfileReport, ProfilingContext};
pub use timer::NodeTimer;
