//! Wall-clock timers for node execution

use std::time::{Duration, Instant};

/// Timer for one node invocation
///
/// ```rust
/// use graphforge::profiling::NodeTimer;
///
/// let mut timer = NodeTimer::for_node("matmul_0");
/// timer.start();
/// // ... run the node ...
/// timer.stop();
/// assert!(timer.elapsed().is_some());
/// ```
#[derive(Debug, Clone)]
pub struct NodeTimer {
    name: String,
    start: Option<Instant>,
    elapsed: Option<Duration>,
}

impl NodeTimer {
    pub fn for_node(name: impl Into<String>) -> Self {
        NodeTimer {
            name: name.into(),
            start: None,
            elapsed: None,
        }
    }

    /// Timer that is already running
    pub fn started(name: impl Into<String>) -> Self {
        let mut timer = Self::for_node(name);
        timer.start();
        timer
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start (or restart) timing
    pub fn start(&mut self) {
        self.start = Some(Instant::now());
        self.elapsed = None;
    }

    /// Stop timing. No-op if the timer was never started.
    pub fn stop(&mut self) {
        if let Some(start) = self.start {
            self.elapsed = Some(start.elapsed());
        }
    }

    pub fn start_instant(&self) -> Option<Instant> {
        self.start
    }

    /// Measured duration, `None` until stopped
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    pub fn elapsed_ms(&self) -> Option<f64> {
        self.elapsed.map(|d| d.as_secs_f64() * 1000.0)
    }

    pub fn is_started(&self) -> bool {
        self.start.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.elapsed.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unstarted_timer() {
        let mut timer = NodeTimer::for_node("n");
        assert!(!timer.is_started());
        timer.stop();
        assert!(timer.elapsed().is_none());
    }

    #[test]
    fn test_measures_sleep() {
        let mut timer = NodeTimer::started("sleep");
        std::thread::sleep(Duration::from_millis(5));
        timer.stop();
        assert!(timer.is_stopped());
        assert!(timer.elapsed_ms().unwrap() >= 5.0);
        assert_eq!(timer.name(), "sleep");
    }

    #[test]
    fn test_restart_clears_measurement() {
        let mut timer = NodeTimer::started("r");
        timer.stop();
        timer.start();
        assert!(timer.elapsed().is_none());
    }
}
