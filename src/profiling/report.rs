//! Per-invocation profiling records and their aggregation

use super::timer::NodeTimer;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One timed node execution
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileEntry {
    pub node: String,
    pub op_type: String,
    /// Start time relative to the beginning of the invocation
    pub start_offset: Duration,
    pub elapsed: Duration,
}

/// Collector shared by every node of one invocation
#[derive(Debug)]
pub struct ProfilingContext {
    name: String,
    origin: Instant,
    entries: Mutex<Vec<ProfileEntry>>,
}

impl ProfilingContext {
    pub fn new(name: impl Into<String>) -> Self {
        ProfilingContext {
            name: name.into(),
            origin: Instant::now(),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a stopped timer. Unstopped timers are ignored.
    pub fn record(&self, op_type: &str, timer: &NodeTimer) {
        let (Some(start), Some(elapsed)) = (timer.start_instant(), timer.elapsed()) else {
            return;
        };
        let entry = ProfileEntry {
            node: timer.name().to_string(),
            op_type: op_type.to_string(),
            start_offset: start.saturating_duration_since(self.origin),
            elapsed,
        };
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }

    /// Entries sorted by start time
    pub fn into_report(self) -> ProfileReport {
        let mut entries = match self.entries.into_inner() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.sort_by_key(|e| e.start_offset);
        ProfileReport {
            name: self.name,
            total: self.origin.elapsed(),
            entries,
        }
    }

    pub fn snapshot(&self) -> ProfileReport {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        entries.sort_by_key(|e| e.start_offset);
        ProfileReport {
            name: self.name.clone(),
            total: self.origin.elapsed(),
            entries,
        }
    }
}

/// Aggregate timings of one operator type
#[derive(Debug, Clone, PartialEq)]
pub struct OpSummary {
    pub op_type: String,
    pub count: usize,
    pub total: Duration,
}

impl OpSummary {
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

/// Timings of one invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileReport {
    pub name: String,
    pub total: Duration,
    pub entries: Vec<ProfileEntry>,
}

impl ProfileReport {
    /// Elapsed time per node name
    pub fn node_times(&self) -> BTreeMap<&str, Duration> {
        self.entries.iter().map(|e| (e.node.as_str(), e.elapsed)).collect()
    }

    /// Aggregate several reports by operator type, slowest first
    pub fn analyze<'a>(reports: impl IntoIterator<Item = &'a ProfileReport>) -> Vec<OpSummary> {
        let mut by_op: BTreeMap<String, OpSummary> = BTreeMap::new();
        for entry in reports.into_iter().flat_map(|r| r.entries.iter()) {
            let summary = by_op.entry(entry.op_type.clone()).or_insert_with(|| OpSummary {
                op_type: entry.op_type.clone(),
                count: 0,
                total: Duration::ZERO,
            });
            summary.count += 1;
            summary.total += entry.elapsed;
        }
        let mut summaries: Vec<OpSummary> = by_op.into_values().collect();
        summaries.sort_by(|a, b| b.total.cmp(&a.total));
        summaries
    }
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "profile '{}': {} nodes in {:.3} ms",
            self.name,
            self.entries.len(),
            self.total.as_secs_f64() * 1000.0
        )?;
        writeln!(f, "  {:<24} {:<12} {:>10} {:>10}", "node", "op", "start ms", "time ms")?;
        for entry in &self.entries {
            writeln!(
                f,
                "  {:<24} {:<12} {:>10.3} {:>10.3}",
                entry.node,
                entry.op_type,
                entry.start_offset.as_secs_f64() * 1000.0,
                entry.elapsed.as_secs_f64() * 1000.0
            )?;
        }
        Ok(())
    }
}
