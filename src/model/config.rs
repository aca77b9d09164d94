//! Per-model configuration
//!
//! [`ModelConfig`] controls how a loaded model executes: the bound on
//! concurrently running compute, whether arrays are pooled across
//! invocations, and whether every invocation is profiled.

use crate::runtime::available_cores;

/// Environment variable overriding [`ModelConfig::parallelism_limit`]
pub const PARALLELISM_ENV: &str = "GRAPHFORGE_PARALLELISM";
/// Environment variable overriding [`ModelConfig::pooling`]
pub const POOLING_ENV: &str = "GRAPHFORGE_POOLING";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    /// Maximum compute closures of one model running at once
    pub parallelism_limit: usize,

    /// Recycle blocks across invocations
    pub pooling: bool,

    /// Profile every invocation, not only those that ask for it
    pub profile_by_default: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            parallelism_limit: available_cores(),
            pooling: true,
            profile_by_default: false,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

impl ModelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `GRAPHFORGE_PARALLELISM` and `GRAPHFORGE_POOLING`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(PARALLELISM_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(limit) if limit > 0 => config.parallelism_limit = limit,
                _ => tracing::warn!(value = %raw, "ignoring invalid {}", PARALLELISM_ENV),
            }
        }
        if let Ok(raw) = std::env::var(POOLING_ENV) {
            match parse_flag(&raw) {
                Some(pooling) => config.pooling = pooling,
                None => tracing::warn!(value = %raw, "ignoring invalid {}", POOLING_ENV),
            }
        }
        config
    }

    /// Set the parallelism limit (clamped to at least 1)
    pub fn with_parallelism_limit(mut self, limit: usize) -> Self {
        self.parallelism_limit = limit.max(1);
        self
    }

    pub fn with_pooling(mut self, pooling: bool) -> Self {
        self.pooling = pooling;
        self
    }

    pub fn with_profiling(mut self, profile_by_default: bool) -> Self {
        self.profile_by_default = profile_by_default;
        self
    }
}
