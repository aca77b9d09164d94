//! Unified error handling for graphforge
//!
//! This module provides the crate-wide error type. Errors are categorized so
//! callers can tell apart:
//! - User errors (bad inputs handed to `predict`)
//! - Load errors (unsupported operator versions, malformed graphs)
//! - Execution errors (an operator failed while running)
//! - Cancellation (a sibling failed and this task unwound)
//! - Internal errors (contract violations, poisoned locks)

use std::fmt;

// Re-export thiserror for convenience
pub use thiserror;

/// Unified error type for graphforge
#[derive(Debug, thiserror::Error)]
pub enum GraphForgeError {
    // ========== Load Errors ==========
    /// No implementation registered for this operator type
    #[error("Unsupported operator: {domain}::{op_type}")]
    UnsupportedOperator { domain: String, op_type: String },

    /// Operator exists but not in the requested version
    #[error("Unsupported version of {op_type} operator: {version}")]
    UnsupportedOperatorVersion { op_type: String, version: u32 },

    /// Required attribute missing on a node
    #[error("Missing required attribute '{attribute}' on node '{node}'")]
    MissingAttribute { node: String, attribute: String },

    /// Attribute present but of the wrong kind or out of range
    #[error("Invalid attribute '{attribute}' on node '{node}': {reason}")]
    InvalidAttribute {
        node: String,
        attribute: String,
        reason: String,
    },

    /// Malformed graph topology (cycles, dangling inputs, duplicate outputs)
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// Graph description could not be deserialized
    #[error("Failed to parse graph description: {0}")]
    GraphParse(#[from] serde_json::Error),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ========== Shape / Type Errors ==========
    /// Operator input violates its shape constraint
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Operator input has an unsupported element type
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// A required graph or operator input is absent
    #[error("Missing input: {0}")]
    MissingInput(String),

    /// View or reshape request that does not fall on block boundaries
    #[error("Invalid view: {0}")]
    InvalidView(String),

    // ========== Execution Errors ==========
    /// An operator returned an error while running
    #[error("Operator '{node}' failed: {source}")]
    OperatorFailed {
        node: String,
        #[source]
        source: Box<GraphForgeError>,
    },

    /// Task observed cancellation at a suspension point
    #[error("Execution cancelled")]
    Cancelled,

    /// A sub-task panicked
    #[error("Sub-task panicked: {0}")]
    TaskPanicked(String),

    // ========== Contract Violations ==========
    /// `predict` called after `close`
    #[error("Model '{0}' is closed")]
    ModelClosed(String),

    /// Allocation requested from a closed context
    #[error("Allocation context {0} is closed")]
    ContextClosed(u64),

    /// Lock poisoned (indicates a panic while a block was being written)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl GraphForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            GraphForgeError::ShapeMismatch(_)
            | GraphForgeError::TypeMismatch(_)
            | GraphForgeError::MissingInput(_)
            | GraphForgeError::InvalidView(_) => ErrorCategory::User,

            GraphForgeError::UnsupportedOperator { .. }
            | GraphForgeError::UnsupportedOperatorVersion { .. }
            | GraphForgeError::MissingAttribute { .. }
            | GraphForgeError::InvalidAttribute { .. }
            | GraphForgeError::InvalidGraph(_)
            | GraphForgeError::GraphParse(_)
            | GraphForgeError::Io(_) => ErrorCategory::Load,

            GraphForgeError::OperatorFailed { source, .. } => match source.category() {
                ErrorCategory::User => ErrorCategory::User,
                ErrorCategory::Internal => ErrorCategory::Internal,
                _ => ErrorCategory::Execution,
            },
            GraphForgeError::TaskPanicked(_) => ErrorCategory::Execution,

            GraphForgeError::Cancelled => ErrorCategory::Cancelled,

            GraphForgeError::ModelClosed(_)
            | GraphForgeError::ContextClosed(_)
            | GraphForgeError::LockPoisoned(_)
            | GraphForgeError::InternalError(_) => ErrorCategory::Internal,
        }
    }

    /// Wrap an error raised by the operator bound to `node`
    ///
    /// Cancellation is passed through untouched so the executor can tell a
    /// sibling unwinding apart from the failure that caused it.
    pub fn in_node(self, node: &str) -> Self {
        match self {
            GraphForgeError::Cancelled | GraphForgeError::OperatorFailed { .. } => self,
            other => GraphForgeError::OperatorFailed {
                node: node.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Strip `OperatorFailed` wrappers and return the innermost error
    pub fn root_cause(&self) -> &GraphForgeError {
        match self {
            GraphForgeError::OperatorFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Check if this is a load-time error (no model was produced)
    pub fn is_load_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Load)
    }

    /// Check if this is a user-facing error (bad inputs)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GraphForgeError::Cancelled)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid inputs to an invocation
    User,
    /// Model construction failed; no model was returned
    Load,
    /// An operator failed while executing
    Execution,
    /// Unwound because a sibling failed
    Cancelled,
    /// Contract violation or bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Load => write!(f, "Load"),
            ErrorCategory::Execution => write!(f, "Execution"),
            ErrorCategory::Cancelled => write!(f, "Cancelled"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for GraphForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        GraphForgeError::LockPoisoned(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type ForgeResult<T> = std::result::Result<T, GraphForgeError>;

/// Create a shape mismatch error
///
/// # Examples
/// ```ignore
/// return Err(shape_error!("expected rank 2, got {}", rank));
/// ```
#[macro_export]
macro_rules! shape_error {
    ($msg:expr) => {
        $crate::error::GraphForgeError::ShapeMismatch($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::GraphForgeError::ShapeMismatch(format!($fmt, $($arg)*))
    };
}

/// Create an internal error
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::GraphForgeError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::GraphForgeError::InternalError(format!($fmt, $($arg)*))
    };
}

/// Create a graph load error
#[macro_export]
macro_rules! load_error {
    ($msg:expr) => {
        $crate::error::GraphForgeError::InvalidGraph($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::GraphForgeError::InvalidGraph(format!($fmt, $($arg)*))
    };
}
