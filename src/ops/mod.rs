//! Operators
//!
//! An [`Operator`] is resolved once per node at load time and then applied on
//! every invocation. Operators draw their outputs from the invocation's
//! allocation context and fan heavy work out through task groups bounded by
//! the model's parallelism limiter.

pub mod elementwise;
pub mod identity;
pub mod matmul;
pub mod registry;
pub mod softmax;

pub use elementwise::{BinaryKind, ElementwiseBinary, Relu, Sum};
pub use identity::Identity;
pub use matmul::MatMul;
pub use registry::{OperatorFactory, OperatorRegistry, OperatorSetRegistry, DEFAULT_OPSET_VERSION};
pub use softmax::Softmax;

use crate::error::{ForgeResult, GraphForgeError};
use crate::graph::context::ExecutionContext;
use crate::graph::description::NodeDescription;
use crate::tensor::Tensor;
use futures::future::BoxFuture;
use std::fmt;
use std::ops::Range;

/// Identity of a resolved operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorInfo {
    /// Node name
    pub name: String,
    pub op_type: String,
    pub domain: String,
    /// Opset version the node was resolved against
    pub version: u32,
}

impl OperatorInfo {
    pub fn for_node(node: &NodeDescription, version: u32) -> Self {
        OperatorInfo {
            name: node.name.clone(),
            op_type: node.op_type.clone(),
            domain: node.domain.clone(),
            version,
        }
    }
}

/// Range of opset versions an implementation covers.
///
/// `until_version` is exclusive: an implementation introduced in version 9 and
/// superseded in 13 covers `9..13`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub since_version: u32,
    pub until_version: Option<u32>,
}

impl VersionInfo {
    pub const fn since(since_version: u32) -> Self {
        VersionInfo {
            since_version,
            until_version: None,
        }
    }

    pub const fn range(since_version: u32, until_version: u32) -> Self {
        VersionInfo {
            since_version,
            until_version: Some(until_version),
        }
    }

    pub fn contains(&self, version: u32) -> bool {
        version >= self.since_version && self.until_version.map_or(true, |until| version < until)
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.until_version {
            Some(until) => write!(f, "{}..{}", self.since_version, until),
            None => write!(f, "{}+", self.since_version),
        }
    }
}

/// A node implementation.
///
/// `apply` receives one slot per declared node input (`None` for absent
/// optional inputs) and returns one slot per declared output.
pub trait Operator: Send + Sync + fmt::Debug {
    fn info(&self) -> &OperatorInfo;

    fn name(&self) -> &str {
        &self.info().name
    }

    fn apply<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        inputs: Vec<Option<Tensor>>,
    ) -> BoxFuture<'a, ForgeResult<Vec<Option<Tensor>>>>;
}

/// Input `index`, or `MissingInput` if absent
pub(crate) fn required_input<'a>(
    info: &OperatorInfo,
    inputs: &'a [Option<Tensor>],
    index: usize,
) -> ForgeResult<&'a Tensor> {
    inputs.get(index).and_then(Option::as_ref).ok_or_else(|| {
        GraphForgeError::MissingInput(format!(
            "{} node '{}' requires input {}",
            info.op_type, info.name, index
        ))
    })
}

/// Split `0..len` into at most `parts` contiguous, nearly equal ranges
pub(crate) fn split_range(len: usize, parts: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let parts = parts.clamp(1, len);
    let (base, extra) = (len / parts, len % parts);
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

/// Dispatch over the numeric variants of a `TypedArray`, rewrapping the
/// result. `bool` arrays evaluate `$other` instead.
macro_rules! map_numeric {
    ($value:expr, $a:ident => $body:expr, bool => $other:expr) => {
        match $value {
            $crate::tensor::TypedArray::Int8($a) => $crate::tensor::TypedArray::Int8($body),
            $crate::tensor::TypedArray::UInt8($a) => $crate::tensor::TypedArray::UInt8($body),
            $crate::tensor::TypedArray::Int16($a) => $crate::tensor::TypedArray::Int16($body),
            $crate::tensor::TypedArray::UInt16($a) => $crate::tensor::TypedArray::UInt16($body),
            $crate::tensor::TypedArray::Int32($a) => $crate::tensor::TypedArray::Int32($body),
            $crate::tensor::TypedArray::UInt32($a) => $crate::tensor::TypedArray::UInt32($body),
            $crate::tensor::TypedArray::Int64($a) => $crate::tensor::TypedArray::Int64($body),
            $crate::tensor::TypedArray::UInt64($a) => $crate::tensor::TypedArray::UInt64($body),
            $crate::tensor::TypedArray::Float32($a) => $crate::tensor::TypedArray::Float32($body),
            $crate::tensor::TypedArray::Float64($a) => $crate::tensor::TypedArray::Float64($body),
            $crate::tensor::TypedArray::Bool(_) => $other,
        }
    };
}
pub(crate) use map_numeric;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ranges() {
        let v = VersionInfo::range(9, 13);
        assert!(!v.contains(8));
        assert!(v.contains(9));
        assert!(v.contains(12));
        assert!(!v.contains(13));
        assert!(VersionInfo::since(13).contains(20));
        assert_eq!(v.to_string(), "9..13");
        assert_eq!(VersionInfo::since(7).to_string(), "7+");
    }

    #[test]
    fn test_split_range_covers_everything() {
        let ranges = split_range(10, 3);
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);
        assert_eq!(split_range(2, 8), vec![0..1, 1..2]);
        assert!(split_range(0, 4).is_empty());
        assert_eq!(split_range(5, 0), vec![0..5]);
    }

    #[test]
    fn test_required_input() {
        let info = OperatorInfo {
            name: "n".to_string(),
            op_type: "Add".to_string(),
            domain: String::new(),
            version: 13,
        };
        let inputs = vec![None, Some(Tensor::from_vec("x", &[1], vec![1.0f32]).unwrap())];
        assert!(required_input(&info, &inputs, 1).is_ok());
        assert!(matches!(
            required_input(&info, &inputs, 0).unwrap_err(),
            GraphForgeError::MissingInput(_)
        ));
        assert!(required_input(&info, &inputs, 5).is_err());
    }
}
