//! Softmax over the last axis, one sibling per range of rows

use super::{required_input, split_range, Operator, OperatorInfo};
use crate::error::{ForgeResult, GraphForgeError};
use crate::graph::context::ExecutionContext;
use crate::graph::description::NodeDescription;
use crate::memory::{NumericElement, TiledArray};
use crate::tensor::{Tensor, TypedArray};
use futures::future::BoxFuture;
use futures::FutureExt;

fn softmax_row(row: &mut [f64]) {
    let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in row.iter_mut() {
        *v /= sum;
    }
}

async fn softmax<T: NumericElement>(ctx: &ExecutionContext, input: &TiledArray<T>) -> ForgeResult<TiledArray<T>> {
    let row_len = input.shape().last().copied().unwrap_or(1);
    let rows = if row_len == 0 { 0 } else { input.linear_size() / row_len };
    let out = ctx.get_array::<T>(input.shape(), false)?;

    let mut group = ctx.task_group::<()>();
    for range in split_range(rows, ctx.limiter().limit()) {
        let input = input.clone();
        let out = out.clone();
        group.spawn(move |cancel| {
            cancel.check()?;
            let start = range.start * row_len;
            let values = input.read_range(start, range.len() * row_len)?;
            let mut wide: Vec<f64> = values.into_iter().map(|v| v.to_f64()).collect();
            for row in wide.chunks_mut(row_len) {
                softmax_row(row);
            }
            let narrowed: Vec<T> = wide.into_iter().map(T::from_f64).collect();
            out.write_range(start, &narrowed)
        });
    }
    group.join().await?;
    Ok(out)
}

#[derive(Debug)]
pub struct Softmax {
    info: OperatorInfo,
    axis: i64,
}

impl Softmax {
    pub fn new(info: OperatorInfo, axis: i64) -> Self {
        Softmax { info, axis }
    }

    /// Negative axes other than -1 can never be the last axis and are
    /// rejected here. A non-negative axis depends on the input rank and is
    /// checked when the node runs.
    pub fn from_node(node: &NodeDescription, info: OperatorInfo) -> ForgeResult<Self> {
        let axis = node.int_attribute("axis", -1)?;
        if axis < -1 {
            return Err(GraphForgeError::InvalidAttribute {
                node: info.name.clone(),
                attribute: "axis".to_string(),
                reason: format!("only the last axis is supported, got {}", axis),
            });
        }
        Ok(Self::new(info, axis))
    }

    fn check_axis(&self, rank: usize) -> ForgeResult<()> {
        let rank = rank.max(1) as i64;
        let axis = if self.axis < 0 { self.axis + rank } else { self.axis };
        if axis != rank - 1 {
            return Err(GraphForgeError::InvalidAttribute {
                node: self.info.name.clone(),
                attribute: "axis".to_string(),
                reason: format!("only the last axis is supported, got {} for rank {}", self.axis, rank),
            });
        }
        Ok(())
    }
}

impl Operator for Softmax {
    fn info(&self) -> &OperatorInfo {
        &self.info
    }

    fn apply<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        inputs: Vec<Option<Tensor>>,
    ) -> BoxFuture<'a, ForgeResult<Vec<Option<Tensor>>>> {
        async move {
            let x = required_input(&self.info, &inputs, 0)?;
            self.check_axis(x.rank())?;
            let array = match x.array() {
                TypedArray::Float32(a) => TypedArray::Float32(softmax(ctx, a).await?),
                TypedArray::Float64(a) => TypedArray::Float64(softmax(ctx, a).await?),
                other => {
                    return Err(GraphForgeError::TypeMismatch(format!(
                        "Softmax node '{}' requires float input, got {}",
                        self.info.name,
                        other.data_type()
                    )))
                }
            };
            Ok(vec![Some(Tensor::new(self.info.name.clone(), array))])
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::description::Attribute;

    #[test]
    fn test_softmax_row_sums_to_one() {
        let mut row = vec![1.0, 2.0, 3.0];
        softmax_row(&mut row);
        let sum: f64 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(row[2] > row[1] && row[1] > row[0]);
    }

    #[test]
    fn test_softmax_row_is_stable_for_large_values() {
        let mut row = vec![1000.0, 1000.0];
        softmax_row(&mut row);
        assert_eq!(row, vec![0.5, 0.5]);
    }

    #[test]
    fn test_axis_validation() {
        let info = OperatorInfo {
            name: "sm".to_string(),
            op_type: "Softmax".to_string(),
            domain: String::new(),
            version: 13,
        };
        assert!(Softmax::new(info.clone(), -1).check_axis(3).is_ok());
        assert!(Softmax::new(info.clone(), 2).check_axis(3).is_ok());
        assert!(Softmax::new(info, 0).check_axis(3).is_err());
    }

    #[test]
    fn test_from_node_rejects_axes_that_are_never_last() {
        let info = OperatorInfo {
            name: "sm".to_string(),
            op_type: "Softmax".to_string(),
            domain: String::new(),
            version: 13,
        };
        let node = |axis: i64| {
            NodeDescription::new("sm", "Softmax", &["x"], &["y"]).with_attribute("axis", Attribute::Int(axis))
        };
        let err = Softmax::from_node(&node(-2), info.clone()).unwrap_err();
        assert!(matches!(err, GraphForgeError::InvalidAttribute { ref attribute, .. } if attribute == "axis"));
        assert!(err.is_load_error());
        assert_eq!(Softmax::from_node(&node(-1), info.clone()).unwrap().axis, -1);
        // Rank-dependent, so accepted until the node runs
        assert_eq!(Softmax::from_node(&node(0), info).unwrap().axis, 0);
    }
}
