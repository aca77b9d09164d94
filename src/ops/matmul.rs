//! Matrix multiplication
//!
//! Supports `[M, K] x [K, N]`, batched `[B, M, K] x [K, N]` and
//! `[B, M, K] x [B, K, N]`. Work is split per batch and per range of output
//! rows; output rows start on block boundaries, so every sibling writes its
//! own blocks.

use super::{map_numeric, required_input, split_range, Operator, OperatorInfo};
use crate::error::{ForgeResult, GraphForgeError};
use crate::graph::context::ExecutionContext;
use crate::memory::{NumericElement, TiledArray};
use crate::tensor::{Tensor, TensorElement, TypedArray};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MatMulDims {
    batch: usize,
    m: usize,
    k: usize,
    n: usize,
    batched_lhs: bool,
    batched_rhs: bool,
}

impl MatMulDims {
    fn resolve(lhs: &[usize], rhs: &[usize]) -> ForgeResult<Self> {
        let (batch, m, k, batched_lhs) = match *lhs {
            [m, k] => (1, m, k, false),
            [b, m, k] => (b, m, k, true),
            _ => {
                return Err(GraphForgeError::ShapeMismatch(format!(
                    "MatMul left operand must be rank 2 or 3, got {:?}",
                    lhs
                )))
            }
        };
        let (k2, n, batched_rhs) = match *rhs {
            [k2, n] => (k2, n, false),
            [b, k2, n] if batched_lhs && b == batch => (k2, n, true),
            _ => {
                return Err(GraphForgeError::ShapeMismatch(format!(
                    "MatMul right operand {:?} does not match left operand {:?}",
                    rhs, lhs
                )))
            }
        };
        if k != k2 {
            return Err(GraphForgeError::ShapeMismatch(format!(
                "MatMul inner dimensions differ: {:?} x {:?}",
                lhs, rhs
            )));
        }
        Ok(MatMulDims {
            batch,
            m,
            k,
            n,
            batched_lhs,
            batched_rhs,
        })
    }

    fn output_shape(&self) -> Vec<usize> {
        if self.batched_lhs {
            vec![self.batch, self.m, self.n]
        } else {
            vec![self.m, self.n]
        }
    }
}

async fn matmul<T: NumericElement + TensorElement>(
    ctx: &ExecutionContext,
    info: &OperatorInfo,
    lhs: &TiledArray<T>,
    rhs: &Tensor,
) -> ForgeResult<TiledArray<T>> {
    let rhs = rhs.typed::<T>().map_err(|_| {
        GraphForgeError::TypeMismatch(format!(
            "MatMul node '{}' mixes {} and {}",
            info.name,
            T::DATA_TYPE,
            rhs.data_type()
        ))
    })?;
    let dims = MatMulDims::resolve(lhs.shape(), rhs.shape())?;
    let out = ctx.get_array::<T>(&dims.output_shape(), false)?;
    let rhs_values = Arc::new(rhs.to_vec()?);

    let parts = ctx.limiter().limit().div_ceil(dims.batch.max(1)).max(1);
    let mut group = ctx.task_group::<()>();
    for batch in 0..dims.batch {
        for rows in split_range(dims.m, parts) {
            let lhs = lhs.clone();
            let out = out.clone();
            let rhs_values = Arc::clone(&rhs_values);
            group.spawn(move |cancel| {
                cancel.check()?;
                let MatMulDims { m, k, n, .. } = dims;
                let rhs_offset = if dims.batched_rhs { batch * k * n } else { 0 };
                let first_row = batch * m + rows.start;
                let left = lhs.read_range(first_row * k, rows.len() * k)?;

                let mut result = vec![T::default(); rows.len() * n];
                for r in 0..rows.len() {
                    let acc = &mut result[r * n..(r + 1) * n];
                    for kk in 0..k {
                        let a = left[r * k + kk];
                        let rhs_row = &rhs_values[rhs_offset + kk * n..rhs_offset + (kk + 1) * n];
                        for (dst, b) in acc.iter_mut().zip(rhs_row) {
                            *dst = *dst + a * *b;
                        }
                    }
                }
                out.write_range(first_row * n, &result)
            });
        }
    }
    group.join().await?;
    Ok(out)
}

#[derive(Debug)]
pub struct MatMul {
    info: OperatorInfo,
}

impl MatMul {
    pub fn new(info: OperatorInfo) -> Self {
        MatMul { info }
    }
}

impl Operator for MatMul {
    fn info(&self) -> &OperatorInfo {
        &self.info
    }

    fn apply<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        inputs: Vec<Option<Tensor>>,
    ) -> BoxFuture<'a, ForgeResult<Vec<Option<Tensor>>>> {
        async move {
            let a = required_input(&self.info, &inputs, 0)?;
            let b = required_input(&self.info, &inputs, 1)?;
            let array: TypedArray = map_numeric!(a.array(), lhs => matmul(ctx, &self.info, lhs, b).await?, bool => {
                return Err(GraphForgeError::TypeMismatch(format!(
                    "MatMul node '{}' does not accept bool inputs",
                    self.info.name
                )));
            });
            Ok(vec![Some(Tensor::new(self.info.name.clone(), array))])
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_plain() {
        let dims = MatMulDims::resolve(&[2, 3], &[3, 4]).unwrap();
        assert_eq!(dims.output_shape(), vec![2, 4]);
        assert!(!dims.batched_rhs);
    }

    #[test]
    fn test_resolve_batched() {
        let shared = MatMulDims::resolve(&[5, 2, 3], &[3, 4]).unwrap();
        assert_eq!(shared.output_shape(), vec![5, 2, 4]);
        assert!(!shared.batched_rhs);

        let paired = MatMulDims::resolve(&[5, 2, 3], &[5, 3, 4]).unwrap();
        assert!(paired.batched_rhs);
    }

    #[test]
    fn test_resolve_rejects_mismatch() {
        assert!(MatMulDims::resolve(&[2, 3], &[4, 4]).is_err());
        assert!(MatMulDims::resolve(&[2, 3], &[2, 3, 4]).is_err());
        assert!(MatMulDims::resolve(&[5, 2, 3], &[4, 3, 4]).is_err());
        assert!(MatMulDims::resolve(&[3], &[3, 4]).is_err());
    }
}
