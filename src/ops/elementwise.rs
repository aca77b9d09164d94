//! Element-wise operators: Add, Mul, Sum and Relu
//!
//! Work is fanned out over ranges of output blocks. Each sibling owns a
//! disjoint set of output blocks, so no two siblings ever write the same
//! block.

use super::{map_numeric, required_input, split_range, Operator, OperatorInfo};
use crate::error::{ForgeResult, GraphForgeError};
use crate::graph::context::ExecutionContext;
use crate::memory::{NumericElement, TiledArray};
use crate::tensor::{Tensor, TensorElement, TypedArray};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;

/// Output shape of a two-operand element-wise op.
///
/// Shapes must match, or one operand's shape must be a trailing suffix of
/// the other's (including a single-element operand).
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> ForgeResult<Vec<usize>> {
    let is_suffix = |long: &[usize], short: &[usize]| {
        short.len() <= long.len() && long[long.len() - short.len()..] == *short
    };
    let linear = |s: &[usize]| s.iter().product::<usize>();
    if a == b || is_suffix(a, b) || (linear(b) == 1 && linear(a) > 0) {
        Ok(a.to_vec())
    } else if is_suffix(b, a) || (linear(a) == 1 && linear(b) > 0) {
        Ok(b.to_vec())
    } else {
        Err(GraphForgeError::ShapeMismatch(format!(
            "shapes {:?} and {:?} cannot be broadcast",
            a, b
        )))
    }
}

/// One operand as seen from the output's block layout
enum Operand<T> {
    /// Same shape as the output: block `k` lines up with output block `k`
    Blocks(TiledArray<T>),
    /// Smaller operand repeated along the leading axes
    Broadcast(Arc<Vec<T>>),
}

impl<T: NumericElement> Operand<T> {
    fn for_output(array: &TiledArray<T>, out_shape: &[usize]) -> ForgeResult<Self> {
        if array.shape() == out_shape {
            Ok(Operand::Blocks(array.clone()))
        } else {
            Ok(Operand::Broadcast(Arc::new(array.to_vec()?)))
        }
    }

    fn with_segment<R>(&self, block: usize, block_size: usize, f: impl FnOnce(&[T]) -> R) -> ForgeResult<R> {
        match self {
            Operand::Blocks(array) => array.read_block(block, f),
            Operand::Broadcast(values) => {
                let start = block * block_size;
                let segment: Vec<T> = (start..start + block_size)
                    .map(|i| values[i % values.len()])
                    .collect();
                Ok(f(&segment))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    Add,
    Mul,
}

impl BinaryKind {
    #[inline]
    fn apply<T: NumericElement>(self, a: T, b: T) -> T {
        match self {
            BinaryKind::Add => a + b,
            BinaryKind::Mul => a * b,
        }
    }
}

/// Fold `operands` with `kind` into a freshly allocated output
async fn combine<T: NumericElement>(
    ctx: &ExecutionContext,
    operands: &[&TiledArray<T>],
    kind: BinaryKind,
) -> ForgeResult<TiledArray<T>> {
    let Some(first) = operands.first() else {
        return Err(GraphForgeError::MissingInput("no operands".to_string()));
    };
    let mut shape = first.shape().to_vec();
    for operand in &operands[1..] {
        shape = broadcast_shape(&shape, operand.shape())?;
    }

    let out = ctx.get_array::<T>(&shape, false)?;
    let prepared: Vec<Operand<T>> = operands
        .iter()
        .map(|a| Operand::for_output(a, &shape))
        .collect::<ForgeResult<_>>()?;
    let prepared = Arc::new(prepared);
    let block_size = out.block_size();

    let mut group = ctx.task_group::<()>();
    for blocks in split_range(out.blocks_num(), ctx.limiter().limit()) {
        let out = out.clone();
        let prepared = Arc::clone(&prepared);
        group.spawn(move |cancel| {
            for k in blocks {
                cancel.check()?;
                out.write_block(k, |dst| -> ForgeResult<()> {
                    prepared[0].with_segment(k, block_size, |src| dst.copy_from_slice(src))?;
                    for operand in &prepared[1..] {
                        operand.with_segment(k, block_size, |src| {
                            for (d, s) in dst.iter_mut().zip(src) {
                                *d = kind.apply(*d, *s);
                            }
                        })?;
                    }
                    Ok(())
                })??;
            }
            Ok(())
        });
    }
    group.join().await?;
    Ok(out)
}

async fn relu<T: NumericElement>(ctx: &ExecutionContext, input: &TiledArray<T>) -> ForgeResult<TiledArray<T>> {
    let out = ctx.get_array::<T>(input.shape(), false)?;
    let mut group = ctx.task_group::<()>();
    for blocks in split_range(input.blocks_num(), ctx.limiter().limit()) {
        let input = input.clone();
        let out = out.clone();
        group.spawn(move |cancel| {
            let zero = T::default();
            for k in blocks {
                cancel.check()?;
                input.read_block(k, |src| {
                    out.write_block(k, |dst| {
                        for (d, s) in dst.iter_mut().zip(src) {
                            *d = if *s > zero { *s } else { zero };
                        }
                    })
                })??;
            }
            Ok(())
        });
    }
    group.join().await?;
    Ok(out)
}

fn typed_operands<'a, T: TensorElement>(
    info: &OperatorInfo,
    tensors: &'a [&'a Tensor],
) -> ForgeResult<Vec<&'a TiledArray<T>>> {
    tensors
        .iter()
        .map(|t| {
            t.typed::<T>().map_err(|_| {
                GraphForgeError::TypeMismatch(format!(
                    "{} node '{}' mixes {} and {}",
                    info.op_type,
                    info.name,
                    T::DATA_TYPE,
                    t.data_type()
                ))
            })
        })
        .collect()
}

async fn combine_like<T: NumericElement + TensorElement>(
    ctx: &ExecutionContext,
    info: &OperatorInfo,
    _first: &TiledArray<T>,
    tensors: &[&Tensor],
    kind: BinaryKind,
) -> ForgeResult<TiledArray<T>> {
    let operands = typed_operands::<T>(info, tensors)?;
    combine(ctx, &operands, kind).await
}

async fn combine_tensors(
    ctx: &ExecutionContext,
    info: &OperatorInfo,
    tensors: &[&Tensor],
    kind: BinaryKind,
) -> ForgeResult<Tensor> {
    let first = tensors[0];
    let array = map_numeric!(first.array(), a => {
        combine_like(ctx, info, a, tensors, kind).await?
    }, bool => {
        return Err(GraphForgeError::TypeMismatch(format!(
            "{} node '{}' does not accept bool inputs",
            info.op_type, info.name
        )));
    });
    Ok(Tensor::new(info.name.clone(), array))
}

/// `Add` / `Mul` with trailing broadcast of either operand
#[derive(Debug)]
pub struct ElementwiseBinary {
    info: OperatorInfo,
    kind: BinaryKind,
}

impl ElementwiseBinary {
    pub fn new(info: OperatorInfo, kind: BinaryKind) -> Self {
        ElementwiseBinary { info, kind }
    }
}

impl Operator for ElementwiseBinary {
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
            let out = combine_tensors(ctx, &self.info, &[a, b], self.kind).await?;
            Ok(vec![Some(out)])
        }
        .boxed()
    }
}

/// Variadic element-wise sum
#[derive(Debug)]
pub struct Sum {
    info: OperatorInfo,
}

impl Sum {
    pub fn new(info: OperatorInfo) -> Self {
        Sum { info }
    }
}

impl Operator for Sum {
    fn info(&self) -> &OperatorInfo {
        &self.info
    }

    fn apply<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        inputs: Vec<Option<Tensor>>,
    ) -> BoxFuture<'a, ForgeResult<Vec<Option<Tensor>>>> {
        async move {
            let present: Vec<&Tensor> = inputs.iter().flatten().collect();
            if present.is_empty() {
                return Err(GraphForgeError::MissingInput(format!(
                    "Sum node '{}' has no inputs",
                    self.info.name
                )));
            }
            let out = combine_tensors(ctx, &self.info, &present, BinaryKind::Add).await?;
            Ok(vec![Some(out)])
        }
        .boxed()
    }
}

#[derive(Debug)]
pub struct Relu {
    info: OperatorInfo,
}

impl Relu {
    pub fn new(info: OperatorInfo) -> Self {
        Relu { info }
    }
}

impl Operator for Relu {
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
            let array: TypedArray = map_numeric!(x.array(), a => relu(ctx, a).await?, bool => {
                return Err(GraphForgeError::TypeMismatch(format!(
                    "Relu node '{}' does not accept bool inputs",
                    self.info.name
                )));
            });
            Ok(vec![Some(Tensor::new(self.info.name.clone(), array))])
        }
        .boxed()
    }
}
