//! Identity: forwards its input without copying

use super::{required_input, Operator, OperatorInfo};
use crate::error::ForgeResult;
use crate::graph::context::ExecutionContext;
use crate::tensor::Tensor;
use futures::future::BoxFuture;
use futures::FutureExt;

/// Returns its input. The output shares blocks (and usage markers) with the
/// input, so marking the output pins the input's blocks too.
#[derive(Debug)]
pub struct Identity {
    info: OperatorInfo,
}

impl Identity {
    pub fn new(info: OperatorInfo) -> Self {
        Identity { info }
    }
}

impl Operator for Identity {
    fn info(&self) -> &OperatorInfo {
        &self.info
    }

    fn apply<'a>(
        &'a self,
        _ctx: &'a ExecutionContext,
        inputs: Vec<Option<Tensor>>,
    ) -> BoxFuture<'a, ForgeResult<Vec<Option<Tensor>>>> {
        async move {
            let input = required_input(&self.info, &inputs, 0)?;
            Ok(vec![Some(input.clone())])
        }
        .boxed()
    }
}
