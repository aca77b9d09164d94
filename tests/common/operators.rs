//! Operators registered only by tests

use futures::future::BoxFuture;
use futures::FutureExt;
use graphforge::graph::ExecutionContext;
use graphforge::ops::{Operator, OperatorInfo, VersionInfo};
use graphforge::{ForgeResult, GraphForgeError, OperatorRegistry, Tensor};
use std::sync::Arc;
use std::time::Duration;

pub const TEST_DOMAIN: &str = "test.ops";

/// Fans out one sibling per output row. The sibling at `fail_at` rejects its
/// slice; the others work slowly so they are still in flight when it fails.
#[derive(Debug)]
pub struct FailingFanOut {
    info: OperatorInfo,
    siblings: usize,
    fail_at: usize,
}

pub const FAN_OUT_WIDTH: usize = 64;

pub fn rejection_message(index: usize) -> String {
    format!("sibling {} rejected its slice", index)
}

impl Operator for FailingFanOut {
    fn info(&self) -> &OperatorInfo {
        &self.info
    }

    fn apply<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        _inputs: Vec<Option<Tensor>>,
    ) -> BoxFuture<'a, ForgeResult<Vec<Option<Tensor>>>> {
        async move {
            let out = ctx.get_array::<f32>(&[self.siblings, FAN_OUT_WIDTH], false)?;
            let mut group = ctx.task_group::<()>();
            for index in 0..self.siblings {
                let out = out.clone();
                let fail_at = self.fail_at;
                group.spawn(move |flag| {
                    if index == fail_at {
                        return Err(GraphForgeError::ShapeMismatch(rejection_message(index)));
                    }
                    for step in 0..FAN_OUT_WIDTH {
                        flag.check()?;
                        out.write_block(index, |row| row[step] = index as f32)?;
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Ok(())
                });
            }
            group.join().await?;
            Ok(vec![Some(Tensor::from_array(self.info.name.clone(), out))])
        }
        .boxed()
    }
}

/// Built-in operators plus the test-only ones
pub fn test_registry() -> OperatorRegistry {
    let mut registry = OperatorRegistry::with_builtin_operators();
    registry.register_fn(TEST_DOMAIN, "FailingFanOut", VersionInfo::since(1), |node, info| {
        let siblings = node.int_attribute("siblings", 8)? as usize;
        let fail_at = node.int_attribute("fail_at", 3)? as usize;
        Ok(Arc::new(FailingFanOut {
            info,
            siblings,
            fail_at,
        }))
    });
    registry
}
