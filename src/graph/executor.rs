//! Dependency-driven graph execution
//!
//! Each node becomes a task as soon as all of its inputs exist, so
//! independent branches run concurrently. The executor keeps a reference to
//! every live value and drops it once its last consumer has finished, which
//! lets the allocation context recycle intermediates at close.
//!
//! On the first node failure the invocation's cancellation flag is raised,
//! every in-flight node is awaited, and that first failure is returned.

use super::context::ExecutionContext;
use super::topology::GraphTopology;
use crate::error::{ForgeResult, GraphForgeError};
use crate::ops::Operator;
use crate::profiling::NodeTimer;
use crate::runtime::limiter::panic_message;
use crate::runtime::task_group::record_failure;
use crate::tensor::Tensor;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Lifecycle of one node within an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Not started; waiting for inputs or for its turn
    Ready,
    Running,
    Done,
    Failed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Ready => write!(f, "ready"),
            NodeState::Running => write!(f, "running"),
            NodeState::Done => write!(f, "done"),
            NodeState::Failed => write!(f, "failed"),
        }
    }
}

/// A resolved node: its wiring plus the operator that implements it
#[derive(Debug, Clone)]
pub struct ExecutionNode {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub operator: Arc<dyn Operator>,
}

type NodeOutcome = (usize, ForgeResult<Vec<Option<Tensor>>>);

#[derive(Debug)]
pub struct GraphExecutor {
    nodes: Vec<ExecutionNode>,
    topology: GraphTopology,
    inputs: Vec<String>,
    outputs: Vec<String>,
    initializers: HashMap<String, Tensor>,
}

async fn run_node(
    operator: Arc<dyn Operator>,
    ctx: &ExecutionContext,
    inputs: ForgeResult<Vec<Option<Tensor>>>,
    name: &str,
    op_type: &str,
) -> ForgeResult<Vec<Option<Tensor>>> {
    ctx.cancel().check()?;
    let inputs = inputs?;
    let mut timer = NodeTimer::started(name);
    let outputs = operator.apply(ctx, inputs).await;
    timer.stop();
    if let Some(profiler) = ctx.profiler() {
        profiler.record(op_type, &timer);
    }
    tracing::trace!(elapsed_ms = timer.elapsed_ms().unwrap_or_default(), "node finished");
    outputs
}

/// Mutable bookkeeping of one `execute` call
struct Run<'g> {
    graph: &'g GraphExecutor,
    values: HashMap<String, Tensor>,
    remaining_reads: HashMap<String, usize>,
    waiting_on: Vec<usize>,
    states: Vec<NodeState>,
    pinned: HashSet<&'g str>,
}

impl<'g> Run<'g> {
    fn gather_inputs(&self, index: usize) -> ForgeResult<Vec<Option<Tensor>>> {
        let node = &self.graph.nodes[index];
        node.inputs
            .iter()
            .map(|name| {
                if name.is_empty() {
                    return Ok(None);
                }
                self.values.get(name).cloned().map(Some).ok_or_else(|| {
                    GraphForgeError::MissingInput(format!(
                        "value '{}' needed by node '{}' was not produced",
                        name, node.name
                    ))
                })
            })
            .collect()
    }

    fn spawn(&mut self, tasks: &mut JoinSet<NodeOutcome>, ctx: &ExecutionContext, index: usize) {
        let graph = self.graph;
        let node = &graph.nodes[index];
        self.states[index] = NodeState::Running;
        let inputs = self.gather_inputs(index);
        let operator = Arc::clone(&node.operator);
        let ctx = ctx.clone();
        let name = node.name.clone();
        let op_type = node.op_type.clone();
        let span = tracing::debug_span!(
            "graph.node",
            node = %name,
            op_type = %op_type,
            invocation = ctx.invocation()
        );

        tasks.spawn(
            async move {
                let result = run_node(operator, &ctx, inputs, &name, &op_type).await;
                (index, result)
            }
            .instrument(span),
        );
    }

    /// Bind a finished node's outputs and release values nobody reads anymore
    fn complete(&mut self, index: usize, outputs: Vec<Option<Tensor>>) -> ForgeResult<()> {
        let graph = self.graph;
        let node = &graph.nodes[index];
        if outputs.len() > node.outputs.len() {
            return Err(GraphForgeError::InternalError(format!(
                "node '{}' returned {} outputs, declared {}",
                node.name,
                outputs.len(),
                node.outputs.len()
            )));
        }
        for (name, value) in node.outputs.iter().zip(outputs) {
            let Some(tensor) = value else { continue };
            if name.is_empty() {
                continue;
            }
            let read_later = self.remaining_reads.get(name).copied().unwrap_or(0) > 0;
            if read_later || self.pinned.contains(name.as_str()) {
                self.values.insert(name.clone(), tensor.with_name(name.clone()));
            }
        }
        for name in node.inputs.iter().filter(|n| !n.is_empty()) {
            if let Some(count) = self.remaining_reads.get_mut(name) {
                *count -= 1;
                if *count == 0 && !self.pinned.contains(name.as_str()) {
                    self.values.remove(name);
                }
            }
        }
        self.states[index] = NodeState::Done;
        Ok(())
    }
}

impl GraphExecutor {
    pub fn new(
        topology: GraphTopology,
        nodes: Vec<ExecutionNode>,
        inputs: Vec<String>,
        initializers: HashMap<String, Tensor>,
        outputs: Vec<String>,
    ) -> Self {
        GraphExecutor {
            nodes,
            topology,
            inputs,
            outputs,
            initializers,
        }
    }

    pub fn nodes(&self) -> &[ExecutionNode] {
        &self.nodes
    }

    pub fn input_names(&self) -> &[String] {
        &self.inputs
    }

    pub fn output_names(&self) -> &[String] {
        &self.outputs
    }

    pub fn initializers(&self) -> &HashMap<String, Tensor> {
        &self.initializers
    }

    /// Run the graph once.
    ///
    /// Declared outputs are marked `ContextOutput` before they are returned.
    /// An output that aliases an initializer is copied into the invocation's
    /// context first.
    ///
    /// A node failure comes back as [`GraphForgeError::OperatorFailed`]
    /// naming the node; [`GraphForgeError::root_cause`] gives the operator's
    /// own error.
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        mut inputs: HashMap<String, Tensor>,
    ) -> ForgeResult<HashMap<String, Tensor>> {
        let mut values = self.initializers.clone();
        for name in &self.inputs {
            let tensor = inputs.remove(name).ok_or_else(|| {
                GraphForgeError::MissingInput(format!("graph input '{}' was not provided", name))
            })?;
            values.insert(name.clone(), tensor.with_name(name.clone()));
        }
        if !inputs.is_empty() {
            let extra: Vec<&String> = inputs.keys().collect();
            tracing::debug!(?extra, "ignoring inputs the graph does not declare");
        }

        let mut run = Run {
            graph: self,
            values,
            remaining_reads: self.topology.consumer_counts.clone(),
            waiting_on: self.topology.dependency_counts.clone(),
            states: vec![NodeState::Ready; self.nodes.len()],
            pinned: self.outputs.iter().map(String::as_str).collect(),
        };

        let mut tasks: JoinSet<NodeOutcome> = JoinSet::new();
        for index in self.topology.roots() {
            run.spawn(&mut tasks, ctx, index);
        }

        let mut failure: Option<GraphForgeError> = None;
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    let err = if err.is_panic() {
                        GraphForgeError::TaskPanicked(panic_message(err.into_panic()))
                    } else {
                        GraphForgeError::Cancelled
                    };
                    if failure.is_none() {
                        ctx.cancel().cancel();
                    }
                    record_failure(&mut failure, err);
                    continue;
                }
            };

            let node_name = &self.nodes[index].name;
            let result = result.and_then(|outputs| run.complete(index, outputs));
            match result {
                Ok(()) => {
                    if failure.is_some() {
                        continue;
                    }
                    for &dependent in &self.topology.dependents[index] {
                        run.waiting_on[dependent] -= 1;
                        if run.waiting_on[dependent] == 0 {
                            run.spawn(&mut tasks, ctx, dependent);
                        }
                    }
                }
                Err(err) => {
                    run.states[index] = NodeState::Failed;
                    if failure.is_none() {
                        tracing::warn!(node = %node_name, error = %err, "node failed, cancelling invocation");
                        ctx.cancel().cancel();
                    }
                    record_failure(&mut failure, err.in_node(node_name));
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }

        let mut outputs = HashMap::with_capacity(self.outputs.len());
        for name in &self.outputs {
            let mut tensor = run.values.get(name).cloned().ok_or_else(|| {
                GraphForgeError::MissingInput(format!("graph output '{}' was not produced", name))
            })?;
            // Callers may write to outputs; they must never reach the weights
            if self.initializers.values().any(|init| tensor.shares_blocks_with(init)) {
                tensor = tensor.copy_into(ctx.allocation())?;
            }
            ctx.allocation().mark_output(&tensor);
            outputs.insert(name.clone(), tensor);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::description::{GraphDescription, NodeDescription};
    use crate::memory::{ModelArrayStorage, UsageMarker};
    use crate::ops::{OperatorRegistry, OperatorSetRegistry};
    use crate::runtime::{CancellationFlag, ParallelismLimiter};

    fn build(graph: &GraphDescription) -> GraphExecutor {
        let registry = OperatorRegistry::with_builtin_operators();
        let opsets = OperatorSetRegistry::from_imports(&graph.opset_imports);
        let topology = GraphTopology::build(graph).unwrap();
        let nodes = graph
            .nodes
            .iter()
            .map(|n| ExecutionNode {
                name: n.name.clone(),
                op_type: n.op_type.clone(),
                inputs: n.inputs.clone(),
                outputs: n.outputs.clone(),
                operator: registry.resolve(n, &opsets).unwrap(),
            })
            .collect();
        GraphExecutor::new(topology, nodes, graph.inputs.clone(), HashMap::new(), graph.outputs.clone())
    }

    fn context(storage: &Arc<ModelArrayStorage>) -> ExecutionContext {
        ExecutionContext::new(
            Arc::new(storage.create_context().unwrap()),
            ParallelismLimiter::new(2),
            CancellationFlag::new(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_chain_marks_outputs_and_frees_intermediates() {
        let graph = GraphDescription::new("chain")
            .with_input("x")
            .with_output("z")
            .with_node(NodeDescription::new("r", "Relu", &["x"], &["y"]))
            .with_node(NodeDescription::new("a", "Add", &["y", "y"], &["z"]));
        let executor = build(&graph);
        let storage = ModelArrayStorage::new("exec", true);
        let ctx = context(&storage);

        let x = Tensor::from_vec("x", &[2, 2], vec![-1.0f32, 2.0, -3.0, 4.0]).unwrap();
        let outputs = executor.execute(&ctx, HashMap::from([("x".to_string(), x)])).await.unwrap();

        let z = &outputs["z"];
        assert_eq!(z.name(), "z");
        assert_eq!(z.to_f64_vec().unwrap(), vec![0.0, 4.0, 0.0, 8.0]);
        assert!(z.markers().iter().all(|m| *m == UsageMarker::ContextOutput));

        let summary = ctx.allocation().close();
        // Relu's intermediate goes back, the output stays out
        assert_eq!(summary.recycled_blocks, 2);
        assert_eq!(summary.retained_blocks, 2);
    }

    #[tokio::test]
    async fn test_missing_graph_input() {
        let graph = GraphDescription::new("g")
            .with_input("x")
            .with_output("y")
            .with_node(NodeDescription::new("r", "Relu", &["x"], &["y"]));
        let executor = build(&graph);
        let storage = ModelArrayStorage::new("exec", true);
        let err = executor.execute(&context(&storage), HashMap::new()).await.unwrap_err();
        assert!(matches!(err, GraphForgeError::MissingInput(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_is_wrapped_with_node_name() {
        let graph = GraphDescription::new("bad")
            .with_input("a")
            .with_input("b")
            .with_output("c")
            .with_node(NodeDescription::new("mm", "MatMul", &["a", "b"], &["c"]));
        let executor = build(&graph);
        let storage = ModelArrayStorage::new("exec", true);
        let ctx = context(&storage);
        let a = Tensor::from_vec("a", &[2, 3], vec![0.0f32; 6]).unwrap();
        let b = Tensor::from_vec("b", &[2, 3], vec![0.0f32; 6]).unwrap();
        let err = executor
            .execute(&ctx, HashMap::from([("a".to_string(), a), ("b".to_string(), b)]))
            .await
            .unwrap_err();
        match &err {
            GraphForgeError::OperatorFailed { node, .. } => assert_eq!(node, "mm"),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(matches!(err.root_cause(), GraphForgeError::ShapeMismatch(_)));
        assert!(ctx.cancel().is_cancelled());
    }

    #[tokio::test]
    async fn test_graph_output_can_be_an_input() {
        let graph = GraphDescription::new("passthrough").with_input("x").with_output("x");
        let executor = build(&graph);
        let storage = ModelArrayStorage::new("exec", true);
        let x = Tensor::from_vec("x", &[3], vec![1i32, 2, 3]).unwrap();
        let outputs = executor
            .execute(&context(&storage), HashMap::from([("x".to_string(), x)]))
            .await
            .unwrap();
        assert_eq!(outputs["x"].to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0]);
    }
}
