//! Loaded models: load, predict, close

use super::config::ModelConfig;
use crate::error::{ForgeResult, GraphForgeError};
use crate::graph::{
    ExecutionContext, ExecutionNode, GraphDescription, GraphExecutor, GraphTopology,
};
use crate::memory::{ModelArrayStorage, StorageStats};
use crate::ops::{OperatorRegistry, OperatorSetRegistry};
use crate::profiling::{OpSummary, ProfileReport, ProfilingContext};
use crate::runtime::{CancellationFlag, ParallelismLimiter, ResourceDispatcher};
use crate::tensor::Tensor;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::Instrument;

static NEXT_MODEL: AtomicU64 = AtomicU64::new(1);

/// A graph bound to its operators, pools and parallelism limiter.
///
/// `predict` may be called concurrently; each call runs in its own allocation
/// context drawing from the model's pools.
#[derive(Debug)]
pub struct Model {
    id: String,
    name: String,
    config: ModelConfig,
    executor: GraphExecutor,
    storage: Arc<ModelArrayStorage>,
    limiter: ParallelismLimiter,
    closed: AtomicBool,
    profiles: Mutex<Vec<ProfileReport>>,
}

impl Model {
    /// Validate `graph`, resolve every node against `registry` and build the
    /// initializer tensors.
    pub fn load(graph: &GraphDescription, registry: &OperatorRegistry, config: ModelConfig) -> ForgeResult<Self> {
        let mut graph = graph.clone();
        graph.assign_node_names();

        let topology = GraphTopology::build(&graph)?;
        let opsets = OperatorSetRegistry::from_imports(&graph.opset_imports);
        let nodes = graph
            .nodes
            .iter()
            .map(|node| {
                Ok(ExecutionNode {
                    name: node.name.clone(),
                    op_type: node.op_type.clone(),
                    inputs: node.inputs.clone(),
                    outputs: node.outputs.clone(),
                    operator: registry.resolve(node, &opsets)?,
                })
            })
            .collect::<ForgeResult<Vec<_>>>()?;

        let mut initializers = HashMap::with_capacity(graph.initializers.len());
        for init in &graph.initializers {
            let tensor = init.to_tensor().map_err(|e| {
                GraphForgeError::InvalidGraph(format!("initializer '{}': {}", init.name, e))
            })?;
            // Initializers outlive every invocation
            tensor.mark_global_output();
            initializers.insert(init.name.clone(), tensor);
        }

        let id = format!(
            "{}:{}:{}",
            graph.domain,
            graph.model_version,
            NEXT_MODEL.fetch_add(1, Ordering::Relaxed)
        );
        let storage = ModelArrayStorage::new(id.clone(), config.pooling);
        let limiter = ParallelismLimiter::new(config.parallelism_limit);

        tracing::info!(
            model = %id,
            name = %graph.name,
            nodes = nodes.len(),
            initializers = initializers.len(),
            parallelism = limiter.limit(),
            pooling = config.pooling,
            "loaded model"
        );

        Ok(Model {
            id,
            name: graph.name.clone(),
            config,
            executor: GraphExecutor::new(
                topology,
                nodes,
                graph.inputs.clone(),
                initializers,
                graph.outputs.clone(),
            ),
            storage,
            limiter,
            closed: AtomicBool::new(false),
            profiles: Mutex::new(Vec::new()),
        })
    }

    /// Parse a JSON graph file and load it with the built-in operators
    pub fn load_json_file(path: impl AsRef<std::path::Path>, config: ModelConfig) -> ForgeResult<Self> {
        let graph = GraphDescription::from_json_file(path)?;
        Self::load(&graph, &OperatorRegistry::with_builtin_operators(), config)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn input_names(&self) -> &[String] {
        self.executor.input_names()
    }

    pub fn output_names(&self) -> &[String] {
        self.executor.output_names()
    }

    pub fn storage_stats(&self) -> StorageStats {
        self.storage.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run the graph once under the process-wide resource dispatcher
    pub async fn predict(&self, inputs: HashMap<String, Tensor>, profile: bool) -> ForgeResult<HashMap<String, Tensor>> {
        self.predict_with(inputs, profile, ResourceDispatcher::global()).await
    }

    /// Run the graph once, reserving a core from `dispatcher`.
    ///
    /// The invocation holds its reservation and its allocation context for
    /// its whole lifetime. The context is closed on every path, so a failed
    /// invocation still returns its reclaimable blocks. Returned tensors are
    /// promoted to `GlobalOutput` and stay valid after the call.
    ///
    /// A failing node surfaces as [`GraphForgeError::OperatorFailed`] with
    /// the node's name; the operator's own error is its
    /// [`root_cause`](GraphForgeError::root_cause). Dropping the returned
    /// future cancels the invocation: the core is released at once and
    /// sub-tasks stop at their next cancellation check.
    pub async fn predict_with(
        &self,
        inputs: HashMap<String, Tensor>,
        profile: bool,
        dispatcher: &ResourceDispatcher,
    ) -> ForgeResult<HashMap<String, Tensor>> {
        let span = tracing::info_span!("model.predict", model = %self.id);
        async move {
            if self.is_closed() {
                return Err(GraphForgeError::ModelClosed(self.id.clone()));
            }
            let _reservation = dispatcher.reserve_core().await?;
            let allocation = Arc::new(self.storage.create_context()?);

            let profiler = (profile || self.config.profile_by_default)
                .then(|| Arc::new(ProfilingContext::new(self.id.clone())));
            let cancel = CancellationFlag::new();
            let cancel_on_drop = cancel.drop_guard();
            let mut ctx = ExecutionContext::new(Arc::clone(&allocation), self.limiter.clone(), cancel);
            if let Some(profiler) = &profiler {
                ctx = ctx.with_profiler(Arc::clone(profiler));
            }

            let result = self.executor.execute(&ctx, inputs).await;
            cancel_on_drop.disarm();
            if let Ok(outputs) = &result {
                for tensor in outputs.values() {
                    tensor.mark_global_output();
                }
            }
            drop(ctx);

            let summary = allocation.close();
            match &result {
                Ok(_) => tracing::debug!(context = allocation.id(), %summary, "invocation finished"),
                Err(err) => tracing::warn!(context = allocation.id(), %summary, error = %err, "invocation failed"),
            }

            if let Some(profiler) = profiler {
                let report = match Arc::try_unwrap(profiler) {
                    Ok(profiler) => profiler.into_report(),
                    Err(shared) => shared.snapshot(),
                };
                self.lock_profiles().push(report);
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Drop every pooled block. Safe between invocations.
    pub fn clear_cache(&self) -> usize {
        self.storage.clear_cache()
    }

    /// Release the model's pools. Idempotent; `predict` fails afterwards.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.storage.close();
        tracing::info!(model = %self.id, "closed model");
    }

    fn lock_profiles(&self) -> std::sync::MutexGuard<'_, Vec<ProfileReport>> {
        self.profiles.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Reports of every profiled invocation so far
    pub fn profiles(&self) -> Vec<ProfileReport> {
        self.lock_profiles().clone()
    }

    /// Aggregate all recorded profiles by operator type
    pub fn analyze_profiles(&self) -> Vec<OpSummary> {
        ProfileReport::analyze(self.lock_profiles().iter())
    }

    pub fn reset_profiles(&self) {
        self.lock_profiles().clear();
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeDescription, TensorData};
    use crate::memory::{DataType, UsageMarker};

    fn scale_graph() -> GraphDescription {
        GraphDescription::new("scale")
            .with_opset("", 13)
            .with_input("x")
            .with_output("y")
            .with_initializer(TensorData::new("two", DataType::Float32, &[1], vec![2.0]))
            .with_node(NodeDescription::new("", "Mul", &["x", "two"], &["y"]))
    }

    fn inputs(values: Vec<f32>) -> HashMap<String, Tensor> {
        let n = values.len();
        HashMap::from([("x".to_string(), Tensor::from_vec("x", &[n], values).unwrap())])
    }

    #[test]
    fn test_load_assigns_ids_and_names() {
        let registry = OperatorRegistry::with_builtin_operators();
        let a = Model::load(&scale_graph(), &registry, ModelConfig::default()).unwrap();
        let b = Model::load(&scale_graph(), &registry, ModelConfig::default()).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with(":0:"));
        assert_eq!(a.name(), "scale");
        assert_eq!(a.input_names(), &["x".to_string()]);
        assert_eq!(a.output_names(), &["y".to_string()]);
    }

    #[test]
    fn test_bad_initializer_is_a_load_error() {
        let graph = scale_graph().with_initializer(TensorData::new("w", DataType::Int32, &[2, 2], vec![1.0]));
        let err = Model::load(&graph, &OperatorRegistry::with_builtin_operators(), ModelConfig::default())
            .unwrap_err();
        assert!(err.is_load_error());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_predict_returns_global_outputs() {
        let model = Model::load(&scale_graph(), &OperatorRegistry::with_builtin_operators(), ModelConfig::default())
            .unwrap();
        let dispatcher = ResourceDispatcher::new(1);
        let outputs = model.predict_with(inputs(vec![1.0, 2.0, 3.0]), false, &dispatcher).await.unwrap();
        let y = &outputs["y"];
        assert_eq!(y.to_f64_vec().unwrap(), vec![2.0, 4.0, 6.0]);
        assert!(y.markers().iter().all(|m| *m == UsageMarker::GlobalOutput));
        assert_eq!(dispatcher.available(), 1);
    }

    #[tokio::test]
    async fn test_closed_model_refuses_predict() {
        let model = Model::load(&scale_graph(), &OperatorRegistry::with_builtin_operators(), ModelConfig::default())
            .unwrap();
        model.close();
        model.close();
        let err = model.predict(inputs(vec![1.0]), false).await.unwrap_err();
        assert!(matches!(err, GraphForgeError::ModelClosed(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_profiles_are_collected() {
        let model = Model::load(&scale_graph(), &OperatorRegistry::with_builtin_operators(), ModelConfig::default())
            .unwrap();
        let dispatcher = ResourceDispatcher::new(2);
        model.predict_with(inputs(vec![1.0]), true, &dispatcher).await.unwrap();
        model.predict_with(inputs(vec![1.0]), false, &dispatcher).await.unwrap();

        let profiles = model.profiles();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].entries[0].node, "Mul_0");
        assert_eq!(model.analyze_profiles()[0].op_type, "Mul");

        model.reset_profiles();
        assert!(model.profiles().is_empty());
    }
}
