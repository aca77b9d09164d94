//! Failure inside a fan-out group: error propagation and pool integrity

mod common;

use common::operators::{rejection_message, test_registry, FAN_OUT_WIDTH, TEST_DOMAIN};
use common::{diamond_inputs, values};
use graphforge::graph::Attribute;
use graphforge::{
    DataType, GraphDescription, GraphForgeError, Model, ModelConfig, NodeDescription, ResourceDispatcher, Tensor,
};
use std::collections::HashMap;
use std::time::Duration;

const SIBLINGS: usize = 8;

fn fan_out_graph(fail_at: usize) -> GraphDescription {
    GraphDescription::new("fan_out")
        .with_opset("", 13)
        .with_opset(TEST_DOMAIN, 1)
        .with_input("x")
        .with_output("z")
        .with_output("a")
        .with_node(NodeDescription::new("side", "Relu", &["x"], &["a"]))
        .with_node(
            NodeDescription::new("fan", "FailingFanOut", &["x"], &["z"])
                .with_domain(TEST_DOMAIN)
                .with_attribute("siblings", Attribute::Int(SIBLINGS as i64))
                .with_attribute("fail_at", Attribute::Int(fail_at as i64)),
        )
}

fn load(fail_at: usize) -> Model {
    Model::load(&fan_out_graph(fail_at), &test_registry(), ModelConfig::default().with_parallelism_limit(2)).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_predict_returns_the_failing_sibling_error() {
    let model = load(3);
    let dispatcher = ResourceDispatcher::new(1);

    let err = model.predict_with(diamond_inputs(1, 4, 16), false, &dispatcher).await.unwrap_err();
    match &err {
        GraphForgeError::OperatorFailed { node, .. } => assert_eq!(node, "fan"),
        other => panic!("expected an operator failure, got {:?}", other),
    }
    match err.root_cause() {
        GraphForgeError::ShapeMismatch(message) => assert_eq!(message, &rejection_message(3)),
        other => panic!("expected the sibling's error, got {:?}", other),
    }
    assert!(!err.is_cancelled());
    assert_eq!(dispatcher.available(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_invocation_returns_every_block() {
    let model = load(0);
    let dispatcher = ResourceDispatcher::new(1);
    model.predict_with(diamond_inputs(1, 4, 16), false, &dispatcher).await.unwrap_err();

    let stats = model.storage_stats();
    let f32_stats = stats.per_type[&DataType::Float32];
    assert_eq!(f32_stats.dropped_blocks, 0);
    assert_eq!(f32_stats.free_blocks, f32_stats.fresh_blocks);
    assert!(f32_stats.free_blocks >= SIBLINGS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_completed_fan_out_overwrites_recycled_blocks() {
    let model = load(SIBLINGS);
    let dispatcher = ResourceDispatcher::new(2);

    for seed in 0..3 {
        let x = Tensor::from_vec("x", &[2, 8], values(seed, 16)).unwrap();
        let outputs = model
            .predict_with(HashMap::from([("x".to_string(), x)]), false, &dispatcher)
            .await
            .unwrap();
        let z = outputs["z"].to_f64_vec().unwrap();
        assert_eq!(z.len(), SIBLINGS * FAN_OUT_WIDTH);
        for (row, chunk) in z.chunks(FAN_OUT_WIDTH).enumerate() {
            assert!(chunk.iter().all(|v| *v == row as f64), "row {} was not fully written", row);
        }
        assert_eq!(outputs["a"].shape(), &[2, 8]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_failures_do_not_grow_pools() {
    let model = load(5);
    let dispatcher = ResourceDispatcher::new(2);

    model.predict_with(diamond_inputs(2, 4, 16), false, &dispatcher).await.unwrap_err();
    let fresh_after_first = model.storage_stats().total.fresh_blocks;
    for seed in 3..6 {
        model.predict_with(diamond_inputs(seed, 4, 16), false, &dispatcher).await.unwrap_err();
    }
    let stats = model.storage_stats();
    assert!(stats.total.reused_blocks > 0);
    assert_eq!(stats.total.free_blocks, stats.total.fresh_blocks);
    // Only the side branch may still allocate fresh, if the first failure cancelled it
    assert!(stats.total.fresh_blocks <= fresh_after_first + 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_predict_releases_core_and_blocks() {
    // Every sibling takes about FAN_OUT_WIDTH ms, so the deadline always
    // interrupts the fan-out
    let model = load(SIBLINGS);
    let dispatcher = ResourceDispatcher::new(1);

    for seed in 0..3 {
        let pending = model.predict_with(diamond_inputs(seed, 2, 8), false, &dispatcher);
        assert!(tokio::time::timeout(Duration::from_millis(20), pending).await.is_err());
        assert_eq!(dispatcher.available(), 1);
    }
    // Let sub-tasks that were already running observe the flag and finish
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stats = model.storage_stats().total;
    assert_eq!(stats.free_blocks + stats.abandoned_blocks + stats.dropped_blocks, stats.fresh_blocks);
    // Only the fan-out array and the side branch's two blocks can still be
    // referenced when a run is abandoned
    assert!(stats.abandoned_blocks <= 3 * (SIBLINGS + 2));

    let outputs = model.predict_with(diamond_inputs(9, 2, 8), false, &dispatcher).await.unwrap();
    let z = outputs["z"].to_f64_vec().unwrap();
    for (row, chunk) in z.chunks(FAN_OUT_WIDTH).enumerate() {
        assert!(chunk.iter().all(|v| *v == row as f64), "row {} was not fully written", row);
    }
    assert_eq!(dispatcher.available(), 1);
}
