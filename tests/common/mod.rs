//! Shared fixtures for integration tests
//!
//! Graph builders, deterministic inputs and a plain-loop reference for the
//! graphs the tests run.

#![allow(dead_code)]

pub mod operators;

use graphforge::{DataType, GraphDescription, NodeDescription, Tensor, TensorData};
use std::collections::HashMap;
use std::path::PathBuf;

/// Deterministic pseudo-random values in `[-1, 1)`
pub fn values(seed: u64, len: usize) -> Vec<f32> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
        })
        .collect()
}

/// `y = Relu(x) + MatMul(x, w)`: two independent branches joined by `Add`
pub fn diamond_graph(cols: usize) -> GraphDescription {
    let weights: Vec<f64> = values(7, cols * cols).into_iter().map(f64::from).collect();
    GraphDescription::new("diamond")
        .with_opset("", 13)
        .with_input("x")
        .with_output("y")
        .with_initializer(TensorData::new("w", DataType::Float32, &[cols, cols], weights))
        .with_node(NodeDescription::new("relu", "Relu", &["x"], &["a"]))
        .with_node(NodeDescription::new("project", "MatMul", &["x", "w"], &["b"]))
        .with_node(NodeDescription::new("join", "Add", &["a", "b"], &["y"]))
}

pub fn diamond_inputs(seed: u64, rows: usize, cols: usize) -> HashMap<String, Tensor> {
    let x = Tensor::from_vec("x", &[rows, cols], values(seed, rows * cols)).expect("input tensor");
    HashMap::from([("x".to_string(), x)])
}

/// Plain-loop evaluation of [`diamond_graph`]
pub fn diamond_reference(seed: u64, rows: usize, cols: usize) -> Vec<f32> {
    let x = values(seed, rows * cols);
    let w = values(7, cols * cols);
    let mut y = vec![0.0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            let dot: f32 = (0..cols).map(|k| x[r * cols + k] * w[k * cols + c]).sum();
            y[r * cols + c] = x[r * cols + c].max(0.0) + dot;
        }
    }
    y
}

pub fn assert_close(actual: &[f64], expected: &[f32], tolerance: f64) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - f64::from(*e)).abs() <= tolerance,
            "element {}: got {}, expected {}",
            i,
            a,
            e
        );
    }
}

/// Write `graph` as JSON into a fresh temp dir
pub fn write_graph_file(graph: &GraphDescription) -> anyhow::Result<(tempfile::TempDir, PathBuf)> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join(format!("{}.json", graph.name));
    std::fs::write(&path, graph.to_json_pretty()?)?;
    Ok((dir, path))
}
