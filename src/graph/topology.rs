//! Load-time validation and dependency analysis

use super::description::GraphDescription;
use crate::error::{ForgeResult, GraphForgeError};
use std::collections::{HashMap, HashSet, VecDeque};

/// Dependency structure of a validated graph
#[derive(Debug, Clone, Default)]
pub struct GraphTopology {
    /// Node indices in a valid execution order
    pub order: Vec<usize>,
    /// For each node, the nodes that consume one of its outputs
    pub dependents: Vec<Vec<usize>>,
    /// For each node, the number of distinct nodes it waits on
    pub dependency_counts: Vec<usize>,
    /// For each value, how many node input slots read it
    pub consumer_counts: HashMap<String, usize>,
    /// Producing node of every node output
    pub producers: HashMap<String, usize>,
}

impl GraphTopology {
    /// Validate `graph` and compute its dependency structure.
    ///
    /// Every value must be defined exactly once (graph input, initializer or
    /// node output), every node input and graph output must be defined, and
    /// the graph must be acyclic.
    pub fn build(graph: &GraphDescription) -> ForgeResult<Self> {
        let mut defined: HashSet<&str> = HashSet::new();
        for name in graph.inputs.iter().chain(graph.initializers.iter().map(|i| &i.name)) {
            if name.is_empty() || !defined.insert(name) {
                return Err(GraphForgeError::InvalidGraph(format!(
                    "value '{}' is defined more than once",
                    name
                )));
            }
        }

        let mut producers = HashMap::new();
        for (index, node) in graph.nodes.iter().enumerate() {
            for output in node.outputs.iter().filter(|o| !o.is_empty()) {
                if !defined.insert(output) {
                    return Err(GraphForgeError::InvalidGraph(format!(
                        "value '{}' produced by node '{}' is already defined",
                        output, node.name
                    )));
                }
                producers.insert(output.clone(), index);
            }
        }

        let node_count = graph.nodes.len();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); node_count];
        let mut dependency_counts = vec![0; node_count];
        let mut consumer_counts: HashMap<String, usize> = HashMap::new();

        for (index, node) in graph.nodes.iter().enumerate() {
            let mut waits_on = HashSet::new();
            for input in node.inputs.iter().filter(|i| !i.is_empty()) {
                if !defined.contains(input.as_str()) {
                    return Err(GraphForgeError::InvalidGraph(format!(
                        "node '{}' reads undefined value '{}'",
                        node.name, input
                    )));
                }
                *consumer_counts.entry(input.clone()).or_insert(0) += 1;
                if let Some(&producer) = producers.get(input) {
                    if waits_on.insert(producer) {
                        dependents[producer].push(index);
                    }
                }
            }
            dependency_counts[index] = waits_on.len();
        }

        for output in &graph.outputs {
            if !defined.contains(output.as_str()) {
                return Err(GraphForgeError::InvalidGraph(format!(
                    "graph output '{}' is never produced",
                    output
                )));
            }
        }

        // Kahn's algorithm
        let mut remaining = dependency_counts.clone();
        let mut queue: VecDeque<usize> = (0..node_count).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(node_count);
        while let Some(index) = queue.pop_front() {
            order.push(index);
            for &dependent in &dependents[index] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }
        if order.len() != node_count {
            let stuck: Vec<&str> = (0..node_count)
                .filter(|&i| remaining[i] > 0)
                .map(|i| graph.nodes[i].name.as_str())
                .collect();
            return Err(GraphForgeError::InvalidGraph(format!(
                "graph contains a cycle through {:?}",
                stuck
            )));
        }

        Ok(GraphTopology {
            order,
            dependents,
            dependency_counts,
            consumer_counts,
            producers,
        })
    }

    /// Nodes that can start as soon as the graph inputs are bound
    pub fn roots(&self) -> impl Iterator<Item = usize> + '_ {
        self.order
            .iter()
            .copied()
            .filter(|&i| self.dependency_counts[i] == 0)
    }
}
