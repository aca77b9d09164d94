use anyhow::Context;
use clap::{Parser, Subcommand};
use graphforge::logging::init_logging_default;
use graphforge::{GraphDescription, Model, ModelConfig, OperatorRegistry, Tensor, TensorData};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "graphforge-cli", version)]
#[command(about = "Load and run tensor-operator graphs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a graph on JSON inputs and print its outputs as JSON
    Run {
        /// Graph description (JSON)
        #[arg(long)]
        graph: PathBuf,
        /// Input tensors: a JSON array of {name, data_type, dims, values}
        #[arg(long)]
        inputs: PathBuf,
        /// Print a per-node profiling report to stderr
        #[arg(long)]
        profile: bool,
        /// Maximum concurrently running compute tasks (defaults to GRAPHFORGE_PARALLELISM or core count)
        #[arg(long)]
        parallelism: Option<usize>,
        /// Disable block pooling across invocations
        #[arg(long)]
        no_pool: bool,
        /// Number of invocations; outputs of the last one are printed
        #[arg(long, default_value_t = 1)]
        repeat: usize,
    },
    /// Validate a graph and list its nodes
    Inspect {
        /// Graph description (JSON)
        #[arg(long)]
        graph: PathBuf,
    },
    /// List the built-in operators and their opset versions
    Operators,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging_default();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            graph,
            inputs,
            profile,
            parallelism,
            no_pool,
            repeat,
        } => {
            let mut config = ModelConfig::from_env();
            if let Some(limit) = parallelism {
                config = config.with_parallelism_limit(limit);
            }
            if no_pool {
                config = config.with_pooling(false);
            }
            run_graph(&graph, &inputs, config, profile, repeat.max(1)).await?;
        }
        Commands::Inspect { graph } => inspect_graph(&graph)?,
        Commands::Operators => list_operators(),
    }
    Ok(())
}

fn read_inputs(path: &Path) -> anyhow::Result<HashMap<String, Tensor>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read inputs from {}", path.display()))?;
    let tensors: Vec<TensorData> =
        serde_json::from_str(&json).with_context(|| format!("malformed inputs in {}", path.display()))?;
    tensors
        .iter()
        .map(|data| {
            let tensor = data
                .to_tensor()
                .with_context(|| format!("invalid input tensor '{}'", data.name))?;
            Ok((data.name.clone(), tensor))
        })
        .collect()
}

async fn run_graph(
    graph: &Path,
    inputs: &Path,
    config: ModelConfig,
    profile: bool,
    repeat: usize,
) -> anyhow::Result<()> {
    let model = Model::load_json_file(graph, config)
        .with_context(|| format!("failed to load graph {}", graph.display()))?;
    let inputs = read_inputs(inputs)?;

    let mut outputs = HashMap::new();
    for run in 0..repeat {
        let started = Instant::now();
        outputs = model.predict(inputs.clone(), profile).await?;
        eprintln!("run {}: {:.3} ms", run + 1, started.elapsed().as_secs_f64() * 1000.0);
    }

    let mut printed = Vec::with_capacity(outputs.len());
    for name in model.output_names() {
        let tensor = outputs
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("output '{}' missing from result", name))?;
        printed.push(TensorData::from_tensor(tensor)?);
    }
    println!("{}", serde_json::to_string_pretty(&printed)?);

    if profile {
        for report in model.profiles() {
            eprintln!("{}", report);
        }
        eprintln!("{:<16} {:>6} {:>12} {:>12}", "op_type", "count", "total_ms", "mean_ms");
        for op in model.analyze_profiles() {
            eprintln!(
                "{:<16} {:>6} {:>12.3} {:>12.3}",
                op.op_type,
                op.count,
                op.total.as_secs_f64() * 1000.0,
                op.mean().as_secs_f64() * 1000.0
            );
        }
    }
    eprintln!("{}", model.storage_stats());
    model.close();
    Ok(())
}

fn inspect_graph(path: &Path) -> anyhow::Result<()> {
    let graph = GraphDescription::from_json_file(path)
        .with_context(|| format!("failed to parse graph {}", path.display()))?;
    let model = Model::load(&graph, &OperatorRegistry::with_builtin_operators(), ModelConfig::default())
        .with_context(|| format!("graph {} does not load", path.display()))?;

    println!("model:   {} ({})", model.name(), model.id());
    println!("inputs:  {}", model.input_names().join(", "));
    println!("outputs: {}", model.output_names().join(", "));
    for opset in &graph.opset_imports {
        let domain = if opset.domain.is_empty() { "ai.onnx" } else { &opset.domain };
        println!("opset:   {} v{}", domain, opset.version);
    }
    for init in &graph.initializers {
        println!("init:    {} {}{:?}", init.name, init.data_type, init.dims);
    }
    for node in &graph.nodes {
        println!(
            "node:    {:<20} {:<12} [{}] -> [{}]",
            node.name,
            node.op_type,
            node.inputs.join(", "),
            node.outputs.join(", ")
        );
    }
    model.close();
    Ok(())
}

fn list_operators() {
    for (domain, op_type, versions) in OperatorRegistry::with_builtin_operators().supported_operators() {
        let domain = if domain.is_empty() { "ai.onnx" } else { domain.as_str() };
        println!("{:<10} {:<10} {}", domain, op_type, versions);
    }
}
