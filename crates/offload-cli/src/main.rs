use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use miette::{Context, IntoDiagnostic};

use offload_coreml::{
    ExecutionProvider, PrecisionPolicy, ProviderOptions, TypeRestrictions, TypeSet,
};
use offload_graph::DataType;

/// offload: partition an ONNX model and emit CoreML models for its offloadable subgraphs
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Input ONNX file
    input: PathBuf,

    /// Directory for the emitted .mlmodel files
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Weight precision: keep or float16
    #[arg(long, default_value = "keep", value_parser = parse_precision)]
    precision: PrecisionPolicy,

    /// Smallest subgraph worth offloading
    #[arg(long, default_value_t = 1)]
    min_subgraph_nodes: usize,

    /// Restrict every operator to these element types (repeatable)
    #[arg(long = "allow-type", value_parser = parse_data_type)]
    allow_types: Vec<DataType>,

    /// Build subgraphs on separate threads
    #[arg(long)]
    parallel: bool,

    /// Print the partition without building models
    #[arg(long)]
    dry_run: bool,

    /// Log level for diagnostics on stderr
    #[arg(long, default_value = "warn")]
    log_level: log::LevelFilter,
}

fn parse_precision(s: &str) -> Result<PrecisionPolicy, String> {
    match s {
        "keep" => Ok(PrecisionPolicy::Keep),
        "float16" | "f16" => Ok(PrecisionPolicy::Float16),
        _ => Err(format!("invalid precision '{s}', expected keep or float16")),
    }
}

fn parse_data_type(s: &str) -> Result<DataType, String> {
    DataType::ALL
        .into_iter()
        .find(|t| t.name() == s)
        .ok_or_else(|| format!("unknown element type '{s}'"))
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level)
        .parse_env("OFFLOAD_LOG")
        .init();

    let bytes = std::fs::read(&cli.input)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", cli.input.display()))?;
    let graph = offload_graph::onnx::import(&bytes)
        .map_err(|e| miette::miette!("{e}"))
        .wrap_err("ONNX import failed")?;

    let mut type_restrictions = TypeRestrictions::default();
    if !cli.allow_types.is_empty() {
        let allowed: TypeSet = cli.allow_types.iter().copied().collect();
        type_restrictions = type_restrictions.allow_globally(allowed);
    }
    let provider = ExecutionProvider::new(ProviderOptions {
        precision: cli.precision,
        min_subgraph_nodes: cli.min_subgraph_nodes,
        type_restrictions,
        ..ProviderOptions::default()
    });

    let partition = provider
        .get_capability(&graph)
        .map_err(|e| miette::miette!("{e}"))
        .wrap_err("partitioning failed")?;

    println!(
        "{} of {} nodes offloaded in {} subgraph(s)",
        partition.offloaded_node_count(),
        graph.node_count(),
        partition.subgraphs.len()
    );
    for s in &partition.subgraphs {
        let names = |values: &[offload_graph::ValueId]| {
            values
                .iter()
                .map(|&v| graph.value_name(v))
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!(
            "  subgraph {}: {} node(s), inputs [{}], outputs [{}]",
            s.index,
            s.len(),
            names(&s.inputs),
            names(&s.outputs)
        );
    }
    if !partition.rejected.is_empty() {
        println!("{} node(s) stay on the fallback path:", partition.rejected.len());
        for (op_type, count) in partition.rejected_summary(provider.registry()) {
            println!("  {op_type}: {count}");
        }
        for rejected in &partition.rejected {
            log::info!("{rejected}");
        }
    }

    if cli.dry_run {
        return Ok(());
    }

    let results = if cli.parallel {
        provider.compile_parallel(&graph, &partition)
    } else {
        provider.compile(&graph, &partition)
    };

    std::fs::create_dir_all(&cli.output_dir)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to create {}", cli.output_dir.display()))?;
    let stem = cli
        .input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".into());

    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(model) => {
                let path = cli
                    .output_dir
                    .join(format!("{stem}_subgraph_{index}.mlmodel"));
                std::fs::write(&path, model.encode())
                    .into_diagnostic()
                    .wrap_err_with(|| format!("failed to write {}", path.display()))?;
                println!(
                    "wrote {} ({})",
                    path.display(),
                    model.layer_types().join(", ")
                );
            }
            Err(e) => eprintln!("subgraph {index} not built, falling back: {e}"),
        }
    }

    Ok(())
}
