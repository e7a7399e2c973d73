mod check;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _};
use clap::{CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::config::WeftConfig;
use weft_core::graph::{GraphDocument, SeedInput};
use weft_core::types::ContextId;
use weft_engine::{DataFlow, Orchestrator};
use weft_ops::OperationRegistry;

#[derive(Parser)]
#[command(name = "weft", version, about = "Dataflow orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml", env = "WEFT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a graph over one or more contexts
    Run {
        /// Graph document (.json or .toml)
        #[arg(short, long)]
        graph: PathBuf,
        /// Definitions to report per context (added to the graph's output_spec)
        #[arg(short, long)]
        output: Vec<String>,
        #[command(subcommand)]
        mode: RunMode,
    },
    /// Check a graph document without running it
    Validate {
        /// Graph document (.json or .toml)
        #[arg(short, long)]
        graph: PathBuf,
    },
    /// List registered operations
    Operations,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum RunMode {
    /// One ad hoc context
    Single {
        /// Context id (generated if not given)
        #[arg(long)]
        context: Option<String>,
        /// Seed input as DEFINITION=VALUE (VALUE is JSON, or a bare string)
        #[arg(short, long = "seed")]
        seeds: Vec<String>,
    },
    /// An explicit list of contexts, plus the contexts the graph seeds itself
    Contexts {
        /// Context ids
        ids: Vec<String>,
        /// Seed input added to every listed context, as DEFINITION=VALUE
        #[arg(short, long = "seed")]
        seeds: Vec<String>,
    },
    /// One context per record of a JSON array of objects
    Records {
        /// Records file
        #[arg(short, long)]
        file: PathBuf,
        /// Record field holding the context id (defaults to the record index)
        #[arg(long)]
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weft", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        WeftConfig::load(&cli.config)?
    } else {
        WeftConfig::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let registry = OperationRegistry::with_builtins();

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Operations => {
            for op in registry.operations() {
                let inputs: Vec<String> = op
                    .inputs
                    .iter()
                    .map(|(param, def)| format!("{}: {}", param, def))
                    .collect();
                let outputs: Vec<String> = op
                    .outputs
                    .iter()
                    .map(|(name, def)| format!("{}: {}", name, def))
                    .collect();
                println!(
                    "  {:<18} ({}) -> ({})",
                    op.name,
                    inputs.join(", "),
                    outputs.join(", ")
                );
            }
        }
        Commands::Validate { graph } => {
            println!("Weft Validate");
            println!("=============");
            let issues = check::run_checks(&graph, &registry, &config);
            if issues > 0 {
                bail!("{} issue(s) found in {}", issues, graph.display());
            }
        }
        Commands::Run {
            graph,
            output,
            mode,
        } => {
            let document = GraphDocument::load(&graph)?;
            let mut flow = DataFlow::resolve(&document, &registry)?;
            if !output.is_empty() {
                let mut spec = flow.output_spec().to_vec();
                spec.extend(output);
                flow = flow.with_output_spec(spec);
            }
            let contexts = contexts_for(&flow, mode)?;
            run(config, flow, contexts).await?;
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

/// Contexts and their extra seeds for a run mode.
fn contexts_for(flow: &DataFlow, mode: RunMode) -> anyhow::Result<Vec<(ContextId, Vec<SeedInput>)>> {
    match mode {
        RunMode::Single { context, seeds } => {
            let context = context.map(ContextId::from).unwrap_or_else(ContextId::generate);
            Ok(vec![(context, parse_seeds(&seeds)?)])
        }
        RunMode::Contexts { ids, seeds } => {
            let seeds = parse_seeds(&seeds)?;
            let mut contexts: Vec<(ContextId, Vec<SeedInput>)> = ids
                .into_iter()
                .map(|id| (ContextId::from(id), seeds.clone()))
                .collect();
            for (context, _) in flow.seeded_contexts() {
                if !contexts.iter().any(|(c, _)| c == &context) {
                    contexts.push((context, vec![]));
                }
            }
            if contexts.is_empty() {
                bail!("no contexts given and the graph seeds none");
            }
            Ok(contexts)
        }
        RunMode::Records { file, key } => read_records(flow, &file, key.as_deref()),
    }
}

/// Parse `DEFINITION=VALUE` pairs. Values that are not valid JSON are
/// taken as strings.
fn parse_seeds(raw: &[String]) -> anyhow::Result<Vec<SeedInput>> {
    raw.iter()
        .map(|pair| -> anyhow::Result<SeedInput> {
            let Some((definition, value)) = pair.split_once('=') else {
                bail!("seed '{}' is not DEFINITION=VALUE", pair);
            };
            let value = serde_json::from_str(value).unwrap_or_else(|_| Value::from(value));
            Ok(SeedInput::new(definition.trim(), value))
        })
        .collect()
}

/// Each record becomes a context. Fields naming a known definition become
/// seeds of that context; the rest are ignored.
fn read_records(
    flow: &DataFlow,
    path: &Path,
    key: Option<&str>,
) -> anyhow::Result<Vec<(ContextId, Vec<SeedInput>)>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading records from {}", path.display()))?;
    let records: Vec<BTreeMap<String, Value>> = serde_json::from_str(&content)
        .with_context(|| format!("{} must hold a JSON array of objects", path.display()))?;

    let mut contexts = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        let context = match key.and_then(|k| record.get(k)) {
            Some(Value::String(id)) => ContextId::from(id.as_str()),
            Some(other) => ContextId::from(other.to_string()),
            None => ContextId::from(format!("record-{}", index)),
        };
        let mut seeds = Vec::new();
        for (field, value) in record {
            if flow.definitions().contains(&field) {
                seeds.push(SeedInput::new(field, value));
            } else if key != Some(field.as_str()) {
                warn!(context = %context, field = %field, "Ignoring record field with no definition");
            }
        }
        contexts.push((context, seeds));
    }
    info!(records = contexts.len(), path = %path.display(), "Loaded records");
    Ok(contexts)
}

/// Stream outcomes as JSON lines. Failed contexts are reported on stderr
/// as well; a fatal error ends the run with a non-zero exit.
async fn run(
    config: WeftConfig,
    flow: DataFlow,
    contexts: Vec<(ContextId, Vec<SeedInput>)>,
) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::new(config.orchestrator);
    let cancel = orchestrator.cancel_token();
    let mut handle = orchestrator.run(flow, contexts)?;

    let mut completed = 0usize;
    let mut failed = 0usize;
    loop {
        let next = tokio::select! {
            next = handle.next() => next,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling run");
                cancel.cancel();
                continue;
            }
        };
        let Some(outcome) = next else { break };
        let outcome = outcome?;
        if outcome.is_success() {
            completed += 1;
        } else {
            failed += 1;
            eprintln!("context {} did not complete: {:?}", outcome.context, outcome.status);
        }
        println!("{}", serde_json::to_string(&outcome)?);
    }
    info!(completed, failed, "Run finished");
    Ok(())
}
