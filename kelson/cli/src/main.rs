#![deny(clippy::all, clippy::pedantic, clippy::nursery, rust_2018_idioms)]

//! `kelson`: project scaffolding and model training from the command line.

mod dashboard;

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kelson_core::{
    generate_model_file, parse_overrides, scaffold_project, Bootstrap, CancellationToken,
    ConfigTree, Orchestrator, RunResult, TrainingError,
};
use kelson_events::JsonLinesEventSink;
use kelson_logging::JsonLogger;
use tokio::runtime::Runtime;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::dashboard::ConsoleDashboard;

const EXIT_FAILED: u8 = 1;
const EXIT_SETUP: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "kelson", version, about = "Kelson machine learning framework")]
struct Cli {
    /// Print debug diagnostics to stderr.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Creates a new Kelson project.
    New {
        name: String,
        /// Directory the project is created in.
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
    /// Generates a model skeleton inside a project.
    #[command(name = "make:model")]
    MakeModel {
        /// CamelCase model name, e.g. IrisClassifier.
        name: String,
        /// Project root.
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
    /// Trains a model through load_data, transform, build and fit.
    Train(TrainArgs),
    /// Lists the bindings the project configuration produces.
    Bindings {
        #[arg(long, default_value = "config")]
        config_dir: PathBuf,
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Parser, Debug)]
struct TrainArgs {
    /// Registered model name, e.g. LinearRegression.
    model: String,
    /// Hyperparameter override, repeatable.
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,
    /// Append lifecycle events to this JSONL file.
    #[arg(long)]
    event_log: Option<PathBuf>,
    /// Append structured run logs to this JSONL file.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Hide the live dashboard.
    #[arg(long)]
    quiet: bool,
    /// Print the run result as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.verbose) {
        eprintln!("warning: {err}");
    }
    match dispatch(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_SETUP)
        }
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn dispatch(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::New { name, path } => {
            let root = scaffold_project(&path, &name)?;
            println!("Created project {name} at {}", root.display());
            println!("  cd {}", root.display());
            println!("  kelson train LinearRegression");
            Ok(ExitCode::SUCCESS)
        }
        Commands::MakeModel { name, project } => {
            let file = generate_model_file(&project, &name)?;
            println!("Created model {name} at {}", file.display());
            println!("  cargo run -- {name}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Train(args) => train(&args),
        Commands::Bindings { config_dir, json } => {
            bindings(&config_dir, json)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn train(args: &TrainArgs) -> Result<ExitCode> {
    let config = ConfigTree::load_dir(&args.config_dir)?;
    let overrides = parse_overrides(&args.params)?;

    let mut bootstrap = Bootstrap::new(config);
    if !args.quiet && !args.json {
        bootstrap = bootstrap.observe(Arc::new(ConsoleDashboard::stdout()));
    }
    if let Some(path) = &args.event_log {
        let sink = JsonLinesEventSink::new(path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        bootstrap = bootstrap.observe(Arc::new(sink));
    }
    let container = bootstrap.build()?;

    let mut orchestrator = Orchestrator::new(container)?;
    if let Some(path) = &args.log_file {
        let logger =
            JsonLogger::new(path).with_context(|| format!("opening log file {}", path.display()))?;
        orchestrator = orchestrator.with_logger(logger)?;
    }

    let cancel = CancellationToken::new();
    let runtime = Runtime::new().context("starting signal runtime")?;
    let watcher = cancel.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            watcher.cancel();
        }
    });

    let outcome = orchestrator.run(&args.model, &overrides, &cancel);
    runtime.shutdown_background();

    match outcome {
        Ok(result) => {
            report(&result, args.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(TrainingError::Setup(err)) => Err(err.into()),
        Err(TrainingError::Cancelled { run_id, stage }) => {
            eprintln!("run {run_id} cancelled during `{stage}`");
            Ok(ExitCode::from(EXIT_CANCELLED))
        }
        Err(TrainingError::TrainingFailed {
            stage,
            kind,
            message,
            ..
        }) => {
            eprintln!("training failed during `{stage}`: {kind}: {message}");
            Ok(ExitCode::from(EXIT_FAILED))
        }
        Err(err @ TrainingError::InvalidTransition { .. }) => {
            eprintln!("error: {err}");
            Ok(ExitCode::from(EXIT_FAILED))
        }
    }
}

fn report(result: &RunResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    let elapsed = result.finished_at - result.started_at;
    println!(
        "{} {} in {} ms (run {})",
        result.model,
        result.status,
        elapsed.num_milliseconds(),
        result.run_id
    );
    for (name, value) in &result.metrics_summary.fit {
        println!("  {name}: {value}");
    }
    Ok(())
}

fn bindings(config_dir: &Path, json: bool) -> Result<()> {
    let config = ConfigTree::load_dir(config_dir)?;
    let container = Bootstrap::new(config).build()?;
    let descriptors = container.bindings();
    if json {
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
        return Ok(());
    }
    for descriptor in descriptors {
        let dependencies = if descriptor.dependencies.is_empty() {
            "-".to_owned()
        } else {
            descriptor.dependencies.join(", ")
        };
        println!(
            "{:<28} {:<18} {:<10} {:?} <- {dependencies}",
            descriptor.capability,
            descriptor.implementation.as_deref().unwrap_or("custom"),
            descriptor.contract.to_string(),
            descriptor.lifecycle,
        );
    }
    Ok(())
}
