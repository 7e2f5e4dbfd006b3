//! pipeline-lambda - main entry point
//!
//! - `build`: partition a dependency tree into layer archives
//! - `survey`: print per-unit sizes of a dependency tree
//! - `verify`: check a published build against the ceilings
//! - `serve`: answer invocations on stdin/stdout

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipeline_lambda::build::{self, manifest::Manifest, Assignment, BuildPlan, EstimatorChoice, PruneRules, Strategy};
use pipeline_lambda::runtime::{self, Dispatcher};
use pipeline_lambda::{AppConfig, Ceilings};

#[derive(Parser, Debug)]
#[command(name = "pipeline-lambda", version, about = "Layer packaging and invocation dispatch for pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Partition a dependency tree into layer archives
    Build(BuildArgs),
    /// Print the size of every top-level unit of a dependency tree
    Survey(SurveyArgs),
    /// Check a published build against the ceilings
    Verify(VerifyArgs),
    /// Answer length-prefixed invocation frames on stdin/stdout
    Serve,
}

#[derive(Args, Debug)]
struct CeilingArgs {
    /// Uncompressed bytes allowed per layer
    #[arg(long)]
    max_uncompressed: Option<u64>,

    /// Compressed bytes allowed per layer
    #[arg(long)]
    max_compressed: Option<u64>,

    /// Number of layers allowed
    #[arg(long)]
    max_layers: Option<usize>,
}

impl CeilingArgs {
    fn apply(&self, mut ceilings: Ceilings) -> Ceilings {
        if let Some(max) = self.max_uncompressed {
            ceilings.max_uncompressed_layer = max;
        }
        if let Some(max) = self.max_compressed {
            ceilings.max_compressed_layer = max;
        }
        if let Some(max) = self.max_layers {
            ceilings.max_layers = max;
        }
        ceilings
    }
}

#[derive(Args, Debug)]
struct PruneArgs {
    /// Extra file or directory name to drop inside units
    #[arg(long = "prune", value_name = "NAME")]
    prune: Vec<String>,

    /// Keep bytecode caches
    #[arg(long)]
    no_default_prune: bool,
}

impl PruneArgs {
    fn rules(&self) -> PruneRules {
        let base = if self.no_default_prune {
            PruneRules::none()
        } else {
            PruneRules::python_defaults()
        };
        self.prune.iter().fold(base, |rules, name| rules.with_name(name.clone()))
    }
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Materialized dependency tree
    source: PathBuf,

    /// Output directory, replaced atomically on success
    #[arg(short, long, default_value = "dist")]
    output: PathBuf,

    #[command(flatten)]
    ceilings: CeilingArgs,

    #[command(flatten)]
    prune: PruneArgs,

    /// Estimate compressed sizes with a fixed ratio instead of deflating each unit
    #[arg(long)]
    ratio: Option<f64>,

    /// Packing strategy: sealing or first-fit
    #[arg(long, default_value_t = Strategy::Sealing)]
    strategy: Strategy,

    /// File placed at the root of layer 0
    #[arg(long = "entry", value_name = "FILE")]
    entry: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct SurveyArgs {
    /// Materialized dependency tree
    source: PathBuf,

    #[command(flatten)]
    prune: PruneArgs,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// Published build directory
    #[arg(default_value = "dist")]
    output: PathBuf,

    #[command(flatten)]
    ceilings: CeilingArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries frames in serve mode, so logs always go to stderr
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,pipeline_lambda=debug".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();
    tracing::debug!("Configuration loaded: {:?}", config);

    match cli.command {
        Command::Build(args) => run_build(args, &config),
        Command::Survey(args) => run_survey(args),
        Command::Verify(args) => run_verify(args, &config),
        Command::Serve => run_serve(&config).await,
    }
}

fn run_build(args: BuildArgs, config: &AppConfig) -> Result<()> {
    let mut plan = BuildPlan::new(&args.source, &args.output);
    plan.ceilings = args.ceilings.apply(config.ceilings);
    plan.rules = args.prune.rules();
    plan.strategy = args.strategy;
    plan.entry_files = args.entry;
    plan.estimator = match args.ratio {
        Some(ratio) => EstimatorChoice::Ratio(ratio),
        None => EstimatorChoice::Deflate,
    };

    let report = build::run(&plan)
        .with_context(|| format!("Layer build of {} failed", args.source.display()))?;

    print!("{}", report.manifest.render_layers());
    Ok(())
}

fn run_survey(args: SurveyArgs) -> Result<()> {
    let survey = build::survey(&args.source, &args.prune.rules())
        .with_context(|| format!("Failed to survey {}", args.source.display()))?;

    print!("{}", Manifest::new(&survey, &Assignment::default()).render_sizes());
    println!("{}\ttotal", survey.total_bytes());
    Ok(())
}

fn run_verify(args: VerifyArgs, config: &AppConfig) -> Result<()> {
    let ceilings = args.ceilings.apply(config.ceilings);
    let manifest = build::verify(&args.output, &ceilings)?;

    tracing::info!(layers = manifest.layers.len(), units = manifest.unit_sizes.len(), "Build verified");
    Ok(())
}

async fn run_serve(config: &AppConfig) -> Result<()> {
    tracing::info!(engine = %config.engine, "Starting serve loop");
    let dispatcher = Dispatcher::from_config(config);
    runtime::serve(&dispatcher, std::io::stdin(), std::io::stdout()).await?;
    Ok(())
}
