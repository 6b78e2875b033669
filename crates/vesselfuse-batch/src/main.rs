//! vesselfuse-batch: compute enhanced and base STAPLE consensus masks
//! for every case of a manifest.
//!
//! # Usage
//!
//! ```text
//! vesselfuse-batch run [OPTIONS] <MANIFEST>
//! vesselfuse-batch verify <MANIFEST>
//! ```
//!
//! Logging is controlled with `RUST_LOG` (default `vesselfuse=info`).

#![allow(clippy::print_stdout)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vesselfuse_batch::{BatchMetrics, Manifest, RunOptions, StdClock, run_batch};
use vesselfuse_pipeline::{ForegroundPrior, InitialWeights, PipelineConfig, StapleConfig};

/// STAPLE consensus fusion of binary vessel segmentations.
#[derive(Parser)]
#[command(name = "vesselfuse-batch", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fuse every case of a manifest.
    Run(RunArgs),
    /// List cases whose enhanced output is missing.
    Verify {
        /// Path to the case manifest (JSON).
        manifest: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Path to the case manifest (JSON).
    manifest: PathBuf,

    /// Fixed probability threshold, and the adaptive fallback.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_CONFIDENCE_THRESHOLD)]
    confidence_threshold: f64,

    /// Skip gap-bridging of rater masks in the enhanced run.
    #[arg(long)]
    no_preprocessing: bool,

    /// Use the fixed threshold in the enhanced run.
    #[arg(long)]
    no_adaptive_thresholding: bool,

    /// Skip vessel connectivity enhancement in the enhanced run.
    #[arg(long)]
    no_vessel_enhancement: bool,

    /// Gap-bridging structuring element radius in voxels.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_PREPROCESS_RADIUS)]
    preprocess_radius: usize,

    /// STAPLE iteration cap.
    #[arg(long, default_value_t = StapleConfig::DEFAULT_MAX_ITERATIONS, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    max_iterations: usize,

    /// STAPLE convergence tolerance on sensitivity and specificity.
    #[arg(long, default_value_t = StapleConfig::DEFAULT_TOLERANCE)]
    tolerance: f64,

    /// Foreground prior strategy.
    #[arg(long, value_enum, default_value_t = Prior::RaterMean)]
    prior: Prior,

    /// Initial foreground weights.
    #[arg(long, value_enum, default_value_t = Init::VoteFraction)]
    initial_weights: Init,

    /// Full pipeline config as a JSON string.
    ///
    /// When provided, all other pipeline parameter flags are ignored.
    /// The JSON must be a valid `PipelineConfig` serialization.
    #[arg(long)]
    config_json: Option<String>,

    /// Recompute cases whose outputs already exist.
    #[arg(long)]
    force_recompute: bool,

    /// Worker threads (default: available parallelism).
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    jobs: Option<usize>,

    /// Write JSON batch metrics to this file.
    #[arg(long)]
    metrics: Option<PathBuf>,

    /// Write a middle-slice PNG per case into this directory.
    #[arg(long)]
    preview_dir: Option<PathBuf>,

    /// Report per-rater gap distributions in the metrics.
    #[arg(long)]
    analyze_gaps: bool,

    /// Print the stage timing report of every computed case.
    #[arg(long)]
    report: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Prior {
    /// Mean foreground fraction of the raters, held fixed.
    RaterMean,
    /// 0.5, held fixed.
    Uniform,
    /// Re-estimated from the weights every iteration.
    Reestimate,
}

#[derive(Clone, Copy, ValueEnum)]
enum Init {
    /// Fraction of raters marking each voxel.
    VoteFraction,
    /// The prior everywhere.
    Uniform,
}

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// `--config-json` wins over the individual flags.
fn config_from_cli(args: &RunArgs) -> Result<PipelineConfig> {
    if let Some(ref json) = args.config_json {
        return serde_json::from_str(json).context("parsing --config-json");
    }

    Ok(PipelineConfig {
        confidence_threshold: args.confidence_threshold,
        do_preprocessing: !args.no_preprocessing,
        do_adaptive_thresholding: !args.no_adaptive_thresholding,
        do_vessel_enhancement: !args.no_vessel_enhancement,
        preprocess_radius: args.preprocess_radius,
        staple: StapleConfig {
            max_iterations: args.max_iterations,
            tolerance: args.tolerance,
            foreground_prior: match args.prior {
                Prior::RaterMean => ForegroundPrior::RaterMean,
                Prior::Uniform => ForegroundPrior::Uniform,
                Prior::Reestimate => ForegroundPrior::Reestimate,
            },
            initial_weights: match args.initial_weights {
                Init::VoteFraction => InitialWeights::VoteFraction,
                Init::Uniform => InitialWeights::Uniform,
            },
        },
    })
}

fn run(args: &RunArgs) -> Result<ExitCode> {
    let config = config_from_cli(args)?;
    config.validate().context("invalid pipeline configuration")?;
    let manifest = Manifest::load(&args.manifest)
        .with_context(|| format!("loading manifest {}", args.manifest.display()))?;

    let jobs = args.jobs.unwrap_or_else(|| {
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    });
    let options = RunOptions {
        config: config.clone(),
        force_recompute: args.force_recompute,
        preview_dir: args.preview_dir.clone(),
        analyze_gaps: args.analyze_gaps,
    };

    let reports = run_batch(&manifest.cases, &options, &StdClock, jobs)?;
    if args.report {
        for case in &reports {
            let variants = [("enhanced", &case.enhanced), ("base", &case.base)];
            for (variant, diagnostics) in variants {
                if let Some(diagnostics) = diagnostics {
                    println!("{} ({variant})\n{}", case.id, diagnostics.report());
                }
            }
        }
    }
    let metrics = BatchMetrics::new(reports, config, chrono::Utc::now());
    info!(
        total = metrics.total_cases,
        succeeded = metrics.succeeded,
        skipped = metrics.skipped,
        failed = metrics.failed,
        success_rate = format_args!("{:.1}%", metrics.success_rate),
        "batch finished"
    );

    if let Some(path) = &args.metrics {
        metrics
            .write(path)
            .with_context(|| format!("writing metrics to {}", path.display()))?;
        info!(path = %path.display(), "metrics written");
    }

    Ok(if metrics.failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn verify(manifest_path: &Path) -> Result<ExitCode> {
    let manifest = Manifest::load(manifest_path)
        .with_context(|| format!("loading manifest {}", manifest_path.display()))?;
    let missing = manifest.missing_enhanced_outputs();
    for case in &missing {
        println!("{}\t{}", case.id, case.enhanced_output.display());
    }
    if missing.is_empty() {
        info!(cases = manifest.cases.len(), "all enhanced outputs present");
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(missing = missing.len(), cases = manifest.cases.len(), "enhanced outputs missing");
        Ok(ExitCode::FAILURE)
    }
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vesselfuse=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().command {
        Command::Run(args) => run(&args),
        Command::Verify { manifest } => verify(&manifest),
    }
}
