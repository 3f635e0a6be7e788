//! CLI entry point for mda-acq
//!
//! Runs multi-dimensional acquisition plans against the simulated
//! microscope, or prints the event stream a plan expands into.
//!
//! # Usage
//!
//! Print the scheduled events:
//! ```bash
//! mda-acq events --plan config/plans/two_channel_stack.toml
//! ```
//!
//! Run a plan:
//! ```bash
//! mda-acq run --plan config/plans/two_channel_stack.toml --config config/mda.toml
//! ```
//!
//! Ctrl+C stops a running acquisition after its in-flight event; images
//! already captured are still delivered.

mod config;
mod logging;
mod sink;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use config::{load_plan, AppConfig};
use mda_experiment::{AcquisitionEngine, RunStatus, Scheduler};
use sink::LoggingSink;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "mda-acq")]
#[command(about = "Multi-dimensional microscope acquisition on simulated hardware", long_about = None)]
struct Cli {
    /// Configuration file (default: config/mda.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Disable coloured log output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the events a plan expands into, without touching hardware
    Events {
        /// Plan file (.toml or .json)
        #[arg(long)]
        plan: PathBuf,

        /// Stop after this many events
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Run a plan against the simulated microscope
    Run {
        /// Plan file (.toml or .json)
        #[arg(long)]
        plan: PathBuf,

        /// Log a progress line every N images
        #[arg(long, default_value = "100")]
        report_every: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .context("Failed to load configuration")?;
    config.validate().map_err(|e| anyhow!(e))?;
    let log_config = logging::LoggingConfig::from_app_config(&config)
        .map_err(|e| anyhow!(e))?
        .with_ansi(!cli.no_color);
    logging::init(log_config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Events { plan, limit } => print_events(&config, plan, limit),
        Commands::Run { plan, report_every } => run_plan(&config, plan, report_every).await,
    }
}

fn print_events(config: &AppConfig, plan_path: PathBuf, limit: Option<usize>) -> Result<()> {
    let plan = load_plan(&plan_path)?;
    let microscope = config.simulation.microscope();
    let engine = AcquisitionEngine::new(microscope.hardware(), config.engine_settings());
    let inventory = engine.inventory();
    let scheduler = Scheduler::validated(plan, &inventory, config.engine.min_trigger_firmware)?;

    println!(
        "# {} captures expected",
        scheduler.expected_capture_count()
    );
    for (index, event) in scheduler.take(limit.unwrap_or(usize::MAX)).enumerate() {
        println!("{index:>6}  {event}");
    }
    Ok(())
}

async fn run_plan(config: &AppConfig, plan_path: PathBuf, report_every: u64) -> Result<()> {
    let plan = load_plan(&plan_path)?;
    let microscope = config.simulation.microscope();
    let engine = Arc::new(AcquisitionEngine::new(
        microscope.hardware(),
        config.engine_settings(),
    ));
    let mut pipeline = config.build_pipeline()?;

    let stopper = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl+C received, stopping acquisition");
            stopper.request_stop();
        }
    });

    info!(
        app = %config.application.name,
        plan = %plan_path.display(),
        "Running plan on simulated hardware"
    );
    let summary = engine
        .run(plan, &mut pipeline, Box::new(LoggingSink::new(report_every)))
        .await
        .with_context(|| format!("Plan {} was rejected", plan_path.display()))?;

    println!("run {}", summary.run_uid);
    println!("  status:            {}", summary.status);
    println!("  events executed:   {}", summary.events_executed);
    println!("  images captured:   {}", summary.images_captured);
    println!("  images delivered:  {}", summary.images_delivered);
    println!("  images dropped:    {}", summary.images_dropped);
    println!("  captures skipped:  {}", summary.captures_skipped);
    println!("  stage warnings:    {}", summary.stage_warnings);
    println!("  elapsed:           {:.2?}", summary.duration);

    if summary.status == RunStatus::Stopped {
        warn!("Acquisition stopped before the plan completed");
    }
    summary.into_result().context("Acquisition failed")?;
    Ok(())
}
