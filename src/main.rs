//! Command-line front end for the characterization bench.
//!
//! ```bash
//! demod_char check
//! demod_char measure --export --reveal
//! demod_char expected --table expected.csv
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use demod_char::config::{AppConfig, DEFAULT_CONFIG_PATH, DEFAULT_DEVICE};
use demod_char::logging;
use demod_char::measurement::expected::derive_expected;
use demod_char::measurement::{
    InstrumentController, MeasureEvent, MeasureWorker, TaskCompletion, TaskKind, TaskOutcome,
};

#[derive(Parser)]
#[command(name = "demod_char")]
#[command(about = "RF demodulator characterization bench", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover the instruments and check the device
    Check {
        #[arg(long, default_value = DEFAULT_DEVICE)]
        device: String,
    },

    /// Run a characterization sweep
    Measure {
        #[arg(long, default_value = DEFAULT_DEVICE)]
        device: String,

        /// Export the result table when the sweep completes
        #[arg(long)]
        export: bool,

        /// Open the export directory afterwards
        #[arg(long, requires = "export")]
        reveal: bool,

        /// Do not print the per-point report
        #[arg(long, short)]
        quiet: bool,
    },

    /// Derive one row of the expected-value table
    Expected {
        /// Source table; defaults to the configured one
        #[arg(long)]
        table: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config)?;
    info!(config = %cli.config.display(), backend = ?config.backend.kind, "Configuration loaded");

    match cli.command {
        Commands::Check { device } => check(config, &device).await,
        Commands::Measure {
            device,
            export,
            reveal,
            quiet,
        } => measure(config, &device, export, reveal, quiet).await,
        Commands::Expected { table } => expected(&config, table),
    }
}

async fn connect(config: AppConfig) -> Result<Arc<InstrumentController>> {
    let controller = Arc::new(InstrumentController::new(config)?);
    let connected = controller.connect().await;

    for (role, status) in controller.status() {
        println!("  {role:<14} {status}");
    }
    connected?;
    Ok(controller)
}

async fn next_completion(
    completions: &mut mpsc::UnboundedReceiver<TaskCompletion>,
) -> Result<TaskCompletion> {
    completions
        .recv()
        .await
        .ok_or_else(|| anyhow!("worker stopped without reporting"))
}

async fn check(config: AppConfig, device: &str) -> Result<()> {
    let controller = connect(config).await?;
    let (worker, mut completions) = MeasureWorker::new(controller);

    worker.start(TaskKind::Check, device)?;
    match next_completion(&mut completions).await?.outcome {
        TaskOutcome::Completed => {
            println!("Device '{device}' ready");
            Ok(())
        }
        other => bail!("Check failed: {other:?}"),
    }
}

async fn measure(
    config: AppConfig,
    device: &str,
    export: bool,
    reveal: bool,
    quiet: bool,
) -> Result<()> {
    let controller = connect(config).await?;
    let (worker, mut completions) = MeasureWorker::new(Arc::clone(&controller));

    worker.start(TaskKind::Check, device)?;
    let checked = next_completion(&mut completions).await?;
    if !checked.outcome.is_success() {
        bail!("Check failed: {:?}", checked.outcome);
    }

    let params = controller.secondary_params();
    println!(
        "LO {}..{} GHz step {}, {} RF offsets",
        params.f_lo_min,
        params.f_lo_max,
        params.f_lo_delta,
        controller.offsets().len()
    );

    let mut events = controller.subscribe();
    worker.start(TaskKind::Measure, device)?;
    println!("Measuring '{device}', Ctrl-C to stop after the current point");

    let completion = loop {
        tokio::select! {
            biased;
            Ok(MeasureEvent::PointReady { index, total }) = events.recv() => {
                if !quiet {
                    let report = controller.result().read().report();
                    println!("\n[{}/{}]\n{}", index + 1, total, report);
                }
            }
            Some(done) = completions.recv() => break done,
            _ = tokio::signal::ctrl_c() => {
                if worker.cancel() {
                    println!("\nCancelling, instruments will be switched off");
                }
            }
        }
    };

    finish_measurement(&controller, completion.outcome, export, reveal)
}

/// Report the outcome, export on success, then persist the parameters.
///
/// The parameters are saved even when the measurement or the export failed;
/// the first error is returned after that.
fn finish_measurement(
    controller: &InstrumentController,
    outcome: TaskOutcome,
    export: bool,
    reveal: bool,
) -> Result<()> {
    let outcome = match outcome {
        TaskOutcome::Completed => summarize(controller, export, reveal),
        TaskOutcome::Cancelled => {
            println!("Measurement cancelled");
            Ok(())
        }
        TaskOutcome::Failed(reason) => Err(anyhow!("Measurement failed: {reason}")),
    };

    let saved = controller.save_configs();
    outcome?;
    saved.context("Failed to save sweep parameters")
}

fn summarize(controller: &InstrumentController, export: bool, reveal: bool) -> Result<()> {
    let result = controller.result();
    let result = result.read();
    for curve in result.curves() {
        println!("LO {} GHz: {} points", curve.label, curve.points.len());
    }
    if export {
        let dir = &controller.config().paths.export_dir;
        let path = result.export_table(dir)?;
        println!("Exported {}", path.display());
        if reveal {
            if let Err(e) = opener::open(dir) {
                warn!(error = %e, "Could not open export directory");
            }
        }
    }
    Ok(())
}

fn expected(config: &AppConfig, table: Option<PathBuf>) -> Result<()> {
    let Some(path) = table.or_else(|| config.paths.expected_table.clone()) else {
        bail!("No expected-value table configured");
    };
    match derive_expected(&path, &mut rand::thread_rng())? {
        Some(row) => {
            for (name, value) in row {
                println!("{name}: {value}");
            }
            Ok(())
        }
        None => bail!("{} not found", path.display()),
    }
}
