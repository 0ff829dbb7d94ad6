//! CLI Entry Point for spectrum_daq
//!
//! Provides command-line interface for:
//! - IQ block capture to a delimited text file
//! - Real-time sweep capture (peak and max-hold per frame)
//! - Device diagnostics
//!
//! # Usage
//!
//! ```bash
//! spectrum_daq iq --samples 10000 --output iq.csv
//! spectrum_daq realtime --duration 10s
//! spectrum_daq --log-format json info
//! ```
//!
//! Ctrl-C stops a capture gracefully: buffered records are still written and
//! the exit code is 0.

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use spectrum_daq::acquisition::{cancellation, CaptureBudget, SessionController};
use spectrum_daq::config::{CaptureMode, Settings};
use spectrum_daq::data::storage::timestamped_path;
use spectrum_daq::hardware::{DeviceSession, MockAnalyzer};
use spectrum_daq::logging::{self, OutputFormat};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "spectrum_daq", version)]
#[command(about = "Capture IQ samples or real-time sweeps from a USB spectrum analyzer", long_about = None)]
struct Cli {
    /// Configuration file (default: config/spectrum_daq.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format override
    #[arg(long, global = true, value_enum)]
    log_format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture IQ samples
    Iq {
        /// Number of IQ samples to capture
        #[arg(long, conflicts_with = "duration", required_unless_present = "duration")]
        samples: Option<u64>,

        #[command(flatten)]
        capture: CaptureArgs,
    },

    /// Capture real-time spectrum frames
    Realtime {
        /// Number of frames to capture
        #[arg(long, conflicts_with = "duration", required_unless_present = "duration")]
        frames: Option<u64>,

        #[command(flatten)]
        capture: CaptureArgs,
    },

    /// Print analyzer diagnostics (model, serial, temperature, voltage)
    Info,
}

#[derive(Args)]
struct CaptureArgs {
    /// Capture for a wall-clock duration instead (e.g. "30s", "2m")
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    duration: Option<Duration>,

    /// Output file; must not exist (default: timestamped name in storage.output_dir)
    #[arg(long, short)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = logging::init_from_settings(&settings) {
        eprintln!("warning: {e}");
    }

    match run(cli.command, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "spectrum_daq failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings =
        Settings::load_from(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(level) = &cli.log_level {
        settings.application.log_level = level.clone();
    }
    if let Some(format) = cli.log_format {
        settings.application.log_format = format;
    }
    Ok(settings)
}

async fn run(command: Commands, mut settings: Settings) -> Result<()> {
    let (mode, count, capture) = match command {
        Commands::Info => return print_device_info().await,
        Commands::Iq { samples, capture } => (CaptureMode::Iq, samples, capture),
        Commands::Realtime { frames, capture } => (CaptureMode::RealTime, frames, capture),
    };

    settings.acquisition.mode = mode;
    settings.validate()?;

    let budget = match (count, capture.duration) {
        (Some(n), _) => CaptureBudget::Samples(n),
        (None, Some(d)) => CaptureBudget::Duration(d),
        (None, None) => anyhow::bail!("either a record count or --duration is required"),
    };
    let output = capture.output.unwrap_or_else(|| {
        timestamped_path(&settings.storage.output_dir, mode, chrono::Local::now())
    });

    tracing::info!("No vendor driver linked; using the simulated analyzer");
    let controller = SessionController::new(Arc::new(MockAnalyzer::new()), &settings);

    let (cancel, token) = cancellation();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = controller.run(budget, &output, token).await;
    ctrl_c.abort();

    let report = result.with_context(|| format!("capture to '{}' failed", output.display()))?;
    println!(
        "Wrote {} rows to {} in {:.2?}",
        report.rows_written,
        report.path.display(),
        report.elapsed
    );
    if report.dropped > 0 {
        println!("Dropped {} records (ring buffer overflow)", report.dropped);
    }
    if report.timeouts > 0 {
        println!("{} pull timeouts", report.timeouts);
    }
    Ok(())
}

async fn print_device_info() -> Result<()> {
    let mut session = DeviceSession::open(Arc::new(MockAnalyzer::new())).await?;
    let info = session.device_info().await?;
    session.close()?;

    println!("API Version: {}", info.api_version);
    println!("Device Type: {}", info.model);
    println!("Serial Number: {}", info.serial_number);
    println!("Internal Temperature: {:.2} C", info.temperature_c);
    println!("USB Voltage: {:.2} V", info.voltage_v);
    Ok(())
}
