//! CLI entry point for sweep-daq
//!
//! Runs one acquisition with parameters from `config/sweep.toml`, overridable
//! on the command line, and exports the resulting table.
//!
//! # Usage
//!
//! Ramp with hysteresis loop on simulated instruments:
//! ```bash
//! sweep-daq --simulate ramp --v1 0.5 --v2 2 --step 0.1 --hysteresis
//! ```
//!
//! Square wave, three cycles, exported to a chosen file:
//! ```bash
//! sweep-daq square --v1 0 --v2 5 --cycles 3 --output data/square.csv
//! ```
//!
//! Ctrl-C stops the run; instruments are secured and collected rows exported.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{error, info, warn};

use sweep_daq::config::SweepConfig;
use sweep_daq::export::{self, ExportFormat};
use sweep_daq::instrument::registry::InstrumentRegistry;
use sweep_daq::interlock::{AcknowledgmentGate, AutoAcknowledge, StdinAcknowledge};
use sweep_daq::parser::ResponseParser;
use sweep_daq::{logging, AcquisitionController, RunEvent, RunOutcome};

/// How long shutdown waits for blocking tasks, e.g. an unanswered
/// acknowledgment prompt still reading stdin after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "sweep-daq")]
#[command(about = "Voltage ramp and square-wave acquisition", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = sweep_daq::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Export file (default: timestamped file in the configured output directory)
    #[arg(long, short, global = true)]
    output: Option<PathBuf>,

    /// Use simulated instruments whatever the configuration says
    #[arg(long, global = true)]
    simulate: bool,

    /// Confirm polarity reversals without prompting
    #[arg(long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Step through a voltage ramp, one sample per setpoint
    Ramp {
        /// Start voltage (V)
        #[arg(long, allow_hyphen_values = true)]
        v1: Option<f64>,
        /// End voltage (V)
        #[arg(long, allow_hyphen_values = true)]
        v2: Option<f64>,
        /// Step magnitude (V)
        #[arg(long)]
        step: Option<f64>,
        /// Settle delay at normal points (s)
        #[arg(long)]
        delay: Option<f64>,
        /// Settle delay at endpoints (s)
        #[arg(long)]
        endpoint_delay: Option<f64>,
        /// Sweep v1→v2→v1→−v2→v1
        #[arg(long)]
        hysteresis: bool,
    },

    /// Alternate two levels on a timer with periodic sampling
    Square {
        /// First level (V)
        #[arg(long, allow_hyphen_values = true)]
        v1: Option<f64>,
        /// Second level (V)
        #[arg(long, allow_hyphen_values = true)]
        v2: Option<f64>,
        /// Time at v1 (s)
        #[arg(long)]
        dwell_v1: Option<f64>,
        /// Time at v2 (s)
        #[arg(long)]
        dwell_v2: Option<f64>,
        /// Full cycles, 0 = until Ctrl-C
        #[arg(long)]
        cycles: Option<u32>,
        /// Sampling period (s)
        #[arg(long)]
        period: Option<f64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = build_runtime()?;
    let result = runtime.block_on(run(cli));
    shutdown(runtime);
    result
}

fn build_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")
}

/// Stop the runtime without waiting on blocking reads that never return.
fn shutdown(runtime: Runtime) {
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = SweepConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    apply_overrides(&mut config, &cli);
    config.validate().map_err(anyhow::Error::msg)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    info!(config = %cli.config.display(), source = %config.source.driver, meter = %config.meter.driver, "sweep-daq starting");

    let registry = InstrumentRegistry::with_builtin_drivers();
    let source = registry.build_source(&config.source).await?;
    let meter = registry.build_meter(&config.meter).await?;

    let gate: Arc<dyn AcknowledgmentGate> = if config.application.auto_acknowledge {
        Arc::new(AutoAcknowledge)
    } else {
        Arc::new(StdinAcknowledge)
    };
    let controller = AcquisitionController::new(source, meter, gate).with_parser(
        ResponseParser::new(config.format.instrument_decimal_separator),
    );

    let mut events = controller.subscribe();
    let display = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RunEvent::Row { row, .. } => info!(
                    t = row.time_or_index,
                    setpoint = row.setpoint,
                    voltage = row.voltage,
                    current = row.current,
                    resistance = row.resistance,
                    "sample"
                ),
                RunEvent::Interlock { from, to, .. } => {
                    warn!(from, to, "Output OFF: reverse the source connections")
                }
                RunEvent::Level { setpoint, cycle, .. } => info!(setpoint, cycle, "level"),
                RunEvent::Finished { .. } => break,
                RunEvent::Started { .. } => {}
            }
        }
    });

    let handle = match &cli.command {
        Commands::Ramp { .. } => controller.start_ramp(config.ramp.plan())?,
        Commands::Square { .. } => controller.start_square(config.square.plan())?,
    };

    let stopper = controller.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping run");
            stopper.cancel("interrupted by user");
        }
    });

    let report = handle.wait().await?;
    let _ = display.await;

    match &report.outcome {
        RunOutcome::Completed => info!(rows = report.rows.len(), "Run completed"),
        RunOutcome::Cancelled { reason } => warn!(%reason, rows = report.rows.len(), "Run stopped"),
        RunOutcome::Failed { error } => error!(%error, rows = report.rows.len(), "Run failed"),
    }

    match &report.table {
        Some(table) => {
            let path = cli.output.clone().unwrap_or_else(|| {
                config
                    .application
                    .output_dir
                    .join(export::default_file_name(report.mode, report.started_at))
            });
            export::export_to_path(table, &ExportFormat::from(&config.format), &path)?;
            println!("{}", path.display());
        }
        None => warn!("No consistent data recorded, nothing exported"),
    }

    controller.shutdown().await?;

    if let RunOutcome::Failed { error } = report.outcome {
        anyhow::bail!("run failed: {}", error);
    }
    Ok(())
}

fn apply_overrides(config: &mut SweepConfig, cli: &Cli) {
    if cli.simulate {
        config.source.driver = "simulated".to_string();
        config.meter.driver = "simulated".to_string();
    }
    if cli.yes {
        config.application.auto_acknowledge = true;
    }

    match &cli.command {
        Commands::Ramp {
            v1,
            v2,
            step,
            delay,
            endpoint_delay,
            hysteresis,
        } => {
            let ramp = &mut config.ramp;
            ramp.v1 = v1.unwrap_or(ramp.v1);
            ramp.v2 = v2.unwrap_or(ramp.v2);
            ramp.step = step.unwrap_or(ramp.step);
            ramp.delay_s = delay.unwrap_or(ramp.delay_s);
            ramp.endpoint_delay_s = endpoint_delay.unwrap_or(ramp.endpoint_delay_s);
            ramp.hysteresis |= *hysteresis;
        }
        Commands::Square {
            v1,
            v2,
            dwell_v1,
            dwell_v2,
            cycles,
            period,
        } => {
            let square = &mut config.square;
            square.v1 = v1.unwrap_or(square.v1);
            square.v2 = v2.unwrap_or(square.v2);
            square.dwell_v1_s = dwell_v1.unwrap_or(square.dwell_v1_s);
            square.dwell_v2_s = dwell_v2.unwrap_or(square.dwell_v2_s);
            square.cycles = cycles.unwrap_or(square.cycles);
            square.measure_period_s = period.unwrap_or(square.measure_period_s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_shutdown_does_not_wait_for_pending_blocking_read() {
        let runtime = build_runtime().unwrap();
        let (unblock, blocked) = std::sync::mpsc::channel::<()>();
        runtime.block_on(async {
            // stands in for a prompt nobody answers
            tokio::task::spawn_blocking(move || blocked.recv().ok());
        });

        let started = Instant::now();
        shutdown(runtime);
        assert!(started.elapsed() < SHUTDOWN_GRACE + Duration::from_secs(2));
        drop(unblock);
    }

    #[test]
    fn test_overrides_apply_to_selected_mode() {
        let cli = Cli::parse_from([
            "sweep-daq", "--simulate", "--yes", "ramp", "--v1", "-0.5", "--step", "0.25",
        ]);
        let mut config = SweepConfig::default();
        apply_overrides(&mut config, &cli);

        assert_eq!(config.source.driver, "simulated");
        assert_eq!(config.meter.driver, "simulated");
        assert!(config.application.auto_acknowledge);
        assert_eq!(config.ramp.v1, -0.5);
        assert_eq!(config.ramp.step, 0.25);
    }
}
