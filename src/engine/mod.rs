//! Acquisition engines.
//!
//! An engine drives the source through an excitation profile and records one
//! [`MeasurementRow`] per sample into the run's [`Dataset`]. Two variants exist:
//!
//! - [`ramp::RampEngine`]: walks a materialized setpoint sequence, handing
//!   polarity reversals to the [`Interlock`](crate::interlock::Interlock)
//! - [`square::SquareWaveEngine`]: alternates two levels on a timing state
//!   machine with periodic sampling
//!
//! [`run`] is the single top-level handler shared by both. It executes the
//! engine body, converts every way it can end (completion, stop request, fatal
//! error, panic) into a [`RunOutcome`], secures the instruments exactly once
//! and finalizes the dataset.
//!
//! # State Machine
//!
//! ```text
//! Started ──► acquire ──┬─ Ok ──────────────► Completed ─┐
//!                       ├─ Err(Cancelled) ──► Cancelled ─┼─► secure ─► finalize ─► Finished
//!                       ├─ Err(fatal) ──────► Failed ────┤
//!                       └─ panic ───────────► Failed ────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Local};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dataset::{AcquisitionMode, Dataset, MeasurementRow, Table};
use crate::error::{AppResult, SweepError};
use crate::instrument::{commands, Meter, Source};
use crate::parser::ResponseParser;
use crate::safety::CancellationToken;

pub mod ramp;
pub mod square;

/// Notifications published while a run executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunEvent {
    /// The engine task started.
    Started {
        /// Run identifier
        run_id: Uuid,
        /// Acquisition mode
        mode: AcquisitionMode,
    },
    /// A row was recorded.
    Row {
        /// Run identifier
        run_id: Uuid,
        /// The recorded sample
        row: MeasurementRow,
    },
    /// Output switched off, waiting for the operator to reverse the leads.
    Interlock {
        /// Run identifier
        run_id: Uuid,
        /// Setpoint before the reversal (V)
        from: f64,
        /// Setpoint after the reversal (V)
        to: f64,
    },
    /// Square wave switched level.
    Level {
        /// Run identifier
        run_id: Uuid,
        /// New level (V)
        setpoint: f64,
        /// Completed cycles so far
        cycle: u32,
    },
    /// Instruments are secured and the dataset finalized.
    Finished {
        /// Run identifier
        run_id: Uuid,
        /// How the run ended
        outcome: RunOutcome,
    },
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// Profile executed to the end.
    Completed,
    /// Stopped on request.
    Cancelled {
        /// Reason given with the stop request
        reason: String,
    },
    /// Aborted by an instrument or parse failure, or a panic.
    Failed {
        /// Error description
        error: String,
    },
}

impl RunOutcome {
    /// Whether the run ended because of an error.
    pub fn is_failure(&self) -> bool {
        matches!(self, RunOutcome::Failed { .. })
    }
}

/// Everything a finished run hands back.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Run identifier
    pub run_id: Uuid,
    /// Acquisition mode
    pub mode: AcquisitionMode,
    /// How the run ended
    pub outcome: RunOutcome,
    /// Local time the run started
    pub started_at: DateTime<Local>,
    /// Every complete row, in acquisition order
    pub rows: Vec<MeasurementRow>,
    /// Export table, absent if nothing consistent was recorded
    pub table: Option<Table>,
}

/// One parsed source + meter sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Source voltage reading (V)
    pub voltage: f64,
    /// Source current reading (A)
    pub current: f64,
    /// Meter reading (Ohm)
    pub resistance: f64,
}

/// Instruments and channels available to an engine during one run.
pub struct RunContext {
    run_id: Uuid,
    source: Arc<dyn Source>,
    meter: Arc<dyn Meter>,
    parser: ResponseParser,
    token: CancellationToken,
    events: broadcast::Sender<RunEvent>,
    dataset: Dataset,
}

impl RunContext {
    /// Assemble the context for a new run.
    pub fn new(
        mode: AcquisitionMode,
        source: Arc<dyn Source>,
        meter: Arc<dyn Meter>,
        parser: ResponseParser,
        token: CancellationToken,
        events: broadcast::Sender<RunEvent>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source,
            meter,
            parser,
            token,
            events,
            dataset: Dataset::new(mode),
        }
    }

    /// Identifier of this run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Token shared with the controller.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The source.
    pub fn source(&self) -> &dyn Source {
        self.source.as_ref()
    }

    /// Rows recorded so far.
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Publish an event. Having no subscriber is fine.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.events.send(event);
    }

    fn stopped(&self) -> SweepError {
        SweepError::Cancelled(
            self.token
                .reason()
                .unwrap_or_else(|| "stop requested".to_string()),
        )
    }

    /// Fail with `Cancelled` if a stop was requested.
    pub fn check(&self) -> AppResult<()> {
        if self.token.is_cancelled() {
            Err(self.stopped())
        } else {
            Ok(())
        }
    }

    /// Wait `duration`, ending early with `Cancelled` on a stop request.
    pub async fn settle(&self, duration: Duration) -> AppResult<()> {
        if self.token.sleep(duration).await {
            Ok(())
        } else {
            Err(self.stopped())
        }
    }

    /// Wait until `deadline`, ending early with `Cancelled` on a stop request.
    pub async fn settle_until(&self, deadline: tokio::time::Instant) -> AppResult<()> {
        if self.token.sleep_until(deadline).await {
            Ok(())
        } else {
            Err(self.stopped())
        }
    }

    /// Send a command to the source.
    pub async fn write(&self, command: &str) -> AppResult<()> {
        debug!(run_id = %self.run_id, command, "source <-");
        self.source
            .write(command)
            .await
            .map_err(SweepError::transport)
    }

    /// Query source voltage and current, then take a meter reading.
    ///
    /// The three round-trips form one unit: a stop request arriving meanwhile
    /// is seen by the caller's next check, not in between.
    pub async fn sample(&self) -> AppResult<Sample> {
        let raw_voltage = self
            .source
            .query(commands::MEASURE_VOLTAGE)
            .await
            .map_err(SweepError::transport)?;
        let raw_current = self
            .source
            .query(commands::MEASURE_CURRENT)
            .await
            .map_err(SweepError::transport)?;
        let raw_resistance = self.meter.measure().await.map_err(SweepError::transport)?;

        Ok(Sample {
            voltage: self.parser.parse(&raw_voltage)?,
            current: self.parser.parse(&raw_current)?,
            resistance: self.parser.parse(&raw_resistance)?,
        })
    }

    /// Append `row` to the dataset and publish it.
    pub fn record(&mut self, row: MeasurementRow) {
        debug!(
            run_id = %self.run_id,
            index = self.dataset.len(),
            setpoint = row.setpoint,
            voltage = row.voltage,
            current = row.current,
            resistance = row.resistance,
            "row"
        );
        self.dataset.append(row);
        self.emit(RunEvent::Row {
            run_id: self.run_id,
            row,
        });
    }
}

/// One acquisition profile.
#[async_trait]
pub trait AcquisitionEngine: Send + Sync {
    /// Mode recorded in the dataset and the report.
    fn mode(&self) -> AcquisitionMode;

    /// Drive the instruments and record rows.
    ///
    /// Returns `Err(SweepError::Cancelled)` when stopped on request. Securing
    /// is not the engine's job; [`run`] does it on every exit path.
    async fn acquire(&self, ctx: &mut RunContext) -> AppResult<()>;
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Execute `engine` to the end, then secure the instruments and finalize.
///
/// Instruments are secured exactly once whatever happens inside the engine,
/// source first, then meter. Securing failures are logged, never retried.
pub async fn run<E>(engine: &E, mut ctx: RunContext) -> RunReport
where
    E: AcquisitionEngine + ?Sized,
{
    let started_at = Local::now();
    let run_id = ctx.run_id;
    let mode = engine.mode();

    info!(%run_id, %mode, "Run started");
    ctx.emit(RunEvent::Started { run_id, mode });

    let result = AssertUnwindSafe(engine.acquire(&mut ctx))
        .catch_unwind()
        .await;

    let outcome = match result {
        Ok(Ok(())) => RunOutcome::Completed,
        Ok(Err(SweepError::Cancelled(reason))) => {
            info!(%run_id, %reason, "Run stopped");
            RunOutcome::Cancelled { reason }
        }
        Ok(Err(e)) => {
            error!(%run_id, error = %e, fatal = e.is_fatal(), "Run aborted");
            ctx.token.cancel(e.to_string());
            RunOutcome::Failed {
                error: e.to_string(),
            }
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(%run_id, panic = %message, "Engine panicked");
            ctx.token.cancel(format!("Panic in: {} engine", mode));
            RunOutcome::Failed {
                error: format!("engine panicked: {}", message),
            }
        }
    };

    secure(&ctx).await;

    let rows = ctx.dataset.snapshot();
    let table = ctx.dataset.finalize();
    if table.is_none() && !rows.is_empty() {
        warn!(%run_id, "Dataset channels are inconsistent, nothing to export");
    }

    info!(%run_id, ?outcome, rows = rows.len(), "Run finished");
    ctx.emit(RunEvent::Finished {
        run_id,
        outcome: outcome.clone(),
    });

    RunReport {
        run_id,
        mode,
        outcome,
        started_at,
        rows,
        table,
    }
}

async fn secure(ctx: &RunContext) {
    if let Err(e) = ctx.source.secure().await {
        warn!(run_id = %ctx.run_id, error = %format!("{:#}", e), "Failed to secure source");
    }
    if let Err(e) = ctx.meter.secure().await {
        warn!(run_id = %ctx.run_id, error = %format!("{:#}", e), "Failed to secure meter");
    }
}
