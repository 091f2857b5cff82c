//! Run control.
//!
//! The `AcquisitionController` owns the Source/Meter pair and a single run slot.
//! Starting a run validates the plan and builds its sequence synchronously, so
//! bad parameters are reported before any task is spawned or any instrument is
//! touched. The run itself executes on its own tokio task; the caller keeps a
//! [`RunHandle`] and may subscribe to [`RunEvent`]s.
//!
//! # Example
//!
//! ```rust,ignore
//! let controller = AcquisitionController::new(source, meter, Arc::new(AutoAcknowledge));
//! let mut events = controller.subscribe();
//!
//! let handle = controller.start_ramp(plan)?;
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//! });
//!
//! let report = handle.wait().await?;
//! ```

use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::ramp::{RampEngine, RampPlan};
use crate::engine::square::{SquarePlan, SquareWaveEngine};
use crate::engine::{self, AcquisitionEngine, RunContext, RunEvent, RunReport};
use crate::error::{AppResult, SweepError};
use crate::instrument::{Meter, Source};
use crate::interlock::{AcknowledgmentGate, Interlock};
use crate::parser::ResponseParser;
use crate::safety::{CancellationToken, PanicGuard};

/// Capacity of the event channel. Slow subscribers lag rather than block.
const EVENT_CAPACITY: usize = 1024;

/// Id of the run holding the instruments, `None` when idle.
type RunSlot = Arc<Mutex<Option<Uuid>>>;

/// Handle on a spawned run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    token: CancellationToken,
    slot: RunSlot,
    join: JoinHandle<RunReport>,
}

impl RunHandle {
    /// Identifier of the run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Request a stop. The run ends at its next suspension point.
    ///
    /// Ignored once this run has released the instruments, so a handle kept
    /// around never stops a later run.
    pub fn stop(&self, reason: impl Into<String>) {
        let Ok(active) = self.slot.lock() else {
            return;
        };
        if *active == Some(self.run_id) {
            self.token.cancel(reason);
        } else {
            debug!(run_id = %self.run_id, "Run already ended, stop ignored");
        }
    }

    /// Whether the task has ended.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to end.
    pub async fn wait(self) -> AppResult<RunReport> {
        self.join
            .await
            .map_err(|e| SweepError::TaskFailed(e.to_string()))
    }
}

/// Owns the instrument pair and serializes runs against it.
pub struct AcquisitionController {
    source: Arc<dyn Source>,
    meter: Arc<dyn Meter>,
    interlock: Interlock,
    parser: ResponseParser,
    token: CancellationToken,
    events: broadcast::Sender<RunEvent>,
    slot: RunSlot,
}

impl AcquisitionController {
    /// Controller confirming polarity reversals through `gate`.
    pub fn new(
        source: Arc<dyn Source>,
        meter: Arc<dyn Meter>,
        gate: Arc<dyn AcknowledgmentGate>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            source,
            meter,
            interlock: Interlock::new(gate),
            parser: ResponseParser::default(),
            token: CancellationToken::new(),
            events,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Parse instrument replies with `parser`.
    pub fn with_parser(mut self, parser: ResponseParser) -> Self {
        self.parser = parser;
        self
    }

    /// Use an externally owned token, e.g. one shared with a stop button.
    ///
    /// The token is reset at the start of every run.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Subscribe to events of current and future runs.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Token shared with every run of this controller.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether a run currently owns the instruments.
    pub fn is_running(&self) -> bool {
        self.slot.lock().map(|active| active.is_some()).unwrap_or(true)
    }

    /// Request a stop of the active run, if any.
    pub fn stop(&self, reason: impl Into<String>) {
        if self.is_running() {
            self.token.cancel(reason);
        }
    }

    /// Start a ramp run.
    ///
    /// # Errors
    ///
    /// `InvalidRange`, `InvalidStep` or `InvalidParameter` for a bad plan,
    /// `RunInProgress` if another run is active.
    pub fn start_ramp(&self, plan: RampPlan) -> AppResult<RunHandle> {
        let engine = RampEngine::new(plan, self.interlock.clone())?;
        info!(
            v1 = plan.v1,
            v2 = plan.v2,
            step = plan.step,
            hysteresis = plan.hysteresis,
            points = engine.sequence().len(),
            "Starting ramp"
        );
        self.spawn(engine)
    }

    /// Start a square-wave run.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for a bad plan, `RunInProgress` if another run is
    /// active.
    pub fn start_square(&self, plan: SquarePlan) -> AppResult<RunHandle> {
        let engine = SquareWaveEngine::new(plan)?;
        info!(
            v1 = plan.v1,
            v2 = plan.v2,
            cycles = plan.cycles,
            "Starting square wave"
        );
        self.spawn(engine)
    }

    fn spawn<E>(&self, engine: E) -> AppResult<RunHandle>
    where
        E: AcquisitionEngine + 'static,
    {
        // token reset and run id publication happen under the slot lock, so a
        // stale RunHandle::stop sees either the old run or the new one
        let mut active = self
            .slot
            .lock()
            .map_err(|_| SweepError::TaskFailed("run slot poisoned".into()))?;
        if active.is_some() {
            return Err(SweepError::RunInProgress);
        }

        self.token.reset();
        let mode = engine.mode();
        let ctx = RunContext::new(
            mode,
            self.source.clone(),
            self.meter.clone(),
            self.parser,
            self.token.clone(),
            self.events.clone(),
        );
        let run_id = ctx.run_id();
        *active = Some(run_id);
        drop(active);

        let slot = self.slot.clone();
        let release = PanicGuard::named("run slot", move || {
            if let Ok(mut active) = slot.lock() {
                *active = None;
            }
        });
        let token = self.token.clone();

        let join = tokio::spawn(async move {
            let _release = release;
            // engine::run contains engine panics; this covers securing and
            // finalizing, which run outside that boundary
            let unwinding = token.guard(format!("{} run", mode));
            let report = engine::run(&engine, ctx).await;
            unwinding.dismiss();
            report
        });

        Ok(RunHandle {
            run_id,
            token: self.token.clone(),
            slot: self.slot.clone(),
            join,
        })
    }

    /// Close both instruments.
    ///
    /// Refused while a run is active. Both instruments are closed even if the
    /// first close fails; the first error is returned.
    pub async fn shutdown(&self) -> AppResult<()> {
        if self.is_running() {
            return Err(SweepError::RunInProgress);
        }

        let source = self.source.close().await;
        let meter = self.meter.close().await;
        if let Err(e) = &source {
            warn!(error = %format!("{:#}", e), "Failed to close source");
        }
        if let Err(e) = &meter {
            warn!(error = %format!("{:#}", e), "Failed to close meter");
        }
        source.and(meter).map_err(SweepError::transport)?;

        info!("Instruments closed");
        Ok(())
    }
}
