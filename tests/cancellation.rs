//! Stop requests and fatal errors in the middle of a run.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sweep_daq::engine::ramp::RampPlan;
use sweep_daq::instrument::scpi::{ScpiMeter, ScpiSource, SourceLimits};
use sweep_daq::instrument::sim::{SimulatedMultimeter, SimulatedSupply};
use sweep_daq::instrument::Meter;
use sweep_daq::interlock::{AcknowledgmentGate, AutoAcknowledge};
use sweep_daq::safety::CancellationToken;
use sweep_daq::{AcquisitionController, RunOutcome};

const SECURE_SEQUENCE: [&str; 4] = ["OUTP OFF", "VOLT 0", "*CLS", "SYST:LOC"];

/// Meter that requests a stop while its `nth` reading is in flight.
struct StopOnRead {
    inner: ScpiMeter<SimulatedMultimeter>,
    token: CancellationToken,
    reads: AtomicUsize,
    nth: usize,
}

#[async_trait]
impl Meter for StopOnRead {
    async fn measure(&self) -> Result<String> {
        if self.reads.fetch_add(1, Ordering::SeqCst) + 1 == self.nth {
            self.token.cancel("operator stop");
        }
        self.inner.measure().await
    }

    async fn secure(&self) -> Result<()> {
        self.inner.secure().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Gate whose operator hits stop instead of answering.
struct StopInsteadOfConfirm {
    token: CancellationToken,
}

#[async_trait]
impl AcknowledgmentGate for StopInsteadOfConfirm {
    async fn confirm(&self, _message: &str) -> Result<()> {
        self.token.cancel("stopped at interlock");
        std::future::pending::<()>().await;
        Ok(())
    }
}

fn ramp(v1: f64, v2: f64, step: f64, hysteresis: bool) -> RampPlan {
    RampPlan {
        v1,
        v2,
        step,
        delay: Duration::from_millis(50),
        endpoint_delay: Duration::from_millis(200),
        hysteresis,
    }
}

fn source(supply: &SimulatedSupply) -> Arc<ScpiSource<SimulatedSupply>> {
    Arc::new(ScpiSource::new(supply.clone(), SourceLimits::default()))
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_sample_keeps_that_sample() {
    let supply = SimulatedSupply::new(100.0);
    let dmm = SimulatedMultimeter::new(1000.0);
    let token = CancellationToken::new();
    let meter = Arc::new(StopOnRead {
        inner: ScpiMeter::new(dmm.clone()),
        token: token.clone(),
        reads: AtomicUsize::new(0),
        nth: 3,
    });
    let controller = AcquisitionController::new(source(&supply), meter, Arc::new(AutoAcknowledge))
        .with_token(token);

    let report = controller
        .start_ramp(ramp(0.0, 1.0, 0.1, false))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        RunOutcome::Cancelled {
            reason: "operator stop".to_string()
        }
    );
    assert_eq!(report.rows.len(), 3);
    assert_eq!(dmm.read_count(), 3);

    // nothing but the secure sequence after the last sample
    let log = supply.command_log();
    let last_sample = log.iter().rposition(|c| c == "MEAS:CURR?").unwrap();
    assert_eq!(&log[last_sample + 1..], &SECURE_SEQUENCE);
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_waiting_for_acknowledgment() {
    let supply = SimulatedSupply::new(100.0);
    let dmm = SimulatedMultimeter::new(1000.0);
    let token = CancellationToken::new();
    let gate = Arc::new(StopInsteadOfConfirm {
        token: token.clone(),
    });
    let controller = AcquisitionController::new(
        source(&supply),
        Arc::new(ScpiMeter::new(dmm.clone())),
        gate,
    )
    .with_token(token);

    let report = controller
        .start_ramp(ramp(0.3, 1.0, 0.5, true))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        RunOutcome::Cancelled {
            reason: "stopped at interlock".to_string()
        }
    );
    assert_eq!(report.rows.len(), 5);

    // output never comes back on after the interlock switched it off
    let log = supply.command_log();
    let interlock_off = log.iter().position(|c| c == "OUTP OFF").unwrap();
    assert!(!log[interlock_off..].iter().any(|c| c == "OUTP ON"));
    assert_eq!(&log[interlock_off + 1..], &SECURE_SEQUENCE);
    assert_eq!(supply.secure_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_settle_ends_promptly() {
    let supply = SimulatedSupply::new(100.0);
    let dmm = SimulatedMultimeter::new(1000.0);
    let controller = AcquisitionController::new(
        source(&supply),
        Arc::new(ScpiMeter::new(dmm.clone())),
        Arc::new(AutoAcknowledge),
    );
    let plan = RampPlan {
        delay: Duration::from_secs(60),
        ..ramp(0.0, 1.0, 0.5, false)
    };

    let started = tokio::time::Instant::now();
    let handle = controller.start_ramp(plan).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    controller.stop("operator stop");
    let report = handle.wait().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(report.rows.is_empty());
    assert!(report.table.is_none());
    assert!(matches!(report.outcome, RunOutcome::Cancelled { .. }));
    assert_eq!(supply.secure_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_parse_error_aborts_and_keeps_earlier_rows() {
    let supply = SimulatedSupply::new(100.0);
    let dmm = SimulatedMultimeter::new(1000.0);
    supply.garble_on("MEAS:CURR?", 4);
    let controller = AcquisitionController::new(
        source(&supply),
        Arc::new(ScpiMeter::new(dmm.clone())),
        Arc::new(AutoAcknowledge),
    );

    let report = controller
        .start_ramp(ramp(0.0, 1.0, 0.1, false))
        .unwrap()
        .wait()
        .await
        .unwrap();

    match &report.outcome {
        RunOutcome::Failed { error } => assert!(error.contains("#GARBLED#")),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(controller.token().is_cancelled());
    assert_eq!(report.table.map(|t| t.len()), Some(3));
    assert_eq!(supply.secure_count(), 1);
    assert!(!supply.output_enabled());
    assert!(!controller.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_aborts_without_retry() {
    let supply = SimulatedSupply::new(100.0);
    let dmm = SimulatedMultimeter::new(1000.0);
    dmm.fail_on("READ?", 2);
    let controller = AcquisitionController::new(
        source(&supply),
        Arc::new(ScpiMeter::new(dmm.clone())),
        Arc::new(AutoAcknowledge),
    );

    let report = controller
        .start_ramp(ramp(0.0, 1.0, 0.1, false))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert!(report.outcome.is_failure());
    assert_eq!(report.rows.len(), 1);
    assert_eq!(dmm.read_count(), 2);
    assert_eq!(supply.secure_count(), 1);
}
