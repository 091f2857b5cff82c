//! End-to-end square-wave runs on a paused clock.

use std::sync::Arc;
use std::time::Duration;

use sweep_daq::engine::square::SquarePlan;
use sweep_daq::instrument::scpi::{ScpiMeter, ScpiSource, SourceLimits};
use sweep_daq::instrument::sim::{SimulatedMultimeter, SimulatedSupply};
use sweep_daq::interlock::AutoAcknowledge;
use sweep_daq::{AcquisitionController, RunEvent, RunOutcome};

fn setup() -> (SimulatedSupply, SimulatedMultimeter, AcquisitionController) {
    let supply = SimulatedSupply::new(100.0);
    let dmm = SimulatedMultimeter::new(500.0).coupled_to(supply.clone(), 50.0);
    let controller = AcquisitionController::new(
        Arc::new(ScpiSource::new(supply.clone(), SourceLimits::default())),
        Arc::new(ScpiMeter::new(dmm.clone())),
        Arc::new(AutoAcknowledge),
    );
    (supply, dmm, controller)
}

fn plan(cycles: u32) -> SquarePlan {
    SquarePlan {
        v1: 0.0,
        v2: 2.0,
        dwell_v1: Duration::from_millis(1000),
        dwell_v2: Duration::from_millis(500),
        cycles,
        measure_period: Duration::from_millis(300),
        initial_settle: Duration::ZERO,
    }
}

#[tokio::test(start_paused = true)]
async fn test_two_cycles_follow_the_schedule() {
    let (supply, dmm, controller) = setup();
    let mut events = controller.subscribe();

    let report = controller
        .start_square(plan(2))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);

    // samples every 300 ms until the final return to v1 at 3000 ms
    assert_eq!(report.rows.len(), 9);
    for (i, row) in report.rows.iter().enumerate() {
        let expected = 0.3 * (i + 1) as f64;
        assert!(
            (row.time_or_index - expected).abs() < 0.01,
            "row {} at {} s",
            i,
            row.time_or_index
        );
        assert_eq!(row.delay, 0.3);
    }
    let setpoints: Vec<f64> = report.rows.iter().map(|r| r.setpoint).collect();
    assert_eq!(
        setpoints,
        vec![0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 2.0]
    );
    assert_eq!(report.rows[3].voltage, 2.0);
    assert_eq!(report.rows[3].resistance, 600.0);

    // warm-up reading is taken but not recorded
    assert_eq!(dmm.read_count(), 10);

    let log = supply.command_log();
    assert_eq!(log.iter().filter(|c| c.as_str() == "VOLT 2").count(), 2);

    let mut levels = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RunEvent::Level { setpoint, cycle, .. } = event {
            levels.push((setpoint, cycle));
        }
    }
    assert_eq!(levels, vec![(2.0, 0), (0.0, 1), (2.0, 1), (0.0, 2)]);

    assert_eq!(supply.secure_count(), 1);
    assert!(!supply.output_enabled());

    let table = report.table.unwrap();
    assert_eq!(table.columns[0], "Time (s)");
    assert_eq!(table.columns[4], "Measured current (A)");
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_wave_runs_until_stopped() {
    let (supply, _dmm, controller) = setup();

    let handle = controller.start_square(plan(0)).unwrap();
    tokio::time::sleep(Duration::from_millis(10_100)).await;
    assert!(!handle.is_finished());
    handle.stop("enough");

    let report = handle.wait().await.unwrap();
    assert_eq!(
        report.outcome,
        RunOutcome::Cancelled {
            reason: "enough".to_string()
        }
    );
    // 300 ms period over 10.1 s
    assert_eq!(report.rows.len(), 33);
    assert_eq!(supply.secure_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_initial_settle_delays_the_clock() {
    let (_supply, _dmm, controller) = setup();
    let started = tokio::time::Instant::now();

    let report = controller
        .start_square(SquarePlan {
            initial_settle: Duration::from_secs(2),
            ..plan(1)
        })
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    // times are relative to the end of the settle period
    assert!((report.rows[0].time_or_index - 0.3).abs() < 0.01);
    assert!(started.elapsed() >= Duration::from_millis(3500));
}
