//! Time-driven acquisition (square wave).
//!
//! The source alternates between `v1` and `v2` while the meter is sampled at a
//! fixed period. Both schedules are absolute offsets from the start instant:
//! a level change is due at `next_toggle`, which is advanced by the new level's
//! dwell time, and a sample at `next_sample`, advanced by the period. Neither
//! is re-based on the current time, so slow instrument round-trips do not
//! stretch the waveform.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{AcquisitionEngine, RunContext, RunEvent};
use crate::dataset::{AcquisitionMode, MeasurementRow};
use crate::error::{AppResult, SweepError};
use crate::instrument::commands;

/// Parameters of a square-wave run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SquarePlan {
    /// First level (V), applied at start
    pub v1: f64,
    /// Second level (V)
    pub v2: f64,
    /// Time spent at v1
    pub dwell_v1: Duration,
    /// Time spent at v2
    pub dwell_v2: Duration,
    /// Full v1→v2→v1 periods to run, 0 = until stopped
    pub cycles: u32,
    /// Sampling period
    pub measure_period: Duration,
    /// Wait after enabling the output, before the clock starts
    pub initial_settle: Duration,
}

impl Default for SquarePlan {
    fn default() -> Self {
        Self {
            v1: 0.0,
            v2: 1.0,
            dwell_v1: Duration::from_secs(5),
            dwell_v2: Duration::from_secs(5),
            cycles: 1,
            measure_period: Duration::from_millis(500),
            initial_settle: Duration::from_secs(2),
        }
    }
}

impl SquarePlan {
    /// Reject plans that cannot be scheduled.
    pub fn validate(&self) -> AppResult<()> {
        if !self.v1.is_finite() || !self.v2.is_finite() {
            return Err(SweepError::InvalidParameter(format!(
                "levels must be finite (v1 = {}, v2 = {})",
                self.v1, self.v2
            )));
        }
        for (name, value) in [
            ("dwell_v1", self.dwell_v1),
            ("dwell_v2", self.dwell_v2),
            ("measure_period", self.measure_period),
        ] {
            if value.is_zero() {
                return Err(SweepError::InvalidParameter(format!(
                    "{} must be positive",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    V1,
    V2,
}

/// Timing state machine, all instants relative to the start of the waveform.
#[derive(Debug)]
struct Schedule {
    level: Level,
    next_toggle: Duration,
    next_sample: Duration,
    cycles: u32,
}

impl Schedule {
    fn new(plan: &SquarePlan) -> Self {
        Self {
            level: Level::V1,
            next_toggle: plan.dwell_v1,
            next_sample: plan.measure_period,
            cycles: 0,
        }
    }

    /// Flip the level. The new level's dwell extends the toggle deadline and a
    /// full cycle is counted on the way back to v1.
    fn toggle(&mut self, plan: &SquarePlan) {
        match self.level {
            Level::V1 => {
                self.level = Level::V2;
                self.next_toggle += plan.dwell_v2;
            }
            Level::V2 => {
                self.level = Level::V1;
                self.next_toggle += plan.dwell_v1;
                self.cycles += 1;
            }
        }
    }

    /// Re-arm the sample deadline past `now`, skipping missed periods.
    fn rearm_sample(&mut self, period: Duration, now: Duration) {
        self.next_sample += period;
        while self.next_sample <= now {
            self.next_sample += period;
        }
    }

    fn next_wake(&self) -> Duration {
        self.next_toggle.min(self.next_sample)
    }

    fn done(&self, plan: &SquarePlan) -> bool {
        plan.cycles > 0 && self.cycles >= plan.cycles
    }
}

/// Executes a [`SquarePlan`].
pub struct SquareWaveEngine {
    plan: SquarePlan,
}

impl SquareWaveEngine {
    /// Validate `plan`.
    pub fn new(plan: SquarePlan) -> AppResult<Self> {
        plan.validate()?;
        Ok(Self { plan })
    }

    /// The plan this engine executes.
    pub fn plan(&self) -> &SquarePlan {
        &self.plan
    }

    fn volts(&self, level: Level) -> f64 {
        match level {
            Level::V1 => self.plan.v1,
            Level::V2 => self.plan.v2,
        }
    }
}

#[async_trait]
impl AcquisitionEngine for SquareWaveEngine {
    fn mode(&self) -> AcquisitionMode {
        AcquisitionMode::SquareWave
    }

    async fn acquire(&self, ctx: &mut RunContext) -> AppResult<()> {
        let plan = &self.plan;

        ctx.source()
            .initialize()
            .await
            .map_err(SweepError::transport)?;
        ctx.write(&commands::set_voltage(plan.v1)).await?;
        ctx.write(commands::OUTPUT_ON).await?;
        ctx.settle(plan.initial_settle).await?;

        // first reading after enabling the output is discarded
        let warmup = ctx.sample().await?;
        debug!(run_id = %ctx.run_id(), voltage = warmup.voltage, "Warm-up sample");

        info!(
            run_id = %ctx.run_id(),
            v1 = plan.v1,
            v2 = plan.v2,
            cycles = plan.cycles,
            period_ms = plan.measure_period.as_millis() as u64,
            "Square wave started"
        );

        let start = Instant::now();
        let mut schedule = Schedule::new(plan);

        loop {
            ctx.check()?;
            let elapsed = start.elapsed();

            if elapsed >= schedule.next_toggle {
                schedule.toggle(plan);
                let setpoint = self.volts(schedule.level);
                ctx.write(&commands::set_voltage(setpoint)).await?;
                ctx.emit(RunEvent::Level {
                    run_id: ctx.run_id(),
                    setpoint,
                    cycle: schedule.cycles,
                });
                if schedule.done(plan) {
                    info!(run_id = %ctx.run_id(), cycles = schedule.cycles, "Square wave complete");
                    break;
                }
            }

            if elapsed >= schedule.next_sample {
                ctx.check()?;
                let time = start.elapsed();
                let sample = ctx.sample().await?;
                ctx.record(MeasurementRow {
                    time_or_index: time.as_secs_f64(),
                    setpoint: self.volts(schedule.level),
                    voltage: sample.voltage,
                    current: sample.current,
                    resistance: sample.resistance,
                    delay: plan.measure_period.as_secs_f64(),
                });
                schedule.rearm_sample(plan.measure_period, start.elapsed());
            }

            ctx.settle_until(start + schedule.next_wake()).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(dwell_v1_ms: u64, dwell_v2_ms: u64, period_ms: u64, cycles: u32) -> SquarePlan {
        SquarePlan {
            v1: 0.0,
            v2: 2.0,
            dwell_v1: Duration::from_millis(dwell_v1_ms),
            dwell_v2: Duration::from_millis(dwell_v2_ms),
            cycles,
            measure_period: Duration::from_millis(period_ms),
            initial_settle: Duration::ZERO,
        }
    }

    #[test]
    fn test_toggle_deadlines_accumulate_dwell_times() {
        let p = plan(1000, 500, 300, 2);
        let mut schedule = Schedule::new(&p);
        let mut deadlines = vec![schedule.next_toggle];
        while !schedule.done(&p) {
            schedule.toggle(&p);
            deadlines.push(schedule.next_toggle);
        }
        let ms: Vec<u128> = deadlines.iter().map(|d| d.as_millis()).collect();
        assert_eq!(ms, vec![1000, 1500, 2500, 3000, 4000]);
        assert_eq!(schedule.cycles, 2);
        assert_eq!(schedule.level, Level::V1);
    }

    #[test]
    fn test_missed_samples_are_skipped() {
        let p = plan(1000, 1000, 100, 1);
        let mut schedule = Schedule::new(&p);
        // a sample at 100 ms that took until 450 ms
        schedule.rearm_sample(p.measure_period, Duration::from_millis(450));
        assert_eq!(schedule.next_sample, Duration::from_millis(500));
    }

    #[test]
    fn test_next_wake_is_earliest_deadline() {
        let p = plan(1000, 500, 300, 1);
        let schedule = Schedule::new(&p);
        assert_eq!(schedule.next_wake(), Duration::from_millis(300));
    }

    #[test]
    fn test_zero_cycles_never_done() {
        let p = plan(10, 10, 5, 0);
        let mut schedule = Schedule::new(&p);
        for _ in 0..100 {
            schedule.toggle(&p);
        }
        assert!(!schedule.done(&p));
    }

    #[test]
    fn test_validation() {
        assert!(plan(1000, 500, 300, 2).validate().is_ok());
        assert!(matches!(
            plan(1000, 500, 0, 2).validate(),
            Err(SweepError::InvalidParameter(_))
        ));
        assert!(matches!(
            plan(0, 500, 300, 2).validate(),
            Err(SweepError::InvalidParameter(_))
        ));
        let mut p = plan(1000, 500, 300, 2);
        p.v2 = f64::NAN;
        assert!(p.validate().is_err());
    }
}
