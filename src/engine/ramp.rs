//! Ramp-driven acquisition.
//!
//! One sample per setpoint: command the magnitude, settle, sample, record.
//! Polarity-zero points between setpoints of opposite sign go through the
//! interlock instead of a plain voltage command.

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use super::{AcquisitionEngine, RunContext, RunEvent};
use crate::dataset::{AcquisitionMode, MeasurementRow};
use crate::error::{AppResult, SweepError};
use crate::instrument::commands;
use crate::interlock::{Interlock, InterlockOutcome};
use crate::sequence::{
    build_hysteresis, build_ramp, insert_polarity_zeros, Sequence, SetpointRole,
};

/// Parameters of a ramp run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampPlan {
    /// Start voltage (V)
    pub v1: f64,
    /// End voltage (V), or the loop amplitude in hysteresis mode
    pub v2: f64,
    /// Step magnitude (V)
    pub step: f64,
    /// Settle delay at normal points
    pub delay: Duration,
    /// Settle delay at v1, v2, -v2 and after a polarity reversal
    pub endpoint_delay: Duration,
    /// Run the v1→v2→v1→−v2→v1 loop instead of a single ramp
    pub hysteresis: bool,
}

impl RampPlan {
    /// Materialize the setpoint sequence.
    ///
    /// Fails with `InvalidRange`, `InvalidStep` or `InvalidParameter` before any
    /// instrument is touched.
    pub fn sequence(&self) -> AppResult<Sequence> {
        let (base, extrema) = if self.hysteresis {
            (
                build_hysteresis(self.v1, self.v2, self.step)?,
                vec![self.v1, self.v2, -self.v2],
            )
        } else {
            (build_ramp(self.v1, self.v2, self.step)?, vec![self.v1, self.v2])
        };
        Ok(insert_polarity_zeros(&base).tag_endpoints(&extrema))
    }

    fn settle_delay(&self, role: SetpointRole) -> Duration {
        match role {
            SetpointRole::Endpoint => self.endpoint_delay,
            SetpointRole::Normal | SetpointRole::PolarityZero => self.delay,
        }
    }
}

/// Executes a [`RampPlan`].
pub struct RampEngine {
    plan: RampPlan,
    sequence: Sequence,
    interlock: Interlock,
}

impl RampEngine {
    /// Validate `plan` and build its sequence.
    pub fn new(plan: RampPlan, interlock: Interlock) -> AppResult<Self> {
        let sequence = plan.sequence()?;
        if sequence.is_empty() {
            return Err(SweepError::InvalidParameter("empty ramp".to_string()));
        }
        Ok(Self {
            plan,
            sequence,
            interlock,
        })
    }

    /// The setpoints this engine will visit.
    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    /// The plan this engine executes.
    pub fn plan(&self) -> &RampPlan {
        &self.plan
    }
}

#[async_trait]
impl AcquisitionEngine for RampEngine {
    fn mode(&self) -> AcquisitionMode {
        AcquisitionMode::Ramp
    }

    async fn acquire(&self, ctx: &mut RunContext) -> AppResult<()> {
        ctx.source()
            .initialize()
            .await
            .map_err(SweepError::transport)?;
        ctx.write(&commands::set_voltage(0.0)).await?;
        ctx.write(commands::OUTPUT_ON).await?;
        ctx.settle(self.plan.delay).await?;

        info!(
            run_id = %ctx.run_id(),
            points = self.sequence.len(),
            hysteresis = self.plan.hysteresis,
            "Ramp started"
        );

        for (index, point) in self.sequence.iter().enumerate() {
            ctx.check()?;

            let settle = if point.is_polarity_zero() && self.sequence.is_reversal(index) {
                let from = self.sequence.get(index - 1).map_or(0.0, |p| p.voltage);
                let to = self.sequence.get(index + 1).map_or(0.0, |p| p.voltage);
                ctx.emit(RunEvent::Interlock {
                    run_id: ctx.run_id(),
                    from,
                    to,
                });
                match self
                    .interlock
                    .engage(ctx.source(), ctx.token(), from, to)
                    .await?
                {
                    InterlockOutcome::Resumed => self.plan.endpoint_delay,
                    InterlockOutcome::Stopped => return Err(ctx.stopped()),
                }
            } else {
                ctx.write(&commands::set_voltage(point.voltage.abs()))
                    .await?;
                self.plan.settle_delay(point.role)
            };

            ctx.settle(settle).await?;
            let sample = ctx.sample().await?;

            // the supply reports magnitudes only
            let voltage = if point.voltage < 0.0 && sample.voltage > 0.0 {
                -sample.voltage
            } else {
                sample.voltage
            };

            ctx.record(MeasurementRow {
                time_or_index: index as f64,
                setpoint: point.voltage,
                voltage,
                current: sample.current,
                resistance: sample.resistance,
                delay: settle.as_secs_f64(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::Setpoint;

    fn plan(v1: f64, v2: f64, step: f64, hysteresis: bool) -> RampPlan {
        RampPlan {
            v1,
            v2,
            step,
            delay: Duration::from_millis(100),
            endpoint_delay: Duration::from_secs(1),
            hysteresis,
        }
    }

    #[test]
    fn test_simple_ramp_tags_endpoints() {
        let sequence = plan(0.0, 1.0, 0.25, false).sequence().unwrap();
        assert_eq!(sequence.voltages(), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        let roles: Vec<_> = sequence.iter().map(|p| p.role).collect();
        assert_eq!(roles[0], SetpointRole::Endpoint);
        assert_eq!(roles[2], SetpointRole::Normal);
        assert_eq!(roles[4], SetpointRole::Endpoint);
    }

    #[test]
    fn test_hysteresis_plan_inserts_reversal_zero() {
        let sequence = plan(0.3, 1.0, 0.5, true).sequence().unwrap();
        assert_eq!(
            sequence.voltages(),
            vec![0.3, 0.8, 1.0, 0.5, 0.3, 0.0, -0.2, -0.7, -1.0, -0.5, 0.0, 0.3]
        );
        let zeros: Vec<usize> = sequence
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_polarity_zero())
            .map(|(i, _)| i)
            .collect();
        // inserted at 0.3 -> -0.2, retagged at -0.5 -> 0 -> 0.3
        assert_eq!(zeros, vec![5, 10]);
        assert!(sequence.is_reversal(5));
        assert!(sequence.is_reversal(10));
        assert_eq!(sequence.get(8).map(|p| p.role), Some(SetpointRole::Endpoint));
        assert_eq!(sequence.get(11).map(|p| p.role), Some(SetpointRole::Endpoint));
    }

    #[test]
    fn test_hysteresis_from_zero_interlocks_generated_zero() {
        let sequence = plan(0.0, 1.0, 0.5, true).sequence().unwrap();
        assert_eq!(
            sequence.voltages(),
            vec![0.0, 0.5, 1.0, 0.5, 0.0, -0.5, -1.0, -0.5, 0.0]
        );
        let roles: Vec<SetpointRole> = sequence.iter().map(|p| p.role).collect();
        assert_eq!(roles[0], SetpointRole::Endpoint);
        assert_eq!(roles[4], SetpointRole::PolarityZero);
        assert_eq!(roles[8], SetpointRole::Endpoint);
    }

    #[test]
    fn test_ramp_through_zero_engages_interlock() {
        let sequence = plan(-1.0, 1.0, 0.5, false).sequence().unwrap();
        assert_eq!(sequence.voltages(), vec![-1.0, -0.5, 0.0, 0.5, 1.0]);
        let zeros: Vec<usize> = sequence
            .iter()
            .enumerate()
            .filter(|(_, p): &(usize, &Setpoint)| p.is_polarity_zero())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(zeros, vec![2]);
    }

    #[test]
    fn test_invalid_plans_are_rejected() {
        assert!(matches!(
            plan(1.0, 1.0, 0.1, true).sequence(),
            Err(SweepError::InvalidRange { .. })
        ));
        assert!(matches!(
            plan(0.0, 1.0, 0.0, false).sequence(),
            Err(SweepError::InvalidStep(_))
        ));
    }

    #[test]
    fn test_settle_delay_by_role() {
        let p = plan(0.0, 1.0, 0.5, false);
        assert_eq!(p.settle_delay(SetpointRole::Endpoint), Duration::from_secs(1));
        assert_eq!(p.settle_delay(SetpointRole::Normal), Duration::from_millis(100));
    }
}
