//! Voltage setpoint sequences for ramp-driven runs.
//!
//! Sequences are materialized up front, before any hardware command is issued:
//!
//! ```text
//! build_ramp(0, 1, 0.25)        ->  0, 0.25, 0.5, 0.75, 1
//! build_hysteresis(0, 1, 0.5)   ->  0, 0.5, 1, 0.5, 0, -0.5, -1, -0.5, 0
//! insert_polarity_zeros(1, -1)  ->  1, 0*, -1          (* = polarity-zero)
//! insert_polarity_zeros(1, 0, -1) -> 1, 0*, -1
//! ```
//!
//! Values are rounded to the decimal precision of the step after every addition,
//! so a 0.05 V step over hundreds of points never drifts to 0.30000000000000004.

use crate::error::{AppResult, SweepError};
use std::cmp::Ordering;

/// Upper bound on the number of points a single ramp segment may produce.
pub const MAX_RAMP_POINTS: usize = 1_000_000;

/// Finest rounding precision used for setpoints.
const MAX_DECIMAL_PLACES: u32 = 12;

/// How the engine treats a setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetpointRole {
    /// Ordinary point, standard settle delay
    Normal,
    /// Sequence extremum (v1, v2, -v2), extended settle delay
    Endpoint,
    /// Synthetic 0 V inserted at a sign change, handled by the interlock
    PolarityZero,
}

/// A single target voltage commanded to the source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Setpoint {
    /// Signed target voltage
    pub voltage: f64,
    /// Role tag
    pub role: SetpointRole,
}

impl Setpoint {
    /// Ordinary setpoint.
    pub fn normal(voltage: f64) -> Self {
        Self {
            voltage,
            role: SetpointRole::Normal,
        }
    }

    /// Synthetic polarity-change zero.
    pub fn polarity_zero() -> Self {
        Self {
            voltage: 0.0,
            role: SetpointRole::PolarityZero,
        }
    }

    /// True for synthetic polarity-change points.
    pub fn is_polarity_zero(&self) -> bool {
        self.role == SetpointRole::PolarityZero
    }
}

/// Ordered list of setpoints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sequence {
    points: Vec<Setpoint>,
}

impl Sequence {
    /// Build a sequence of `Normal` setpoints.
    pub fn from_voltages<I>(voltages: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        Self {
            points: voltages.into_iter().map(Setpoint::normal).collect(),
        }
    }

    /// Signed voltages in order.
    pub fn voltages(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.voltage).collect()
    }

    /// Number of setpoints.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when the sequence has no setpoints.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Setpoint at `index`.
    pub fn get(&self, index: usize) -> Option<&Setpoint> {
        self.points.get(index)
    }

    /// Iterate over the setpoints.
    pub fn iter(&self) -> std::slice::Iter<'_, Setpoint> {
        self.points.iter()
    }

    /// Last setpoint.
    pub fn last(&self) -> Option<&Setpoint> {
        self.points.last()
    }

    /// Does the point at `index` sit between two setpoints of strictly opposite sign?
    ///
    /// Only the immediate neighbours are compared. A sequence that touches 0 V
    /// without changing sign is not a reversal.
    pub fn is_reversal(&self, index: usize) -> bool {
        if index == 0 || index + 1 >= self.points.len() {
            return false;
        }
        opposite_signs(
            self.points[index - 1].voltage,
            self.points[index + 1].voltage,
        )
    }

    /// Tag every `Normal` point whose voltage equals one of `extrema` as `Endpoint`.
    pub fn tag_endpoints(mut self, extrema: &[f64]) -> Self {
        for point in &mut self.points {
            if point.role == SetpointRole::Normal && extrema.contains(&point.voltage) {
                point.role = SetpointRole::Endpoint;
            }
        }
        self
    }

    fn extend_skipping_first(&mut self, other: Sequence) {
        self.points.extend(other.points.into_iter().skip(1));
    }
}

impl<'a> IntoIterator for &'a Sequence {
    type Item = &'a Setpoint;
    type IntoIter = std::slice::Iter<'a, Setpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

fn opposite_signs(a: f64, b: f64) -> bool {
    (a > 0.0 && b < 0.0) || (a < 0.0 && b > 0.0)
}

/// Number of fractional digits in the shortest decimal representation of `value`.
fn decimal_places(value: f64) -> u32 {
    let text = format!("{}", value.abs());
    let digits = text.split('.').nth(1).map_or(0, |frac| frac.len() as u32);
    digits.min(MAX_DECIMAL_PLACES)
}

fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    let rounded = (value * factor).round() / factor;
    // normalize -0.0
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Build a monotonic ramp from `v1` to `v2`.
///
/// The direction follows `v1 <= v2`; the sign of `step` is ignored. Both
/// endpoints are always included, even when `step` does not divide the span.
pub fn build_ramp(v1: f64, v2: f64, step: f64) -> AppResult<Sequence> {
    if !v1.is_finite() || !v2.is_finite() {
        return Err(SweepError::InvalidParameter(format!(
            "ramp endpoints must be finite (v1 = {}, v2 = {})",
            v1, v2
        )));
    }
    if !step.is_finite() || step == 0.0 {
        return Err(SweepError::InvalidStep(step));
    }

    let places = decimal_places(step)
        .max(decimal_places(v1))
        .max(decimal_places(v2));
    let magnitude = round_to(step.abs(), places);
    if magnitude == 0.0 {
        return Err(SweepError::InvalidStep(step));
    }

    let span = (v2 - v1).abs();
    if span / magnitude > MAX_RAMP_POINTS as f64 {
        return Err(SweepError::InvalidParameter(format!(
            "step {} over {} V exceeds {} points",
            step, span, MAX_RAMP_POINTS
        )));
    }

    let start = round_to(v1, places);
    let end = round_to(v2, places);
    let mut values = Vec::new();
    let mut current = start;

    if v1 <= v2 {
        while current <= end {
            values.push(current);
            current = round_to(current + magnitude, places);
        }
    } else {
        while current >= end {
            values.push(current);
            current = round_to(current - magnitude, places);
        }
    }

    if values.last() != Some(&end) {
        values.push(end);
    }

    Ok(Sequence::from_voltages(values))
}

/// Build the closed hysteresis loop v1 → v2 → v1 → -v2 → v1.
///
/// Requires `v1 < v2`. Each segment after the first drops its first point, which
/// is shared with the end of the previous segment.
pub fn build_hysteresis(v1: f64, v2: f64, step: f64) -> AppResult<Sequence> {
    if v1.partial_cmp(&v2) != Some(Ordering::Less) {
        return Err(SweepError::InvalidRange { v1, v2 });
    }

    let mut sequence = build_ramp(v1, v2, step)?;
    sequence.extend_skipping_first(build_ramp(v2, v1, step)?);
    sequence.extend_skipping_first(build_ramp(v1, -v2, step)?);
    sequence.extend_skipping_first(build_ramp(-v2, v1, step)?);
    Ok(sequence)
}

/// Mark every sign change with exactly one polarity-zero point.
///
/// A 0 V point is inserted between adjacent setpoints of strictly opposite
/// sign. A 0 V point already sitting between setpoints of opposite sign is
/// retagged instead, so zeros are never duplicated. Zeros touched without a
/// sign change keep their role.
pub fn insert_polarity_zeros(sequence: &Sequence) -> Sequence {
    let mut points = Vec::with_capacity(sequence.len());

    for (i, point) in sequence.iter().enumerate() {
        if point.voltage == 0.0 && sequence.is_reversal(i) {
            points.push(Setpoint::polarity_zero());
        } else {
            points.push(*point);
        }
        if let Some(next) = sequence.get(i + 1) {
            if opposite_signs(point.voltage, next.voltage) {
                points.push(Setpoint::polarity_zero());
            }
        }
    }

    Sequence { points }
}
