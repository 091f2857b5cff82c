//! Per-run measurement storage.
//!
//! A `Dataset` keeps one column per channel in append order. It is owned by
//! the running engine; observers get rows through `RunEvent::Row` or a
//! [`Dataset::snapshot`], and the final [`Table`] through `finalize`.

use serde::{Deserialize, Serialize};

/// Acquisition mode of a run. Decides the exported column layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Setpoint sequence, one sample per point
    Ramp,
    /// Two levels alternating on a timer, periodic sampling
    SquareWave,
}

impl std::fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquisitionMode::Ramp => write!(f, "ramp"),
            AcquisitionMode::SquareWave => write!(f, "square_wave"),
        }
    }
}

/// One recorded sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRow {
    /// Point index (ramp) or elapsed seconds since start (square wave)
    pub time_or_index: f64,
    /// Commanded voltage, signed (V)
    pub setpoint: f64,
    /// Measured voltage (V)
    pub voltage: f64,
    /// Measured current (A)
    pub current: f64,
    /// Meter reading (Ohm)
    pub resistance: f64,
    /// Settle delay or sampling period that preceded the sample (s)
    pub delay: f64,
}

/// Row-major result of a run, ready for export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Column headers
    pub columns: Vec<String>,
    /// One entry per row, same order as `columns`
    pub rows: Vec<Vec<f64>>,
}

impl Table {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Column-oriented storage for one run.
#[derive(Debug, Clone)]
pub struct Dataset {
    mode: AcquisitionMode,
    time_or_index: Vec<f64>,
    setpoint: Vec<f64>,
    voltage: Vec<f64>,
    current: Vec<f64>,
    resistance: Vec<f64>,
    delay: Vec<f64>,
}

impl Dataset {
    /// Empty dataset for `mode`.
    pub fn new(mode: AcquisitionMode) -> Self {
        Self {
            mode,
            time_or_index: Vec::new(),
            setpoint: Vec::new(),
            voltage: Vec::new(),
            current: Vec::new(),
            resistance: Vec::new(),
            delay: Vec::new(),
        }
    }

    /// Mode this dataset was created for.
    pub fn mode(&self) -> AcquisitionMode {
        self.mode
    }

    /// Append one sample to every channel.
    pub fn append(&mut self, row: MeasurementRow) {
        self.time_or_index.push(row.time_or_index);
        self.setpoint.push(row.setpoint);
        self.voltage.push(row.voltage);
        self.current.push(row.current);
        self.resistance.push(row.resistance);
        self.delay.push(row.delay);
    }

    /// Number of complete rows.
    pub fn len(&self) -> usize {
        self.channels().iter().map(|c| c.len()).min().unwrap_or(0)
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the complete rows recorded so far.
    pub fn snapshot(&self) -> Vec<MeasurementRow> {
        (0..self.len())
            .map(|i| MeasurementRow {
                time_or_index: self.time_or_index[i],
                setpoint: self.setpoint[i],
                voltage: self.voltage[i],
                current: self.current[i],
                resistance: self.resistance[i],
                delay: self.delay[i],
            })
            .collect()
    }

    /// Column headers of the export layout for this mode.
    pub fn columns(&self) -> Vec<String> {
        let names: [&str; 5] = match self.mode {
            AcquisitionMode::Ramp => [
                "Index",
                "Measured voltage (V)",
                "Resistance (Ohm)",
                "Setpoint (V)",
                "Delay (s)",
            ],
            AcquisitionMode::SquareWave => [
                "Time (s)",
                "Measured voltage (V)",
                "Resistance (Ohm)",
                "Setpoint (V)",
                "Measured current (A)",
            ],
        };
        names.iter().map(|n| n.to_string()).collect()
    }

    /// Build the export table.
    ///
    /// Returns `None` when nothing was recorded or when the channels disagree
    /// on length.
    pub fn finalize(&self) -> Option<Table> {
        let len = self.time_or_index.len();
        if len == 0 || self.channels().iter().any(|c| c.len() != len) {
            return None;
        }

        let rows = self
            .snapshot()
            .into_iter()
            .map(|r| match self.mode {
                AcquisitionMode::Ramp => {
                    vec![r.time_or_index, r.voltage, r.resistance, r.setpoint, r.delay]
                }
                AcquisitionMode::SquareWave => {
                    vec![r.time_or_index, r.voltage, r.resistance, r.setpoint, r.current]
                }
            })
            .collect();

        Some(Table {
            columns: self.columns(),
            rows,
        })
    }

    fn channels(&self) -> [&Vec<f64>; 6] {
        [
            &self.time_or_index,
            &self.setpoint,
            &self.voltage,
            &self.current,
            &self.resistance,
            &self.delay,
        ]
    }
}
