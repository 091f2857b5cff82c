//! Numeric reply parsing for SCPI instruments.
//!
//! Instruments answer queries like `MEAS:VOLT?` or `READ?` with text such as
//! `"+1.234500E+00\r\n"`. Some front panels are configured for a comma decimal
//! separator, and a few append extra lines (status, units). `ResponseParser`
//! normalizes all of that into an `f64` or reports a `SweepError::Parse`.

use crate::error::{AppResult, SweepError};

/// Converts raw instrument replies into numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseParser {
    decimal_separator: char,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new('.')
    }
}

impl ResponseParser {
    /// Create a parser for replies using `decimal_separator` (usually `.` or `,`).
    pub fn new(decimal_separator: char) -> Self {
        Self { decimal_separator }
    }

    /// Decimal separator expected in instrument replies.
    pub fn decimal_separator(&self) -> char {
        self.decimal_separator
    }

    /// Parse a reply into a finite floating-point value.
    ///
    /// Surrounding whitespace is trimmed, only the first line is kept and the
    /// configured decimal separator is replaced by `.` before conversion.
    pub fn parse(&self, raw: &str) -> AppResult<f64> {
        let first_line = raw.trim().lines().next().unwrap_or("").trim();
        let cleaned = if self.decimal_separator == '.' {
            first_line.to_string()
        } else {
            first_line.replace(self.decimal_separator, ".")
        };

        if cleaned.is_empty() {
            return Err(SweepError::Parse {
                raw: raw.to_string(),
                reason: "empty reply".to_string(),
            });
        }

        let value = cleaned.parse::<f64>().map_err(|e| SweepError::Parse {
            raw: raw.to_string(),
            reason: e.to_string(),
        })?;

        if !value.is_finite() {
            return Err(SweepError::Parse {
                raw: raw.to_string(),
                reason: "value is not finite".to_string(),
            });
        }

        Ok(value)
    }
}
