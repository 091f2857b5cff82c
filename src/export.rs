//! Delimited-text export of finalized tables.
//!
//! Files are plain CSV-like text with a header row. Column separator, decimal
//! separator and the number of decimals are configurable so that tables open
//! directly in spreadsheet software using a comma decimal locale
//! (`;` columns, `,` decimals).

use chrono::{DateTime, Local};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::FormatConfig;
use crate::dataset::{AcquisitionMode, Table};
use crate::error::{AppResult, SweepError};

/// Number formatting of an exported table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportFormat {
    /// Separator between columns, ASCII
    pub column_separator: char,
    /// Decimal separator inside values
    pub decimal_separator: char,
    /// Fixed number of decimals
    pub decimals: usize,
}

impl Default for ExportFormat {
    fn default() -> Self {
        Self {
            column_separator: ';',
            decimal_separator: '.',
            decimals: 6,
        }
    }
}

impl From<&FormatConfig> for ExportFormat {
    fn from(config: &FormatConfig) -> Self {
        Self {
            column_separator: config.column_separator,
            decimal_separator: config.decimal_separator,
            decimals: config.decimals,
        }
    }
}

impl ExportFormat {
    fn delimiter(&self) -> AppResult<u8> {
        if !self.column_separator.is_ascii() {
            return Err(SweepError::InvalidParameter(format!(
                "column separator '{}' is not ASCII",
                self.column_separator
            )));
        }
        if self.column_separator == self.decimal_separator {
            return Err(SweepError::InvalidParameter(format!(
                "column and decimal separators are both '{}'",
                self.column_separator
            )));
        }
        Ok(self.column_separator as u8)
    }

    /// Format one value.
    pub fn format_value(&self, value: f64) -> String {
        let text = format!("{:.*}", self.decimals, value);
        if self.decimal_separator == '.' {
            text
        } else {
            text.replace('.', &self.decimal_separator.to_string())
        }
    }
}

/// Write `table` with a header row to `writer`.
pub fn write_table<W: Write>(table: &Table, format: &ExportFormat, writer: W) -> AppResult<()> {
    let mut csv = csv::WriterBuilder::new()
        .delimiter(format.delimiter()?)
        .from_writer(writer);

    csv.write_record(&table.columns)?;
    for row in &table.rows {
        csv.write_record(row.iter().map(|v| format.format_value(*v)))?;
    }
    csv.flush()?;
    Ok(())
}

/// Write `table` to `path`, creating parent directories as needed.
pub fn export_to_path(table: &Table, format: &ExportFormat, path: &Path) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    write_table(table, format, file)?;
    tracing::info!(path = %path.display(), rows = table.len(), "Table exported");
    Ok(())
}

/// Timestamped file name for a run, e.g. `ramp_20240501_142233.csv`.
pub fn default_file_name(mode: AcquisitionMode, started_at: DateTime<Local>) -> PathBuf {
    PathBuf::from(format!(
        "{}_{}.csv",
        mode,
        started_at.format("%Y%m%d_%H%M%S")
    ))
}
