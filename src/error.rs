//! Custom error types for the application.
//!
//! This module defines the primary error type, `SweepError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur, from configuration issues to
//! instrument communication failures in the middle of a run.
//!
//! ## Error Hierarchy
//!
//! `SweepError` falls into three broad categories:
//!
//! - **Fatal run errors**: `Transport` and `Parse`. The instrument state is unknown once
//!   one of these occurs, so the run is aborted, the instruments are secured and no retry
//!   is attempted.
//! - **Rejected parameters**: `InvalidRange`, `InvalidStep`, `InvalidParameter`. These are
//!   raised while building the excitation plan, before any hardware command is issued.
//! - **Control flow and environment**: `Cancelled` (a cooperative stop, not a failure),
//!   `RunInProgress`, `TaskFailed`, `Configuration`, `Config`, `Io` and `Csv`.
//!
//! Capability traits (`Source`, `Meter`) report failures through `anyhow::Error`; the
//! engine converts them into `SweepError::Transport` at its boundary.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, SweepError>;

/// Primary error type for acquisition runs.
#[derive(Error, Debug)]
pub enum SweepError {
    /// Instrument I/O failed.
    ///
    /// **Error Type**: Fatal to the current run.
    ///
    /// **Recovery Strategy**: Secure the instruments and abort. The command that failed may
    /// or may not have reached the instrument, so it must not be re-sent blindly.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An instrument reply could not be converted into a number.
    ///
    /// **Error Type**: Fatal to the current run, handled exactly like `Transport`.
    #[error("Unparsable instrument reply {raw:?}: {reason}")]
    Parse {
        /// Reply text as received from the instrument
        raw: String,
        /// Why the cleaned reply was rejected
        reason: String,
    },

    /// Hysteresis requested with `v1 >= v2`.
    #[error("Invalid hysteresis range: v1 ({v1}) must be lower than v2 ({v2})")]
    InvalidRange {
        /// Start voltage
        v1: f64,
        /// Peak voltage
        v2: f64,
    },

    /// Ramp step is zero or not a finite number.
    #[error("Invalid voltage step: {0}")]
    InvalidStep(f64),

    /// A plan parameter is out of its valid domain (negative delay, NaN voltage, ...).
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The run was stopped through the cancellation token.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// Another run already owns the Source/Meter pair.
    #[error("An acquisition run is already in progress")]
    RunInProgress,

    /// The run task ended without producing a report.
    #[error("Run task failed: {0}")]
    TaskFailed(String),

    /// Configuration values parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration file or environment could not be extracted.
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Delimited export failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl SweepError {
    /// Wrap a capability-level failure as a transport error.
    pub fn transport(err: anyhow::Error) -> Self {
        SweepError::Transport(format!("{:#}", err))
    }

    /// True for errors that abort a run and leave the instrument state unknown.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SweepError::Transport(_) | SweepError::Parse { .. })
    }
}

impl From<figment::Error> for SweepError {
    fn from(err: figment::Error) -> Self {
        SweepError::Config(Box::new(err))
    }
}
