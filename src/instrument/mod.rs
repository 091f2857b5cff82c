//! Instrument capabilities seen by the acquisition core.
//!
//! The engine never talks to a bus directly. It works against two small
//! capability traits:
//!
//! - [`Source`]: the programmable supply. Raw `write`/`query` plus the lifecycle
//!   operations `initialize`, `secure` and `close`.
//! - [`Meter`]: the secondary instrument that returns one reading per `measure`.
//!
//! Concrete instruments are built once at startup through the
//! [`registry::InstrumentRegistry`]. SCPI instruments are expressed as
//! [`scpi::ScpiSource`] / [`scpi::ScpiMeter`] over any [`ScpiTransport`];
//! [`sim`] provides simulated transports for tests and dry runs.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Is used strictly sequentially: SCPI instruments are not safe for
//!   concurrent command streams

use anyhow::Result;
use async_trait::async_trait;

pub mod registry;
pub mod scpi;
pub mod sim;
pub mod tcp;

/// SCPI command vocabulary used by the engine and the SCPI wrappers.
pub mod commands {
    /// Enable the source output.
    pub const OUTPUT_ON: &str = "OUTP ON";
    /// Disable the source output.
    pub const OUTPUT_OFF: &str = "OUTP OFF";
    /// Query the measured output voltage.
    pub const MEASURE_VOLTAGE: &str = "MEAS:VOLT?";
    /// Query the measured output current.
    pub const MEASURE_CURRENT: &str = "MEAS:CURR?";
    /// Trigger and read one meter sample.
    pub const READ: &str = "READ?";
    /// Pop the oldest entry of the error queue.
    pub const ERROR_QUERY: &str = "SYST:ERR?";
    /// Return the instrument to front-panel control.
    pub const LOCAL: &str = "SYST:LOC";
    /// Put the instrument under remote control.
    pub const REMOTE: &str = "SYST:REM";
    /// Reset to power-on defaults.
    pub const RESET: &str = "*RST";
    /// Clear status registers and the error queue.
    pub const CLEAR_STATUS: &str = "*CLS";

    /// Program the output voltage.
    pub fn set_voltage(volts: f64) -> String {
        format!("VOLT {}", volts)
    }
}

/// Capability: programmable voltage source.
///
/// # Contract
/// - `write`/`query` carry raw SCPI text without terminator
/// - `initialize` resets the instrument and programs limits and protection
/// - `secure` leaves the instrument safe: output off, 0 V, faults cleared,
///   local control
/// - Any I/O failure is returned as `Err`; callers must not retry blindly
#[async_trait]
pub trait Source: Send + Sync {
    /// Send a command without expecting a response.
    async fn write(&self, command: &str) -> Result<()>;

    /// Send a query and return the raw response.
    async fn query(&self, command: &str) -> Result<String>;

    /// Reset limits and protection for a new run.
    async fn initialize(&self) -> Result<()>;

    /// Put the source into its secured state.
    async fn secure(&self) -> Result<()>;

    /// Release the underlying resource.
    async fn close(&self) -> Result<()>;
}

/// Capability: single-reading measurement instrument.
#[async_trait]
pub trait Meter: Send + Sync {
    /// Take one reading and return the raw response.
    async fn measure(&self) -> Result<String>;

    /// Return the meter to local control.
    async fn secure(&self) -> Result<()>;

    /// Release the underlying resource.
    async fn close(&self) -> Result<()>;
}

/// Trait for SCPI communication transports.
///
/// Abstracts the underlying communication mechanism (serial, VISA, TCP)
/// to enable protocol-agnostic SCPI operations.
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Send a query command and return the response.
    async fn query(&self, command: &str) -> Result<String>;

    /// Send a command without expecting a response.
    async fn command(&self, command: &str) -> Result<()>;

    /// Close the transport.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
