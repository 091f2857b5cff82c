//! Simulated SCPI transports.
//!
//! `SimulatedSupply` and `SimulatedMultimeter` implement [`ScpiTransport`] with
//! enough of the IT6500 / Keithley 2000 command sets for the SCPI wrappers and
//! the engines to run end to end without hardware. Both are cheap `Clone`
//! handles over shared state, so a test can keep one handle while the engine
//! owns the other and inspect the command log afterwards.
//!
//! Faults are injected per command prefix and occurrence:
//!
//! ```rust,ignore
//! let supply = SimulatedSupply::new(100.0);
//! supply.fail_on("MEAS:CURR?", 3);   // third current query errors
//! supply.garble_on("MEAS:VOLT?", 2); // second voltage query returns junk
//! ```

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{commands, ScpiTransport};

const NO_ERROR_REPLY: &str = "0,\"No error\"";
const GARBLED_REPLY: &str = "#GARBLED#";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultKind {
    Transport,
    Garbled,
}

#[derive(Debug, Clone)]
struct Fault {
    prefix: String,
    nth: usize,
    kind: FaultKind,
}

/// Bookkeeping shared by both simulators.
#[derive(Debug, Default)]
struct Bus {
    log: Vec<String>,
    faults: Vec<Fault>,
    errors: VecDeque<String>,
    closed: bool,
}

impl Bus {
    /// Record `command` and return the fault armed for this occurrence, if any.
    fn record(&mut self, command: &str) -> Result<Option<FaultKind>> {
        if self.closed {
            return Err(anyhow!("transport closed"));
        }
        self.log.push(command.to_string());

        let log = &self.log;
        let hit = self.faults.iter().position(|f| {
            log.iter().filter(|c| c.starts_with(&f.prefix)).count() == f.nth
                && command.starts_with(&f.prefix)
        });
        let kind = hit.map(|i| self.faults.remove(i).kind);

        if kind == Some(FaultKind::Transport) {
            return Err(anyhow!("simulated I/O timeout on '{}'", command));
        }
        Ok(kind)
    }

    fn pop_error(&mut self) -> String {
        self.errors
            .pop_front()
            .unwrap_or_else(|| NO_ERROR_REPLY.to_string())
    }
}

fn format_reading(value: f64, decimal_separator: char) -> String {
    let text = format!("{:.6E}", value);
    if decimal_separator == '.' {
        text
    } else {
        text.replace('.', &decimal_separator.to_string())
    }
}

// =============================================================================
// Simulated supply
// =============================================================================

#[derive(Debug)]
struct SupplyState {
    bus: Bus,
    load_ohms: f64,
    voltage: f64,
    output_on: bool,
    remote: bool,
    rated_volts: f64,
    decimal_separator: char,
    latency: Duration,
}

/// Simulated programmable supply driving a resistive load.
///
/// Builder methods act on the shared state, so they also affect existing clones.
///
/// Like the IT6500 it only programs magnitudes: `MEAS:VOLT?` reports the
/// absolute output voltage while the output is on, 0 otherwise.
#[derive(Debug, Clone)]
pub struct SimulatedSupply {
    state: Arc<Mutex<SupplyState>>,
}

impl SimulatedSupply {
    /// New supply with its output off, driving `load_ohms`.
    pub fn new(load_ohms: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SupplyState {
                bus: Bus::default(),
                load_ohms,
                voltage: 0.0,
                output_on: false,
                remote: false,
                rated_volts: 60.0,
                decimal_separator: '.',
                latency: Duration::ZERO,
            })),
        }
    }

    /// Reply with `separator` as decimal separator.
    pub fn with_decimal_separator(self, separator: char) -> Self {
        self.lock().decimal_separator = separator;
        self
    }

    /// Change the load resistance.
    pub fn with_load_ohms(self, load_ohms: f64) -> Self {
        self.lock().load_ohms = load_ohms;
        self
    }

    /// Hardware voltage rating. `VOLT:MAX` above it queues a range error.
    pub fn with_rating(self, rated_volts: f64) -> Self {
        self.lock().rated_volts = rated_volts;
        self
    }

    /// Delay every operation by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SupplyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the `nth` (1-based) command starting with `prefix`.
    pub fn fail_on(&self, prefix: &str, nth: usize) {
        self.lock().bus.faults.push(Fault {
            prefix: prefix.to_string(),
            nth,
            kind: FaultKind::Transport,
        });
    }

    /// Return a non-numeric reply to the `nth` query starting with `prefix`.
    pub fn garble_on(&self, prefix: &str, nth: usize) {
        self.lock().bus.faults.push(Fault {
            prefix: prefix.to_string(),
            nth,
            kind: FaultKind::Garbled,
        });
    }

    /// Queue an entry for the next `SYST:ERR?`.
    pub fn push_instrument_error(&self, entry: &str) {
        self.lock().bus.errors.push_back(entry.to_string());
    }

    /// Every command and query received, in order.
    pub fn command_log(&self) -> Vec<String> {
        self.lock().bus.log.clone()
    }

    /// Programmed voltage.
    pub fn voltage_setpoint(&self) -> f64 {
        self.lock().voltage
    }

    /// Output relay state.
    pub fn output_enabled(&self) -> bool {
        self.lock().output_on
    }

    /// Whether the supply is under remote control.
    pub fn is_remote(&self) -> bool {
        self.lock().remote
    }

    /// Number of times the supply was returned to local control.
    pub fn secure_count(&self) -> usize {
        self.lock()
            .bus
            .log
            .iter()
            .filter(|c| c.as_str() == commands::LOCAL)
            .count()
    }

    /// Whether [`ScpiTransport::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.lock().bus.closed
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ScpiTransport for SimulatedSupply {
    async fn query(&self, command: &str) -> Result<String> {
        self.delay().await;
        let mut state = self.lock();
        let fault = state.bus.record(command)?;
        if fault == Some(FaultKind::Garbled) {
            return Ok(format!("{}\n", GARBLED_REPLY));
        }

        let output = if state.output_on { state.voltage } else { 0.0 };
        let reply = match command {
            commands::MEASURE_VOLTAGE => format_reading(output, state.decimal_separator),
            commands::MEASURE_CURRENT => {
                format_reading(output / state.load_ohms, state.decimal_separator)
            }
            commands::ERROR_QUERY => state.bus.pop_error(),
            "*IDN?" => "SIMULATED,SUPPLY,0,1.0".to_string(),
            other => return Err(anyhow!("undefined header '{}'", other)),
        };
        Ok(format!("{}\n", reply))
    }

    async fn command(&self, command: &str) -> Result<()> {
        self.delay().await;
        let mut state = self.lock();
        state.bus.record(command)?;

        match command {
            commands::OUTPUT_ON => state.output_on = true,
            commands::OUTPUT_OFF => state.output_on = false,
            commands::REMOTE => state.remote = true,
            commands::LOCAL => state.remote = false,
            commands::CLEAR_STATUS => state.bus.errors.clear(),
            commands::RESET => {
                state.voltage = 0.0;
                state.output_on = false;
            }
            other => {
                if let Some(arg) = other.strip_prefix("VOLT:MAX ") {
                    let in_range = arg
                        .trim()
                        .parse::<f64>()
                        .map(|v| v <= state.rated_volts)
                        .unwrap_or(false);
                    if !in_range {
                        state
                            .bus
                            .errors
                            .push_back("-222,\"Data out of range\"".to_string());
                    }
                } else if let Some(arg) = other.strip_prefix("VOLT ") {
                    match arg.trim().parse::<f64>() {
                        Ok(v) => state.voltage = v.abs(),
                        Err(_) => state
                            .bus
                            .errors
                            .push_back("-224,\"Illegal parameter value\"".to_string()),
                    }
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.lock().bus.closed = true;
        Ok(())
    }
}

// =============================================================================
// Simulated multimeter
// =============================================================================

#[derive(Debug)]
struct MultimeterState {
    bus: Bus,
    base_ohms: f64,
    coupling: Option<(SimulatedSupply, f64)>,
    decimal_separator: char,
}

/// Simulated resistance DMM.
///
/// Reads a fixed resistance, or, once coupled to a [`SimulatedSupply`],
/// `base + ohms_per_volt * |V|` of the supply's live output.
#[derive(Debug, Clone)]
pub struct SimulatedMultimeter {
    state: Arc<Mutex<MultimeterState>>,
}

impl SimulatedMultimeter {
    /// New meter reading `base_ohms`.
    pub fn new(base_ohms: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MultimeterState {
                bus: Bus::default(),
                base_ohms,
                coupling: None,
                decimal_separator: '.',
            })),
        }
    }

    /// Make readings follow the output of `supply`.
    pub fn coupled_to(self, supply: SimulatedSupply, ohms_per_volt: f64) -> Self {
        self.lock().coupling = Some((supply, ohms_per_volt));
        self
    }

    /// Reply with `separator` as decimal separator.
    pub fn with_decimal_separator(self, separator: char) -> Self {
        self.lock().decimal_separator = separator;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MultimeterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the `nth` (1-based) command starting with `prefix`.
    pub fn fail_on(&self, prefix: &str, nth: usize) {
        self.lock().bus.faults.push(Fault {
            prefix: prefix.to_string(),
            nth,
            kind: FaultKind::Transport,
        });
    }

    /// Return a non-numeric reply to the `nth` query starting with `prefix`.
    pub fn garble_on(&self, prefix: &str, nth: usize) {
        self.lock().bus.faults.push(Fault {
            prefix: prefix.to_string(),
            nth,
            kind: FaultKind::Garbled,
        });
    }

    /// Queue an entry for the next `SYST:ERR?`.
    pub fn push_instrument_error(&self, entry: &str) {
        self.lock().bus.errors.push_back(entry.to_string());
    }

    /// Every command and query received, in order.
    pub fn command_log(&self) -> Vec<String> {
        self.lock().bus.log.clone()
    }

    /// Number of `READ?` queries served.
    pub fn read_count(&self) -> usize {
        self.lock()
            .bus
            .log
            .iter()
            .filter(|c| c.as_str() == commands::READ)
            .count()
    }

    /// Whether [`ScpiTransport::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.lock().bus.closed
    }
}

#[async_trait]
impl ScpiTransport for SimulatedMultimeter {
    async fn query(&self, command: &str) -> Result<String> {
        let mut state = self.lock();
        let fault = state.bus.record(command)?;
        if fault == Some(FaultKind::Garbled) {
            return Ok(format!("{}\n", GARBLED_REPLY));
        }

        let reply = match command {
            commands::READ => {
                let ohms = match &state.coupling {
                    Some((supply, k)) => {
                        let v = if supply.output_enabled() {
                            supply.voltage_setpoint()
                        } else {
                            0.0
                        };
                        state.base_ohms + k * v.abs()
                    }
                    None => state.base_ohms,
                };
                format_reading(ohms, state.decimal_separator)
            }
            commands::ERROR_QUERY => state.bus.pop_error(),
            "*IDN?" => "SIMULATED,MODEL 2000,0,1.0".to_string(),
            other => return Err(anyhow!("undefined header '{}'", other)),
        };
        Ok(format!("{}\n", reply))
    }

    async fn command(&self, command: &str) -> Result<()> {
        let mut state = self.lock();
        state.bus.record(command)?;
        if command == commands::CLEAR_STATUS || command == commands::RESET {
            state.bus.errors.clear();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.lock().bus.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ResponseParser;

    #[tokio::test]
    async fn test_supply_reports_magnitude_only_when_on() {
        let supply = SimulatedSupply::new(50.0);
        supply.command("VOLT -2").await.unwrap();
        let parser = ResponseParser::default();

        let off = supply.query("MEAS:VOLT?").await.unwrap();
        assert_eq!(parser.parse(&off).unwrap(), 0.0);

        supply.command("OUTP ON").await.unwrap();
        let v = parser.parse(&supply.query("MEAS:VOLT?").await.unwrap()).unwrap();
        let i = parser.parse(&supply.query("MEAS:CURR?").await.unwrap()).unwrap();
        assert_eq!(v, 2.0);
        assert!((i - 0.04).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fault_fires_once_on_nth_occurrence() {
        let supply = SimulatedSupply::new(50.0);
        supply.fail_on("MEAS:CURR?", 2);

        assert!(supply.query("MEAS:CURR?").await.is_ok());
        assert!(supply.query("MEAS:CURR?").await.is_err());
        assert!(supply.query("MEAS:CURR?").await.is_ok());
    }

    #[tokio::test]
    async fn test_garbled_reply() {
        let dmm = SimulatedMultimeter::new(10.0);
        dmm.garble_on("READ?", 1);
        let reply = dmm.query("READ?").await.unwrap();
        assert!(ResponseParser::default().parse(&reply).is_err());
        assert_eq!(dmm.read_count(), 1);
    }

    #[tokio::test]
    async fn test_comma_replies() {
        let dmm = SimulatedMultimeter::new(12.5).with_decimal_separator(',');
        let reply = dmm.query("READ?").await.unwrap();
        assert!(reply.contains(','));
        assert_eq!(ResponseParser::new(',').parse(&reply).unwrap(), 12.5);
    }

    #[tokio::test]
    async fn test_coupled_meter_follows_supply() {
        let supply = SimulatedSupply::new(50.0);
        let dmm = SimulatedMultimeter::new(100.0).coupled_to(supply.clone(), 10.0);
        supply.command("VOLT 3").await.unwrap();
        supply.command("OUTP ON").await.unwrap();

        let reply = dmm.query("READ?").await.unwrap();
        assert_eq!(ResponseParser::default().parse(&reply).unwrap(), 130.0);
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_io() {
        let supply = SimulatedSupply::new(50.0);
        supply.close().await.unwrap();
        assert!(supply.is_closed());
        assert!(supply.command("OUTP ON").await.is_err());
    }
}
