//! # sweep_daq
//!
//! Sequence generation and timed acquisition for a programmable supply paired
//! with a measurement instrument. The supply is driven through a voltage ramp
//! (optionally a full hysteresis loop) or a two-level square wave while source
//! telemetry and a meter reading are sampled into a dataset.
//!
//! ## Crate Structure
//!
//! - **`sequence`**: Pure setpoint synthesis: ramps, hysteresis loops and
//!   polarity-zero insertion.
//! - **`parser`**: Numeric reply parsing (`ResponseParser`).
//! - **`safety`**: `CancellationToken` and the `PanicGuard` drop guard.
//! - **`interlock`**: Output-off and acknowledgment handshake at polarity
//!   reversals, with the `AcknowledgmentGate` implementations.
//! - **`dataset`**: Per-run column storage and the finalized `Table`.
//! - **`engine`**: The ramp and square-wave engines and the top-level run
//!   handler that secures instruments on every exit path.
//! - **`controller`**: Run slot, run spawning and event subscription.
//! - **`instrument`**: `Source` / `Meter` capability traits, SCPI wrappers,
//!   transports, simulators and the driver registry.
//! - **`export`**: Delimited-text export of finalized tables.
//! - **`config`**, **`logging`**, **`error`**: Figment configuration, tracing
//!   setup and the crate error type.

pub mod config;
pub mod controller;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod export;
pub mod instrument;
pub mod interlock;
pub mod logging;
pub mod parser;
pub mod safety;
pub mod sequence;

pub use controller::{AcquisitionController, RunHandle};
pub use engine::{RunEvent, RunOutcome, RunReport};
pub use error::{AppResult, SweepError};
