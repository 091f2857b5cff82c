//! Configuration loading using Figment
//!
//! Configuration is layered from:
//! 1. `config/sweep.toml` (base configuration)
//! 2. Environment variables prefixed with `SWEEP_DAQ_`, nested keys separated
//!    by a double underscore (`SWEEP_DAQ_RAMP__STEP=0.05`)
//!
//! # Example
//! ```no_run
//! use sweep_daq::config::SweepConfig;
//!
//! let config = SweepConfig::load()?;
//! config.validate().map_err(anyhow::Error::msg)?;
//! println!("Source driver: {}", config.source.driver);
//! # Ok::<(), anyhow::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::ramp::RampPlan;
use crate::engine::square::SquarePlan;
use crate::instrument::scpi::SourceLimits;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/sweep.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Programmable supply
    #[serde(default)]
    pub source: SourceConfig,
    /// Measurement instrument
    #[serde(default)]
    pub meter: MeterConfig,
    /// Number formats on the instrument side and in exported files
    #[serde(default)]
    pub format: FormatConfig,
    /// Default ramp parameters
    #[serde(default)]
    pub ramp: RampConfig,
    /// Default square-wave parameters
    #[serde(default)]
    pub square: SquareConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Directory for exported tables
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Confirm polarity reversals without prompting
    #[serde(default)]
    pub auto_acknowledge: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            output_dir: default_output_dir(),
            auto_acknowledge: false,
        }
    }
}

/// Source instrument definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Registered driver name ("simulated", "scpi-tcp")
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Instrument address, driver specific
    #[serde(default)]
    pub address: Option<String>,
    /// Reply timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum programmable voltage (V)
    #[serde(default = "default_volt_max")]
    pub volt_max: f64,
    /// Maximum programmable current (A)
    #[serde(default = "default_curr_max")]
    pub curr_max: f64,
    /// Over-current protection level (A)
    #[serde(default = "default_curr_max")]
    pub curr_prot_lev: f64,
    /// Driver-specific options
    #[serde(default)]
    pub options: toml::Table,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            address: None,
            timeout_ms: default_timeout_ms(),
            volt_max: default_volt_max(),
            curr_max: default_curr_max(),
            curr_prot_lev: default_curr_max(),
            options: toml::Table::new(),
        }
    }
}

impl SourceConfig {
    /// Limits programmed at initialization.
    pub fn limits(&self) -> SourceLimits {
        SourceLimits {
            volt_max: self.volt_max,
            curr_max: self.curr_max,
            curr_prot_lev: self.curr_prot_lev,
        }
    }
}

/// Meter instrument definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Registered driver name ("simulated", "scpi-tcp")
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Instrument address, driver specific
    #[serde(default)]
    pub address: Option<String>,
    /// Reply timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Driver-specific options
    #[serde(default)]
    pub options: toml::Table,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            address: None,
            timeout_ms: default_timeout_ms(),
            options: toml::Table::new(),
        }
    }
}

/// Number formats
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatConfig {
    /// Decimal separator used in instrument replies
    #[serde(default = "default_decimal_separator")]
    pub instrument_decimal_separator: char,
    /// Column separator of exported tables
    #[serde(default = "default_column_separator")]
    pub column_separator: char,
    /// Decimal separator of exported tables
    #[serde(default = "default_decimal_separator")]
    pub decimal_separator: char,
    /// Fixed decimals in exported tables
    #[serde(default = "default_decimals")]
    pub decimals: usize,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            instrument_decimal_separator: default_decimal_separator(),
            column_separator: default_column_separator(),
            decimal_separator: default_decimal_separator(),
            decimals: default_decimals(),
        }
    }
}

/// Ramp defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RampConfig {
    /// Start voltage (V)
    pub v1: f64,
    /// End voltage (V)
    pub v2: f64,
    /// Step magnitude (V)
    pub step: f64,
    /// Settle delay at normal points (s)
    pub delay_s: f64,
    /// Settle delay at endpoints and after a polarity reversal (s)
    pub endpoint_delay_s: f64,
    /// Sweep v1→v2→v1→−v2→v1
    pub hysteresis: bool,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            v1: 0.0,
            v2: 1.0,
            step: 0.1,
            delay_s: 0.5,
            endpoint_delay_s: 2.0,
            hysteresis: false,
        }
    }
}

impl RampConfig {
    /// Build the ramp plan.
    pub fn plan(&self) -> RampPlan {
        RampPlan {
            v1: self.v1,
            v2: self.v2,
            step: self.step,
            delay: secs(self.delay_s),
            endpoint_delay: secs(self.endpoint_delay_s),
            hysteresis: self.hysteresis,
        }
    }
}

/// Square-wave defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SquareConfig {
    /// First level (V)
    pub v1: f64,
    /// Second level (V)
    pub v2: f64,
    /// Time spent at v1 (s)
    pub dwell_v1_s: f64,
    /// Time spent at v2 (s)
    pub dwell_v2_s: f64,
    /// Number of full cycles, 0 = until stopped
    pub cycles: u32,
    /// Sampling period (s)
    pub measure_period_s: f64,
    /// Settle time after enabling the output (s)
    pub initial_settle_s: f64,
}

impl Default for SquareConfig {
    fn default() -> Self {
        Self {
            v1: 0.0,
            v2: 1.0,
            dwell_v1_s: 5.0,
            dwell_v2_s: 5.0,
            cycles: 1,
            measure_period_s: 0.5,
            initial_settle_s: 2.0,
        }
    }
}

impl SquareConfig {
    /// Build the square-wave plan.
    pub fn plan(&self) -> SquarePlan {
        SquarePlan {
            v1: self.v1,
            v2: self.v2,
            dwell_v1: secs(self.dwell_v1_s),
            dwell_v2: secs(self.dwell_v2_s),
            cycles: self.cycles,
            measure_period: secs(self.measure_period_s),
            initial_settle: secs(self.initial_settle_s),
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_driver() -> String {
    "simulated".to_string()
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_volt_max() -> f64 {
    10.0
}

fn default_curr_max() -> f64 {
    1.0
}

fn default_decimal_separator() -> char {
    '.'
}

fn default_column_separator() -> char {
    ';'
}

fn default_decimals() -> usize {
    6
}

impl SweepConfig {
    /// Load configuration from `config/sweep.toml` and environment variables
    ///
    /// Environment variables can override configuration with prefix SWEEP_DAQ_
    /// Example: SWEEP_DAQ_APPLICATION__LOG_LEVEL=debug
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(SweepConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SWEEP_DAQ_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        let format = &self.format;
        if !format.column_separator.is_ascii() || format.column_separator.is_ascii_alphanumeric()
        {
            return Err(format!(
                "column_separator '{}' must be an ASCII punctuation or whitespace character",
                format.column_separator
            ));
        }
        if format.column_separator == format.decimal_separator {
            return Err(format!(
                "column_separator and decimal_separator are both '{}'",
                format.column_separator
            ));
        }
        for (name, sep) in [
            ("decimal_separator", format.decimal_separator),
            ("instrument_decimal_separator", format.instrument_decimal_separator),
        ] {
            if sep != '.' && sep != ',' {
                return Err(format!("{} must be '.' or ',', got '{}'", name, sep));
            }
        }
        if format.decimals > 12 {
            return Err(format!("decimals must be at most 12, got {}", format.decimals));
        }

        if self.source.volt_max <= 0.0 || self.source.curr_max <= 0.0 {
            return Err("source volt_max and curr_max must be positive".to_string());
        }
        if self.source.curr_prot_lev <= 0.0 || self.source.curr_prot_lev > self.source.curr_max {
            return Err(format!(
                "curr_prot_lev must be in (0, {}], got {}",
                self.source.curr_max, self.source.curr_prot_lev
            ));
        }

        for (name, value) in [
            ("ramp.delay_s", self.ramp.delay_s),
            ("ramp.endpoint_delay_s", self.ramp.endpoint_delay_s),
            ("square.initial_settle_s", self.square.initial_settle_s),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{} must be a non-negative number, got {}", name, value));
            }
        }
        for (name, value) in [
            ("square.dwell_v1_s", self.square.dwell_v1_s),
            ("square.dwell_v2_s", self.square.dwell_v2_s),
            ("square.measure_period_s", self.square.measure_period_s),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(format!("{} must be positive, got {}", name, value));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SweepConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.source.driver, "simulated");
        assert_eq!(config.format.column_separator, ';');
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[source]
driver = "scpi-tcp"
address = "192.168.0.20:30000"
volt_max = 30.0
curr_max = 2.0
curr_prot_lev = 1.5

[format]
decimal_separator = ","

[ramp]
v1 = 0.0
v2 = 2.0
step = 0.05
delay_s = 0.2
endpoint_delay_s = 1.0
hysteresis = true
"#
        )
        .unwrap();

        let config = SweepConfig::load_from(file.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.source.address.as_deref(), Some("192.168.0.20:30000"));
        assert_eq!(config.source.limits().curr_prot_lev, 1.5);
        assert_eq!(config.format.decimal_separator, ',');
        assert_eq!(config.meter.driver, "simulated");

        let plan = config.ramp.plan();
        assert!(plan.hysteresis);
        assert_eq!(plan.delay, Duration::from_millis(200));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = SweepConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.ramp.step, 0.1);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = SweepConfig::default();
        config.application.log_level = "verbose".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.contains("Invalid log_level"));
    }

    #[test]
    fn test_equal_separators_rejected() {
        let mut config = SweepConfig::default();
        config.format.column_separator = ',';
        config.format.decimal_separator = ',';
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_decimal_separator_rejected() {
        let mut config = SweepConfig::default();
        config.format.instrument_decimal_separator = ';';
        assert!(config.validate().unwrap_err().contains("instrument_decimal_separator"));
    }

    #[test]
    fn test_non_positive_period_rejected() {
        let mut config = SweepConfig::default();
        config.square.measure_period_s = 0.0;
        assert!(config.validate().unwrap_err().contains("measure_period_s"));
    }
}
