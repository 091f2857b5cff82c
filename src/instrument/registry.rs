//! Driver registry.
//!
//! Maps the `driver` name of a `[source]` / `[meter]` config section to a
//! factory. The registry is built once at startup; no dynamic lookup happens
//! during a run.
//!
//! ```toml
//! [source]
//! driver = "scpi-tcp"      # matches InstrumentFactory::driver_type()
//! address = "192.168.0.20:30000"
//! ```

use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::scpi::{ScpiMeter, ScpiSource};
use super::sim::{SimulatedMultimeter, SimulatedSupply};
use super::tcp::TcpScpiTransport;
use super::{Meter, Source};
use crate::config::{MeterConfig, SourceConfig};
use crate::error::{AppResult, SweepError};

/// Builds instruments for one driver name.
pub trait InstrumentFactory: Send + Sync + 'static {
    /// Name used in the `driver` config field.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for error messages.
    fn name(&self) -> &'static str;

    /// Check driver-specific settings without touching hardware.
    fn validate_source(&self, _config: &SourceConfig) -> Result<()> {
        Ok(())
    }

    /// Check driver-specific settings without touching hardware.
    fn validate_meter(&self, _config: &MeterConfig) -> Result<()> {
        Ok(())
    }

    /// Connect a source. Initialization happens at the start of each run.
    fn build_source(&self, _config: SourceConfig) -> BoxFuture<'static, Result<Arc<dyn Source>>> {
        let driver = self.driver_type();
        Box::pin(async move { Err(anyhow!("driver '{}' cannot act as a source", driver)) })
    }

    /// Connect and configure a meter.
    fn build_meter(&self, _config: MeterConfig) -> BoxFuture<'static, Result<Arc<dyn Meter>>> {
        let driver = self.driver_type();
        Box::pin(async move { Err(anyhow!("driver '{}' cannot act as a meter", driver)) })
    }
}

/// Registry of instrument factories keyed by driver name.
#[derive(Default)]
pub struct InstrumentRegistry {
    factories: HashMap<&'static str, Arc<dyn InstrumentFactory>>,
}

impl InstrumentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in drivers: `simulated` and `scpi-tcp`.
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        registry.register(SimulatedFactory::new());
        registry.register(TcpScpiFactory);
        registry
    }

    /// Register a factory, replacing any previous one with the same name.
    pub fn register<F: InstrumentFactory>(&mut self, factory: F) {
        let factory: Arc<dyn InstrumentFactory> = Arc::new(factory);
        self.factories.insert(factory.driver_type(), factory);
    }

    /// Registered driver names, sorted.
    pub fn driver_types(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn factory(&self, driver: &str) -> AppResult<&Arc<dyn InstrumentFactory>> {
        self.factories.get(driver).ok_or_else(|| {
            SweepError::Configuration(format!(
                "unknown driver '{}' (available: {})",
                driver,
                self.driver_types().join(", ")
            ))
        })
    }

    /// Build the source described by `config`.
    pub async fn build_source(&self, config: &SourceConfig) -> AppResult<Arc<dyn Source>> {
        let factory = self.factory(&config.driver)?;
        factory
            .validate_source(config)
            .map_err(|e| SweepError::Configuration(format!("{}: {:#}", factory.name(), e)))?;
        factory
            .build_source(config.clone())
            .await
            .map_err(SweepError::transport)
    }

    /// Build the meter described by `config`.
    pub async fn build_meter(&self, config: &MeterConfig) -> AppResult<Arc<dyn Meter>> {
        let factory = self.factory(&config.driver)?;
        factory
            .validate_meter(config)
            .map_err(|e| SweepError::Configuration(format!("{}: {:#}", factory.name(), e)))?;
        factory
            .build_meter(config.clone())
            .await
            .map_err(SweepError::transport)
    }
}

fn option_f64(options: &toml::Table, key: &str, default: f64) -> Result<f64> {
    match options.get(key) {
        None => Ok(default),
        Some(toml::Value::Float(v)) => Ok(*v),
        Some(toml::Value::Integer(v)) => Ok(*v as f64),
        Some(other) => Err(anyhow!("option '{}' must be a number, got {}", key, other)),
    }
}

// =============================================================================
// simulated
// =============================================================================

/// Simulated supply and multimeter.
///
/// The meter built by this factory reads the supply built by the same factory,
/// so resistance follows the programmed voltage.
///
/// Options: `load_ohms` (source), `base_ohms` and `ohms_per_volt` (meter).
pub struct SimulatedFactory {
    supply: SimulatedSupply,
}

impl SimulatedFactory {
    /// Factory with a fresh simulated supply.
    pub fn new() -> Self {
        Self {
            supply: SimulatedSupply::new(100.0),
        }
    }

    /// Handle on the simulated supply shared by built instruments.
    pub fn supply(&self) -> SimulatedSupply {
        self.supply.clone()
    }
}

impl Default for SimulatedFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentFactory for SimulatedFactory {
    fn driver_type(&self) -> &'static str {
        "simulated"
    }

    fn name(&self) -> &'static str {
        "Simulated bench supply / DMM"
    }

    fn validate_source(&self, config: &SourceConfig) -> Result<()> {
        let load = option_f64(&config.options, "load_ohms", 100.0)?;
        if load <= 0.0 {
            return Err(anyhow!("load_ohms must be positive, got {}", load));
        }
        Ok(())
    }

    fn validate_meter(&self, config: &MeterConfig) -> Result<()> {
        option_f64(&config.options, "base_ohms", 1000.0)?;
        option_f64(&config.options, "ohms_per_volt", 0.0)?;
        Ok(())
    }

    fn build_source(&self, config: SourceConfig) -> BoxFuture<'static, Result<Arc<dyn Source>>> {
        let supply = self.supply.clone();
        Box::pin(async move {
            let load = option_f64(&config.options, "load_ohms", 100.0)?;
            let supply = supply
                .with_load_ohms(load)
                .with_rating(config.volt_max.max(60.0));
            let source: Arc<dyn Source> = Arc::new(ScpiSource::new(supply, config.limits()));
            Ok(source)
        })
    }

    fn build_meter(&self, config: MeterConfig) -> BoxFuture<'static, Result<Arc<dyn Meter>>> {
        let supply = self.supply.clone();
        Box::pin(async move {
            let base = option_f64(&config.options, "base_ohms", 1000.0)?;
            let k = option_f64(&config.options, "ohms_per_volt", 0.0)?;
            let dmm = SimulatedMultimeter::new(base).coupled_to(supply, k);
            let meter = ScpiMeter::new(dmm);
            meter.initialize().await?;
            let meter: Arc<dyn Meter> = Arc::new(meter);
            Ok(meter)
        })
    }
}

// =============================================================================
// scpi-tcp
// =============================================================================

/// SCPI instruments on a raw TCP socket.
pub struct TcpScpiFactory;

impl TcpScpiFactory {
    fn address(address: &Option<String>) -> Result<String> {
        address
            .clone()
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| anyhow!("an address (host or host:port) is required"))
    }
}

impl InstrumentFactory for TcpScpiFactory {
    fn driver_type(&self) -> &'static str {
        "scpi-tcp"
    }

    fn name(&self) -> &'static str {
        "SCPI over TCP"
    }

    fn validate_source(&self, config: &SourceConfig) -> Result<()> {
        Self::address(&config.address).map(|_| ())
    }

    fn validate_meter(&self, config: &MeterConfig) -> Result<()> {
        Self::address(&config.address).map(|_| ())
    }

    fn build_source(&self, config: SourceConfig) -> BoxFuture<'static, Result<Arc<dyn Source>>> {
        Box::pin(async move {
            let address = Self::address(&config.address)?;
            let transport =
                TcpScpiTransport::connect(&address, Duration::from_millis(config.timeout_ms))
                    .await?;
            let source: Arc<dyn Source> = Arc::new(ScpiSource::new(transport, config.limits()));
            Ok(source)
        })
    }

    fn build_meter(&self, config: MeterConfig) -> BoxFuture<'static, Result<Arc<dyn Meter>>> {
        Box::pin(async move {
            let address = Self::address(&config.address)?;
            let transport =
                TcpScpiTransport::connect(&address, Duration::from_millis(config.timeout_ms))
                    .await?;
            let meter = ScpiMeter::new(transport);
            meter
                .initialize()
                .await
                .with_context(|| format!("initializing meter at {}", address))?;
            let meter: Arc<dyn Meter> = Arc::new(meter);
            Ok(meter)
        })
    }
}
