//! SCPI instrument wrappers.
//!
//! `ScpiSource` drives a bench DC supply (ITECH IT6500-class command set) and
//! `ScpiMeter` a resistance DMM (Keithley 2000-class command set) over any
//! [`ScpiTransport`].

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{commands, Meter, ScpiTransport, Source};

/// Text of an empty SCPI error queue entry.
const NO_ERROR: &str = "No error";

/// Output limits programmed by [`ScpiSource::initialize`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceLimits {
    /// Maximum programmable voltage (V)
    pub volt_max: f64,
    /// Maximum programmable current (A)
    pub curr_max: f64,
    /// Over-current protection trip level (A)
    pub curr_prot_lev: f64,
}

impl Default for SourceLimits {
    fn default() -> Self {
        Self {
            volt_max: 10.0,
            curr_max: 1.0,
            curr_prot_lev: 1.0,
        }
    }
}

/// Programmable supply controlled through SCPI.
pub struct ScpiSource<T: ScpiTransport> {
    transport: T,
    limits: SourceLimits,
}

impl<T: ScpiTransport> ScpiSource<T> {
    /// Wrap a transport. Nothing is sent until [`Source::initialize`].
    pub fn new(transport: T, limits: SourceLimits) -> Self {
        Self { transport, limits }
    }

    /// Programmed limits.
    pub fn limits(&self) -> SourceLimits {
        self.limits
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn init_commands(&self) -> Vec<String> {
        vec![
            commands::RESET.to_string(),
            commands::CLEAR_STATUS.to_string(),
            commands::REMOTE.to_string(),
            "VOLT:MIN 0".to_string(),
            format!("VOLT:MAX {}", self.limits.volt_max),
            "CURR:MIN 0".to_string(),
            format!("CURR:MAX {}", self.limits.curr_max),
            "VOLT:PROT:STAT 0".to_string(),
            "CURR:PROT:STAT 1".to_string(),
            format!("CURR:PROT:LEV {}", self.limits.curr_prot_lev),
        ]
    }
}

#[async_trait]
impl<T: ScpiTransport> Source for ScpiSource<T> {
    async fn write(&self, command: &str) -> Result<()> {
        debug!(command, "source write");
        self.transport
            .command(command)
            .await
            .with_context(|| format!("source write '{}' failed", command))
    }

    async fn query(&self, command: &str) -> Result<String> {
        debug!(command, "source query");
        self.transport
            .query(command)
            .await
            .with_context(|| format!("source query '{}' failed", command))
    }

    async fn initialize(&self) -> Result<()> {
        for command in self.init_commands() {
            self.write(&command).await?;
        }

        let status = self.query(commands::ERROR_QUERY).await?;
        if !status.contains(NO_ERROR) {
            bail!("source initialization reported: {}", status.trim());
        }

        info!(
            volt_max = self.limits.volt_max,
            curr_max = self.limits.curr_max,
            curr_prot_lev = self.limits.curr_prot_lev,
            "Source initialized"
        );
        Ok(())
    }

    async fn secure(&self) -> Result<()> {
        for command in [
            commands::OUTPUT_OFF,
            "VOLT 0",
            commands::CLEAR_STATUS,
            commands::LOCAL,
        ] {
            self.write(command).await?;
        }
        info!("Source secured");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.transport.close().await.context("closing source")
    }
}

/// Resistance meter controlled through SCPI.
pub struct ScpiMeter<T: ScpiTransport> {
    transport: T,
}

impl<T: ScpiTransport> ScpiMeter<T> {
    /// Wrap a transport. Call [`ScpiMeter::initialize`] before measuring.
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Configure auto-ranged resistance readings with immediate single triggers.
    pub async fn initialize(&self) -> Result<()> {
        for command in [
            commands::RESET,
            "CONF:RES",
            "RES:RANG:AUTO ON",
            "TRIG:SOUR IMM",
            "TRIG:COUNT 1",
        ] {
            self.transport
                .command(command)
                .await
                .with_context(|| format!("meter write '{}' failed", command))?;
        }
        info!("Meter initialized");
        Ok(())
    }
}

#[async_trait]
impl<T: ScpiTransport> Meter for ScpiMeter<T> {
    async fn measure(&self) -> Result<String> {
        self.transport
            .query(commands::READ)
            .await
            .context("meter READ? failed")
    }

    async fn secure(&self) -> Result<()> {
        self.transport
            .command(commands::LOCAL)
            .await
            .context("meter SYST:LOC failed")?;

        let status = self.transport.query(commands::ERROR_QUERY).await?;
        if !status.contains(NO_ERROR) {
            warn!(status = %status.trim(), "Meter reported an error after securing");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.transport.close().await.context("closing meter")
    }
}
