//! Polarity-reversal interlock.
//!
//! The supply only programs magnitudes, so a sign change in a ramp means the
//! operator has to swap the leads. At each synthetic zero between two setpoints
//! of opposite sign the engine hands control to [`Interlock::engage`]:
//!
//! 1. the output is switched off,
//! 2. an [`AcknowledgmentGate`] asks the operator to confirm (no timeout),
//! 3. unless the run was stopped meanwhile, the output comes back at 0 V.
//!
//! The engine then settles and samples the zero point like any other.

use anyhow::anyhow;
use async_trait::async_trait;
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::error::{AppResult, SweepError};
use crate::instrument::{commands, Source};
use crate::safety::CancellationToken;

/// Asks an operator to confirm a manual step.
///
/// `Ok(())` means confirmed. An error means the step was refused or the
/// operator channel is gone; the run is then cancelled.
#[async_trait]
pub trait AcknowledgmentGate: Send + Sync {
    /// Block until the operator confirms `message`.
    async fn confirm(&self, message: &str) -> anyhow::Result<()>;
}

/// Confirms immediately. For headless runs with a relay or a reversible load.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAcknowledge;

#[async_trait]
impl AcknowledgmentGate for AutoAcknowledge {
    async fn confirm(&self, message: &str) -> anyhow::Result<()> {
        info!(message, "Acknowledged automatically");
        Ok(())
    }
}

/// Prompts on stderr and waits for a line on stdin.
///
/// An empty line or `y` confirms; `n`, `q` or end of input refuse.
///
/// The read runs on a blocking thread and cannot be interrupted. A stop makes
/// the interlock stop waiting on it; the thread itself lingers until a line
/// arrives, so the binary shuts its runtime down with a timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinAcknowledge;

#[async_trait]
impl AcknowledgmentGate for StdinAcknowledge {
    async fn confirm(&self, message: &str) -> anyhow::Result<()> {
        eprintln!("\n{}\nPress Enter to continue, 'q' to stop.", message);

        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            let read = std::io::stdin().lock().read_line(&mut line)?;
            Ok::<_, std::io::Error>((read, line))
        })
        .await??;

        match line {
            (0, _) => Err(anyhow!("stdin closed")),
            (_, answer) => match answer.trim().to_lowercase().as_str() {
                "" | "y" | "yes" => Ok(()),
                other => Err(anyhow!("operator answered '{}'", other)),
            },
        }
    }
}

/// A confirmation request delivered to a UI or controller task.
#[derive(Debug)]
pub struct AckRequest {
    /// Text to show to the operator
    pub message: String,
    responder: oneshot::Sender<bool>,
}

impl AckRequest {
    /// Confirm the step.
    pub fn acknowledge(self) {
        let _ = self.responder.send(true);
    }

    /// Refuse the step; the run is cancelled.
    pub fn refuse(self) {
        let _ = self.responder.send(false);
    }
}

/// Forwards confirmations over an mpsc channel.
///
/// Dropping an [`AckRequest`] without answering counts as a refusal.
#[derive(Debug, Clone)]
pub struct ChannelAcknowledge {
    requests: mpsc::Sender<AckRequest>,
}

impl ChannelAcknowledge {
    /// Create the gate and the receiving end for the operator side.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AckRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { requests: tx }, rx)
    }
}

#[async_trait]
impl AcknowledgmentGate for ChannelAcknowledge {
    async fn confirm(&self, message: &str) -> anyhow::Result<()> {
        let (responder, answer) = oneshot::channel();
        self.requests
            .send(AckRequest {
                message: message.to_string(),
                responder,
            })
            .await
            .map_err(|_| anyhow!("acknowledgment receiver dropped"))?;

        match answer.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(anyhow!("operator refused")),
            Err(_) => Err(anyhow!("acknowledgment request dropped")),
        }
    }
}

/// What the engine should do after the interlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterlockOutcome {
    /// Output is back on at 0 V; settle and sample the zero point.
    Resumed,
    /// The run was stopped; the output stays off.
    Stopped,
}

/// Output-off / confirm / re-enable handshake at polarity reversals.
#[derive(Clone)]
pub struct Interlock {
    gate: Arc<dyn AcknowledgmentGate>,
}

impl Interlock {
    /// Interlock confirming through `gate`.
    pub fn new(gate: Arc<dyn AcknowledgmentGate>) -> Self {
        Self { gate }
    }

    /// Run the handshake for a reversal from `from` V to `to` V.
    pub async fn engage(
        &self,
        source: &dyn Source,
        token: &CancellationToken,
        from: f64,
        to: f64,
    ) -> AppResult<InterlockOutcome> {
        source
            .write(commands::OUTPUT_OFF)
            .await
            .map_err(SweepError::transport)?;

        let message = format!(
            "Polarity reversal {} V -> {} V: output is OFF, reverse the source connections.",
            from, to
        );
        info!(from, to, "Polarity interlock engaged");

        tokio::select! {
            answer = self.gate.confirm(&message) => {
                if let Err(e) = answer {
                    warn!(error = %e, "Polarity reversal not acknowledged");
                    token.cancel(format!("polarity reversal not acknowledged: {:#}", e));
                }
            }
            _ = token.cancelled() => {}
        }

        if token.is_cancelled() {
            info!("Stopped during polarity interlock, output left off");
            return Ok(InterlockOutcome::Stopped);
        }

        source
            .write(&commands::set_voltage(0.0))
            .await
            .map_err(SweepError::transport)?;
        source
            .write(commands::OUTPUT_ON)
            .await
            .map_err(SweepError::transport)?;

        info!("Polarity reversal acknowledged, output re-enabled");
        Ok(InterlockOutcome::Resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::scpi::{ScpiSource, SourceLimits};
    use crate::instrument::sim::SimulatedSupply;

    fn source() -> (SimulatedSupply, ScpiSource<SimulatedSupply>) {
        let supply = SimulatedSupply::new(100.0);
        (supply.clone(), ScpiSource::new(supply, SourceLimits::default()))
    }

    #[tokio::test]
    async fn test_auto_acknowledge_re_enables_output() {
        let (supply, source) = source();
        let token = CancellationToken::new();
        let interlock = Interlock::new(Arc::new(AutoAcknowledge));

        let outcome = interlock.engage(&source, &token, 0.5, -0.5).await.unwrap();

        assert_eq!(outcome, InterlockOutcome::Resumed);
        assert_eq!(supply.command_log(), vec!["OUTP OFF", "VOLT 0", "OUTP ON"]);
        assert!(supply.output_enabled());
    }

    #[tokio::test]
    async fn test_channel_gate_waits_for_operator() {
        let (supply, source) = source();
        let token = CancellationToken::new();
        let (gate, mut requests) = ChannelAcknowledge::new(1);
        let interlock = Interlock::new(Arc::new(gate));

        let operator = {
            let supply = supply.clone();
            tokio::spawn(async move {
                let request = requests.recv().await.unwrap();
                assert!(request.message.contains("reverse"));
                // output must already be off while the operator rewires
                assert!(!supply.output_enabled());
                assert_eq!(supply.command_log(), vec!["OUTP OFF"]);
                request.acknowledge();
            })
        };

        let outcome = interlock.engage(&source, &token, -1.0, 1.0).await.unwrap();
        operator.await.unwrap();
        assert_eq!(outcome, InterlockOutcome::Resumed);
        assert!(supply.output_enabled());
    }

    #[tokio::test]
    async fn test_refusal_cancels_run_and_keeps_output_off() {
        let (supply, source) = source();
        let token = CancellationToken::new();
        let (gate, mut requests) = ChannelAcknowledge::new(1);
        let interlock = Interlock::new(Arc::new(gate));

        tokio::spawn(async move {
            requests.recv().await.unwrap().refuse();
        });

        let outcome = interlock.engage(&source, &token, 1.0, -1.0).await.unwrap();
        assert_eq!(outcome, InterlockOutcome::Stopped);
        assert!(token.is_cancelled());
        assert!(token.reason().unwrap().contains("not acknowledged"));
        assert_eq!(supply.command_log(), vec!["OUTP OFF"]);
    }

    #[tokio::test]
    async fn test_dropped_request_counts_as_refusal() {
        let (_supply, source) = source();
        let token = CancellationToken::new();
        let (gate, mut requests) = ChannelAcknowledge::new(1);
        let interlock = Interlock::new(Arc::new(gate));

        tokio::spawn(async move {
            drop(requests.recv().await);
        });

        let outcome = interlock.engage(&source, &token, 1.0, -1.0).await.unwrap();
        assert_eq!(outcome, InterlockOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_stop_while_waiting_for_operator() {
        let (supply, source) = source();
        let token = CancellationToken::new();
        let (gate, mut requests) = ChannelAcknowledge::new(1);
        let interlock = Interlock::new(Arc::new(gate));

        let stopper = token.clone();
        tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            stopper.cancel("operator stop");
            // confirming after the stop must not re-enable the output
            request.acknowledge();
        });

        let outcome = interlock.engage(&source, &token, 1.0, -1.0).await.unwrap();
        assert_eq!(outcome, InterlockOutcome::Stopped);
        assert_eq!(token.reason().as_deref(), Some("operator stop"));
        assert!(!supply.output_enabled());
        assert!(!supply.command_log().contains(&"OUTP ON".to_string()));
    }

    /// Gate that reads from a blocking source nobody answers, like stdin.
    struct BlockedReader(Arc<std::sync::Mutex<std::sync::mpsc::Receiver<()>>>);

    #[async_trait]
    impl AcknowledgmentGate for BlockedReader {
        async fn confirm(&self, _message: &str) -> anyhow::Result<()> {
            let input = self.0.clone();
            tokio::task::spawn_blocking(move || input.lock().ok().map(|rx| rx.recv()))
                .await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_releases_run_blocked_on_prompt() {
        let (supply, source) = source();
        let token = CancellationToken::new();
        let (unblock, blocked) = std::sync::mpsc::channel();
        let gate = BlockedReader(Arc::new(std::sync::Mutex::new(blocked)));
        let interlock = Interlock::new(Arc::new(gate));

        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            stopper.cancel("interrupted by user");
        });

        let outcome = interlock.engage(&source, &token, 1.0, -1.0).await.unwrap();
        assert_eq!(outcome, InterlockOutcome::Stopped);
        assert_eq!(supply.command_log(), vec!["OUTP OFF"]);
        drop(unblock);
    }
}
