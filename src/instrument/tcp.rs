//! SCPI over raw TCP sockets.
//!
//! Bench supplies and DMMs with a LAN interface (or behind a GPIB/LAN gateway)
//! accept newline-terminated SCPI on a raw socket, conventionally port 5025.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::ScpiTransport;

/// Conventional raw-socket SCPI port.
pub const DEFAULT_PORT: u16 = 5025;

/// Default reply timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Line-oriented SCPI transport over TCP.
pub struct TcpScpiTransport {
    stream: Mutex<Option<BufReader<TcpStream>>>,
    address: String,
    timeout: Duration,
}

impl TcpScpiTransport {
    /// Connect to `address` (`host` or `host:port`).
    pub async fn connect(address: &str, reply_timeout: Duration) -> Result<Self> {
        let address = if address.contains(':') {
            address.to_string()
        } else {
            format!("{}:{}", address, DEFAULT_PORT)
        };

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&address))
            .await
            .with_context(|| format!("Connection timeout to {}", address))?
            .with_context(|| format!("Failed to connect to {}", address))?;
        stream.set_nodelay(true)?;

        tracing::info!(%address, "Connected to SCPI instrument");

        Ok(Self {
            stream: Mutex::new(Some(BufReader::new(stream))),
            address,
            timeout: reply_timeout,
        })
    }

    /// Resolved `host:port`.
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn send(stream: &mut BufReader<TcpStream>, line: &str) -> Result<()> {
        let framed = format!("{}\n", line);
        stream
            .get_mut()
            .write_all(framed.as_bytes())
            .await
            .with_context(|| format!("Failed to write: {}", line))?;
        stream.get_mut().flush().await.context("Failed to flush stream")
    }
}

#[async_trait]
impl ScpiTransport for TcpScpiTransport {
    async fn query(&self, command: &str) -> Result<String> {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            bail!("{} is closed", self.address);
        };

        Self::send(stream, command).await?;

        let mut response = String::new();
        let read = timeout(self.timeout, stream.read_line(&mut response)).await;
        if !matches!(read, Ok(Ok(n)) if n > 0) {
            // a late reply would otherwise answer the next query
            guard.take();
            tracing::warn!(address = %self.address, command, "Dropping SCPI connection after failed read");
        }

        match read {
            Ok(Ok(0)) => bail!("Connection closed by {}", self.address),
            Ok(Ok(_)) => {
                tracing::trace!(command, response = %response.trim(), "SCPI reply");
                Ok(response)
            }
            Ok(Err(e)) => Err(e).context("Failed to read response"),
            Err(_) => bail!("Timeout waiting for response to: {}", command),
        }
    }

    async fn command(&self, command: &str) -> Result<()> {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            bail!("{} is closed", self.address);
        };
        Self::send(stream, command).await
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut stream) = self.stream.lock().await.take() {
            stream.get_mut().shutdown().await.ok();
            tracing::info!(address = %self.address, "SCPI connection closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_query_round_trip_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket);
            let mut received = Vec::new();
            loop {
                let mut line = String::new();
                if lines.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                let line = line.trim().to_string();
                if line == "READ?" {
                    lines.get_mut().write_all(b"+1.000E+03\n").await.unwrap();
                }
                received.push(line);
            }
            received
        });

        let transport = TcpScpiTransport::connect(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        transport.command("CONF:RES").await.unwrap();
        let reply = transport.query("READ?").await.unwrap();
        assert_eq!(reply.trim(), "+1.000E+03");
        transport.close().await.unwrap();
        assert!(transport.command("CONF:RES").await.is_err());

        assert_eq!(server.await.unwrap(), vec!["CONF:RES", "READ?"]);
    }

    #[tokio::test]
    async fn test_timeout_drops_connection_instead_of_keeping_late_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket);
            let mut line = String::new();
            lines.read_line(&mut line).await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            // late reply, nobody reads it
            let _ = lines.get_mut().write_all(b"+1.000E+03\n").await;
            line.clear();
            lines.read_line(&mut line).await.unwrap_or(0)
        });

        let transport = TcpScpiTransport::connect(&addr.to_string(), Duration::from_millis(100))
            .await
            .unwrap();

        let err = transport.query("READ?").await.unwrap_err();
        assert!(err.to_string().contains("Timeout"));

        tokio::time::sleep(Duration::from_millis(400)).await;
        let err = transport.query("READ?").await.unwrap_err();
        assert!(err.to_string().contains("is closed"));

        // the server sees end of stream, no second query
        assert_eq!(server.await.unwrap(), 0);
    }
}
