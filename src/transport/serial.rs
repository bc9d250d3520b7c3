//! Serial-port transport backend.
//!
//! Wraps the `serialport` crate behind the [`ResourceManager`] and
//! [`WireResource`] seams. All blocking port I/O runs on the blocking thread
//! pool via `spawn_blocking`, never on a runtime worker. Reads poll the port
//! with a short internal timeout and accumulate bytes until the read
//! termination appears or the overall deadline passes, so a silent instrument
//! surfaces as a timeout error instead of a hang.

use super::{ResourceManager, WireResource};
use crate::error::BridgeError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use serialport::SerialPort;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Poll slice for the blocking reads underneath the async surface.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Resource manager backed by the host's serial ports.
pub struct SerialResourceManager {
    baud_rate: u32,
    default_timeout: Duration,
}

impl SerialResourceManager {
    /// Create a manager opening ports at `baud_rate`.
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            default_timeout: Duration::from_secs(2),
        }
    }
}

impl Default for SerialResourceManager {
    fn default() -> Self {
        Self::new(9600)
    }
}

#[async_trait]
impl ResourceManager for SerialResourceManager {
    async fn list_resources(&self) -> Result<Vec<String>> {
        let ports = tokio::task::spawn_blocking(serialport::available_ports)
            .await
            .context("Port enumeration task failed")??;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    async fn open(&self, address: &str) -> Result<Box<dyn WireResource>> {
        let port = serialport::new(address, self.baud_rate)
            .timeout(POLL_TIMEOUT)
            .open()
            .with_context(|| {
                format!(
                    "Failed to open serial port '{}' at {} baud",
                    address, self.baud_rate
                )
            })?;
        debug!("Serial port '{}' opened at {} baud", address, self.baud_rate);

        Ok(Box::new(SerialResource {
            address: address.to_string(),
            port: Arc::new(Mutex::new(port)),
            timeout: self.default_timeout,
            read_termination: "\n".to_string(),
            write_termination: "\n".to_string(),
        }))
    }
}

/// One open serial connection.
///
/// The port sits behind an `Arc<Mutex<_>>` so each transaction can move a
/// handle onto the blocking pool.
pub struct SerialResource {
    address: String,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
    timeout: Duration,
    read_termination: String,
    write_termination: String,
}

fn read_line_blocking(
    port: &mut dyn SerialPort,
    address: &str,
    termination: &str,
    timeout: Duration,
) -> Result<String> {
    let deadline = Instant::now() + timeout;
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 64];
    let terminator = termination.as_bytes();

    loop {
        match port.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.ends_with(terminator) {
                    buffer.truncate(buffer.len() - terminator.len());
                    return Ok(String::from_utf8_lossy(&buffer).into_owned());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Read failed on serial port '{}'", address));
            }
        }
        if Instant::now() >= deadline {
            return Err(BridgeError::WireTimeout(address.to_string()).into());
        }
    }
}

#[async_trait]
impl WireResource for SerialResource {
    async fn write(&mut self, command: &str) -> Result<()> {
        let line = format!("{}{}", command, self.write_termination);
        let address = self.address.clone();
        let command = command.to_string();
        let port = Arc::clone(&self.port);

        // Blocking serial I/O belongs on the blocking pool.
        tokio::task::spawn_blocking(move || {
            let mut port = port.blocking_lock();
            port.write_all(line.as_bytes())
                .with_context(|| format!("Write failed on serial port '{}'", address))?;
            port.flush()
                .with_context(|| format!("Flush failed on serial port '{}'", address))?;
            debug!("[{}] sent: {}", address, command);
            Ok(())
        })
        .await
        .context("Serial I/O task panicked")?
    }

    async fn read(&mut self) -> Result<String> {
        let address = self.address.clone();
        let termination = self.read_termination.clone();
        let timeout = self.timeout;
        let port = Arc::clone(&self.port);

        tokio::task::spawn_blocking(move || {
            let mut port = port.blocking_lock();
            let response = read_line_blocking(port.as_mut(), &address, &termination, timeout)?;
            debug!("[{}] received: {}", address, response);
            Ok(response)
        })
        .await
        .context("Serial I/O task panicked")?
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;
        self.read().await
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn set_read_termination(&mut self, termination: &str) {
        self.read_termination = termination.to_string();
    }

    fn set_write_termination(&mut self, termination: &str) {
        self.write_termination = termination.to_string();
    }

    fn address(&self) -> &str {
        &self.address
    }
}
