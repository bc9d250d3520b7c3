//! TTi PL303QMD-P dual-channel bench supply driver.
//!
//! Channels `CH1` and `CH2` map to the wire digits `1` and `2`. The grammar
//! is terse: `V1 5.0` programs a setpoint, `V1O?` reads the live output
//! (suffixed `V`/`A`), `V1?` reads the setpoint back as `V1 5.000`.
//!
//! ## Configuration
//!
//! ```json
//! {
//!   "channels": {
//!     "CH1": {"voltage": 5.0, "current": 0.5},
//!     "CH2": {"voltage": 12.0, "current": 1.0}
//!   }
//! }
//! ```

use super::{effective_config, Identity, Instrument, InstrumentIo, Readings};
use crate::config::InstrumentConfig;
use crate::error::BridgeError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

const CHANNELS: &[(&str, &str)] = &[("CH1", "1"), ("CH2", "2")];

fn wire_channel(name: &str) -> Result<&'static str> {
    CHANNELS
        .iter()
        .find(|(ch, _)| *ch == name)
        .map(|(_, wire)| *wire)
        .ok_or_else(|| BridgeError::InvalidChannel(name.to_string()).into())
}

/// Parse a live reading, dropping the trailing unit character.
fn parse_suffixed(response: &str) -> Result<f64> {
    let trimmed = response.trim();
    let bare = trimmed
        .char_indices()
        .last()
        .map_or(trimmed, |(i, _)| &trimmed[..i]);
    bare.parse::<f64>()
        .with_context(|| format!("Failed to parse reading '{}'", response))
}

/// Parse a setpoint readback of the form `V1 5.000`.
fn parse_setpoint(response: &str) -> Result<f64> {
    response
        .split_whitespace()
        .last()
        .and_then(|v| v.parse::<f64>().ok())
        .with_context(|| format!("Failed to parse setpoint readback '{}'", response))
}

/// Driver for the TTi PL303QMD-P.
pub struct TtiPl303Qmdp {
    name: String,
    identity: Identity,
    config: Value,
    io: Mutex<InstrumentIo>,
}

impl TtiPl303Qmdp {
    /// Registry constructor.
    pub fn connect(
        cfg: &InstrumentConfig,
        io: InstrumentIo,
        identity: Identity,
    ) -> Result<Arc<dyn Instrument>> {
        Ok(Arc::new(Self {
            name: cfg.name.clone(),
            identity,
            config: cfg.config.clone(),
            io: Mutex::new(io),
        }))
    }
}

#[async_trait]
impl Instrument for TtiPl303Qmdp {
    fn name(&self) -> &str {
        &self.name
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn reset(&self) -> Result<()> {
        let io = &mut *self.io.lock().await;
        io.command("*RST").await?;
        io.command("*CLS").await
    }

    async fn read(&self) -> Result<Readings> {
        let io = &mut *self.io.lock().await;
        let mut readings = Readings::new();
        for (ch, wire) in CHANNELS {
            let voltage = parse_suffixed(&io.query(&format!("V{}O?", wire)).await?)?;
            let current = parse_suffixed(&io.query(&format!("I{}O?", wire)).await?)?;
            readings.insert(format!("{}_voltage", ch), voltage);
            readings.insert(format!("{}_current", ch), current);
        }
        Ok(readings)
    }

    async fn get_set_values(&self) -> Result<Readings> {
        let io = &mut *self.io.lock().await;
        let mut values = Readings::new();
        for (ch, wire) in CHANNELS {
            let voltage = parse_setpoint(&io.query(&format!("V{}?", wire)).await?)?;
            let current = parse_setpoint(&io.query(&format!("I{}?", wire)).await?)?;
            values.insert(format!("{}_set_voltage", ch), voltage);
            values.insert(format!("{}_set_current", ch), current);
        }
        Ok(values)
    }

    async fn configure(&self, overrides: Option<&Value>) -> Result<()> {
        let supply = effective_config(overrides, &self.config);
        let io = &mut *self.io.lock().await;

        // Outputs off and a clean slate before programming setpoints.
        io.command("OPALL 0").await?;
        io.command("*RST").await?;
        io.command("*CLS").await?;

        let empty = Value::Object(Default::default());
        let channels = supply.get("channels").unwrap_or(&empty);
        for (ch, wire) in CHANNELS {
            let channel = match channels.get(ch) {
                Some(c) => c,
                None => continue,
            };
            if let Some(voltage) = channel.get("voltage").and_then(Value::as_f64) {
                io.command(&format!("V{} {}", wire, voltage)).await?;
            }
            if let Some(current) = channel.get("current").and_then(Value::as_f64) {
                io.command(&format!("I{} {}", wire, current)).await?;
            }
        }

        Ok(())
    }

    async fn set_output(&self, on: bool, channel: Option<&str>) -> Result<()> {
        let state = if on { 1 } else { 0 };
        let io = &mut *self.io.lock().await;
        match channel {
            None => io.command(&format!("OPALL {}", state)).await,
            Some(ch) => {
                let wire = wire_channel(ch)?;
                io.command(&format!("OP{} {}", wire, state)).await
            }
        }
    }

    async fn set_voltage(&self, volts: f64, channel: Option<&str>) -> Result<()> {
        let channel = channel.ok_or_else(|| {
            BridgeError::InvalidChannel(format!("'{}' requires a channel for set_voltage", self.name))
        })?;
        let wire = wire_channel(channel)?;
        let io = &mut *self.io.lock().await;
        io.command(&format!("V{} {}", wire, volts)).await
    }

    async fn set_current(&self, amps: f64, channel: Option<&str>) -> Result<()> {
        let channel = channel.ok_or_else(|| {
            BridgeError::InvalidChannel(format!("'{}' requires a channel for set_current", self.name))
        })?;
        let wire = wire_channel(channel)?;
        let io = &mut *self.io.lock().await;
        io.command(&format!("I{} {}", wire, amps)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_setpoint_readback() {
        assert_eq!(parse_setpoint("V1 5.000").unwrap(), 5.0);
        assert_eq!(parse_setpoint("I2 0.450\r\n").unwrap(), 0.45);
        assert!(parse_setpoint("V1").is_err());
    }

    #[test]
    fn test_parse_suffixed_reading() {
        assert_eq!(parse_suffixed("4.95V").unwrap(), 4.95);
        assert_eq!(parse_suffixed("0.48A\r\n").unwrap(), 0.48);
    }

    #[test]
    fn test_parse_suffixed_handles_multibyte_unit() {
        assert_eq!(parse_suffixed("0.48µ").unwrap(), 0.48);
        assert!(parse_suffixed("µ").is_err());
    }

    #[test]
    fn test_wire_channel_rejects_unknown() {
        assert_eq!(wire_channel("CH2").unwrap(), "2");
        assert!(wire_channel("CH0").is_err());
    }
}
