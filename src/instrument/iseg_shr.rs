//! iSEG SHR quad-channel high-voltage supply driver.
//!
//! Channels `CH0`..`CH3` map to the wire selectors `(@0)`..`(@3)`. The
//! transport echoes every command back before the payload; the shared
//! [`InstrumentIo`] helper absorbs that, so this driver reads like any other.
//! Measured values carry a trailing unit character (`12.5V`, `0.0005A`) that
//! is stripped before parsing.
//!
//! ## Configuration
//!
//! ```json
//! {
//!   "averaging_steps": "64",
//!   "kill_enable": "0",
//!   "fine_adjust": "1",
//!   "channels": {
//!     "CH1": {
//!       "voltage": 500.0,
//!       "current": 0.0005,
//!       "trip_time": 0.1,
//!       "trip_action": "ramp_down",
//!       "output_polarity": "n",
//!       "ramp_up": 250,
//!       "ramp_down": 500,
//!       "current_range": "AUTO"
//!     }
//!   }
//! }
//! ```

use super::{effective_config, Identity, Instrument, InstrumentIo, Readings};
use crate::config::InstrumentConfig;
use crate::error::BridgeError;
use crate::scpi::{self, SynonymTable};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

const CHANNELS: &[(&str, &str)] = &[("CH0", "0"), ("CH1", "1"), ("CH2", "2"), ("CH3", "3")];

/// Wire selector covering every channel at once.
const ALL_CHANNELS: &str = "(@0-3)";

const TRIP_ACTION: SynonymTable<'static> = &[
    ("0", &["no_action"]),
    ("1", &["ramp_down"]),
    ("2", &["off"]),
    ("3", &["off_module"]),
    ("4", &["disable_trip"]),
];

fn wire_channel(name: &str) -> Result<&'static str> {
    CHANNELS
        .iter()
        .find(|(ch, _)| *ch == name)
        .map(|(_, wire)| *wire)
        .ok_or_else(|| BridgeError::InvalidChannel(name.to_string()).into())
}

/// Parse a measurement reply, dropping the trailing unit character.
fn parse_suffixed(response: &str) -> Result<f64> {
    let trimmed = response.trim();
    let bare = trimmed
        .char_indices()
        .last()
        .map_or(trimmed, |(i, _)| &trimmed[..i]);
    bare.parse::<f64>()
        .with_context(|| format!("Failed to parse measurement '{}'", response))
}

/// Accept a numeric setting given either as a number or a numeric string.
fn numeric(config: &Value, key: &str, default: f64) -> f64 {
    match config.get(key) {
        Some(v) => v
            .as_f64()
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            .unwrap_or(default),
        None => default,
    }
}

/// Driver for the iSEG SHR series.
pub struct IsegShr {
    name: String,
    identity: Identity,
    config: Value,
    io: Mutex<InstrumentIo>,
}

impl IsegShr {
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
impl Instrument for IsegShr {
    fn name(&self) -> &str {
        &self.name
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn reset(&self) -> Result<()> {
        let io = &mut *self.io.lock().await;
        io.command(&format!(":VOLT OFF,{}", ALL_CHANNELS)).await?;
        io.command("*CLS").await?;
        io.command("*RST").await?;
        io.command(&format!(":EVENT CLEAR,{}", ALL_CHANNELS)).await
    }

    async fn read(&self) -> Result<Readings> {
        let io = &mut *self.io.lock().await;
        let mut readings = Readings::new();
        for (ch, wire) in CHANNELS {
            let voltage = parse_suffixed(&io.query(&format!(":MEAS:VOLT? (@{})", wire)).await?)?;
            let current = parse_suffixed(&io.query(&format!(":MEAS:CURR? (@{})", wire)).await?)?;
            let state = io.query(&format!(":READ:VOLT:ON? (@{})", wire)).await?;
            let state: f64 = state
                .trim()
                .parse()
                .with_context(|| format!("Failed to parse output state '{}'", state))?;
            readings.insert(format!("{}_voltage", ch), voltage);
            readings.insert(format!("{}_current", ch), current);
            readings.insert(format!("{}_power_state", ch), state);
        }
        Ok(readings)
    }

    async fn get_set_values(&self) -> Result<Readings> {
        let io = &mut *self.io.lock().await;
        let mut values = Readings::new();
        for (ch, wire) in CHANNELS {
            let voltage = parse_suffixed(&io.query(&format!(":READ:VOLT? (@{})", wire)).await?)?;
            let current = parse_suffixed(&io.query(&format!(":READ:CURR? (@{})", wire)).await?)?;
            values.insert(format!("{}_set_voltage", ch), voltage);
            values.insert(format!("{}_set_current", ch), current);
        }
        Ok(values)
    }

    async fn configure(&self, overrides: Option<&Value>) -> Result<()> {
        let supply = effective_config(overrides, &self.config);
        let io = &mut *self.io.lock().await;

        // Output off and a clean slate before touching any setting.
        io.command(&format!(":VOLT OFF,{}", ALL_CHANNELS)).await?;
        io.command("*RST").await?;
        io.command("*CLS").await?;
        io.command(&format!(":EVENT CLEAR,{}", ALL_CHANNELS)).await?;

        // Module ramp rates: 25% voltage, 200% emergency, 30% current.
        io.command(":CONF:RAMP:VOLT 25").await?;
        io.command(":CONF:RAMP:VOLT:EMCY 200").await?;
        io.command(":CONF:RAMP:CURR 30").await?;

        let averaging = scpi::string_choice(
            supply,
            "averaging_steps",
            &["1", "16", "64", "256", "512", "1024"],
            "64",
        );
        io.command(&format!(":CONF:AVER {}", averaging)).await?;

        let kill = scpi::string_choice(supply, "kill_enable", &["0", "1"], "0");
        io.command(&format!(":CONF:KILL {}", kill)).await?;

        let fine_adjust = scpi::string_choice(supply, "fine_adjust", &["0", "1"], "1");
        io.command(&format!(":CONF:ADJUST {}", fine_adjust)).await?;

        let empty = Value::Object(Default::default());
        let channels = supply.get("channels").unwrap_or(&empty);
        for (ch, wire) in CHANNELS {
            let channel = match channels.get(ch) {
                Some(c) => c,
                None => continue,
            };

            // Trip time is configured in seconds, transmitted in ms.
            let trip_time_ms = (numeric(channel, "trip_time", 0.1) * 1000.0) as i64;
            let trip_action = scpi::resolve_symbol(channel.get("trip_action"), TRIP_ACTION, "4");
            io.command(&format!(":CONF:TRIP:TIME {},(@{})", trip_time_ms, wire))
                .await?;
            io.command(&format!(":CONF:TRIP:ACTION {},(@{})", trip_action, wire))
                .await?;

            // Inhibit functionality stays disabled.
            io.command(&format!(":CONF:INH:ACTION 4,(@{})", wire)).await?;

            let output_mode = scpi::string_choice(channel, "output_mode", &["1", "2", "3"], "1");
            io.command(&format!(":CONF:OUTPUT:MODE {},(@{})", output_mode, wire))
                .await?;

            let polarity = scpi::string_choice(channel, "output_polarity", &["p", "n"], "n");
            io.command(&format!(":CONF:OUTPUT:POL {},(@{})", polarity, wire))
                .await?;

            let ramp_up = numeric(channel, "ramp_up", 250.0) as i64;
            let ramp_down = numeric(channel, "ramp_down", 500.0) as i64;
            io.command(&format!(":CONF:RAMP:VOLT:UP {},(@{})", ramp_up, wire))
                .await?;
            io.command(&format!(":CONF:RAMP:VOLT:DOWN {},(@{})", ramp_down, wire))
                .await?;

            let curr_up = numeric(channel, "current_ramp_up", 2e-3);
            let curr_down = numeric(channel, "current_ramp_down", 4e-3);
            io.command(&format!(":CONF:RAMP:CURR:UP {},(@{})", curr_up, wire))
                .await?;
            io.command(&format!(":CONF:RAMP:CURR:DOWN {},(@{})", curr_down, wire))
                .await?;

            // LOW range is not supported by every unit in the series.
            let current_range = channel
                .get("current_range")
                .and_then(Value::as_str)
                .map(str::to_uppercase)
                .filter(|r| r == "HIGH" || r == "AUTO")
                .unwrap_or_else(|| "AUTO".to_string());
            io.command(&format!(":CONF:RANGE:CURR {},(@{})", current_range, wire))
                .await?;

            let voltage = numeric(channel, "voltage", 0.0);
            let current = numeric(channel, "current", 0.0001);
            io.command(&format!(":VOLT {},(@{})", voltage, wire)).await?;
            io.command(&format!(":CURR {},(@{})", current, wire)).await?;
        }

        Ok(())
    }

    async fn set_output(&self, on: bool, channel: Option<&str>) -> Result<()> {
        let selector = match channel {
            None => ALL_CHANNELS.to_string(),
            Some(ch) => format!("(@{})", wire_channel(ch)?),
        };
        let io = &mut *self.io.lock().await;
        io.command(&format!(
            ":VOLT {},{}",
            if on { "ON" } else { "OFF" },
            selector
        ))
        .await
    }

    async fn set_voltage(&self, volts: f64, channel: Option<&str>) -> Result<()> {
        let channel = channel.ok_or_else(|| {
            BridgeError::InvalidChannel(format!("'{}' requires a channel for set_voltage", self.name))
        })?;
        let wire = wire_channel(channel)?;
        let io = &mut *self.io.lock().await;
        io.command(&format!(":VOLT {},(@{})", volts, wire)).await
    }

    async fn set_current(&self, amps: f64, channel: Option<&str>) -> Result<()> {
        let channel = channel.ok_or_else(|| {
            BridgeError::InvalidChannel(format!("'{}' requires a channel for set_current", self.name))
        })?;
        let wire = wire_channel(channel)?;
        let io = &mut *self.io.lock().await;
        io.command(&format!(":CURR {},(@{})", amps, wire)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suffixed_strips_unit() {
        assert_eq!(parse_suffixed("12.5V\r\n").unwrap(), 12.5);
        assert_eq!(parse_suffixed("5E-4A").unwrap(), 5e-4);
        assert!(parse_suffixed("garbage").is_err());
    }

    #[test]
    fn test_parse_suffixed_handles_multibyte_unit() {
        // A garbled multi-byte unit character must not panic the slice.
        assert_eq!(parse_suffixed("12.5µ").unwrap(), 12.5);
        assert!(parse_suffixed("µ").is_err());
        assert!(parse_suffixed("").is_err());
    }

    #[test]
    fn test_wire_channel_mapping() {
        assert_eq!(wire_channel("CH0").unwrap(), "0");
        assert_eq!(wire_channel("CH3").unwrap(), "3");
        assert!(wire_channel("CH4").is_err());
    }

    #[test]
    fn test_numeric_accepts_strings_and_numbers() {
        let cfg = serde_json::json!({"trip_time": "0.25", "ramp_up": 300});
        assert_eq!(numeric(&cfg, "trip_time", 0.1), 0.25);
        assert_eq!(numeric(&cfg, "ramp_up", 250.0), 300.0);
        assert_eq!(numeric(&cfg, "absent", 0.1), 0.1);
    }
}
