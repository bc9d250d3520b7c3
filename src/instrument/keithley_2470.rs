//! Keithley 2470 source-measure unit driver.
//!
//! Single-channel SMU sourcing voltage or current and measuring the
//! complement. ASCII command/response grammar over USB-TMC or serial.
//!
//! ## Configuration
//!
//! ```json
//! {
//!   "source": "voltage",
//!   "source_range": 200,
//!   "source_limit": 550,
//!   "voltage_range": "auto",
//!   "current_range": 10,
//!   "overvoltage_protection": "PROT200",
//!   "off_state": "himp",
//!   "terminals": "rear",
//!   "remote_sense": false,
//!   "nplc": 2,
//!   "precision": 0,
//!   "compliance_voltage": 15,
//!   "compliance_current": 8
//! }
//! ```
//!
//! Currents are configured in microamps and normalized to amps before
//! transmission. Out-of-domain values fall back to per-parameter defaults;
//! `configure` never fails on bad settings.

use super::{effective_config, Identity, Instrument, InstrumentIo, Readings};
use crate::config::InstrumentConfig;
use crate::error::BridgeError;
use crate::scpi::{self, SynonymTable};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::warn;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

const OFF_STATE: SynonymTable<'static> = &[
    ("NORM", &["normal", "norm"]),
    ("ZERO", &["zero"]),
    ("HIMP", &["himpedance", "high impedance", "himp"]),
    ("GUAR", &["guard", "guar"]),
];

const TERMINALS: SynonymTable<'static> = &[("FRON", &["fron", "front"]), ("REAR", &["rear"])];

const REMOTE_SENSE: SynonymTable<'static> =
    &[("ON", &["on", "true"]), ("OFF", &["off", "false"])];

const VOLTAGE_PROTECTION: &[&str] = &[
    "PROT20", "PROT40", "PROT100", "PROT200", "PROT300", "PROT400", "NONE",
];

/// Source/measure voltage ranges, in volts.
const VOLTAGE_RANGES: &[f64] = &[0.2, 2.0, 20.0, 200.0, 1000.0];

/// Source/measure current ranges, in microamps.
const CURRENT_RANGES_UA: &[f64] = &[
    0.01, 0.1, 1.0, 10.0, 100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0,
];

struct Inner {
    io: InstrumentIo,
    /// Clamp magnitude for set_voltage/set_current, from `source_limit`.
    source_limit: Option<f64>,
}

/// Driver for the Keithley 2470 SMU.
pub struct Keithley2470 {
    name: String,
    identity: Identity,
    config: Value,
    inner: Mutex<Inner>,
}

impl Keithley2470 {
    /// Registry constructor.
    pub fn connect(
        cfg: &InstrumentConfig,
        io: InstrumentIo,
        identity: Identity,
    ) -> Result<Arc<dyn Instrument>> {
        let config = cfg.config.clone();
        let source_limit = scpi::magnitude(&config, "source_limit");
        Ok(Arc::new(Self {
            name: cfg.name.clone(),
            identity,
            config,
            inner: Mutex::new(Inner { io, source_limit }),
        }))
    }

    fn reject_channel(&self, channel: Option<&str>) -> Result<()> {
        if let Some(channel) = channel {
            return Err(BridgeError::InvalidChannel(format!(
                "'{}' is single-channel, got channel '{}'",
                self.name, channel
            ))
            .into());
        }
        Ok(())
    }

    fn clamp_to_limit(&self, requested: f64, limit: Option<f64>) -> f64 {
        match limit {
            Some(limit) if requested.abs() > limit => limit.copysign(requested),
            _ => requested,
        }
    }
}

async fn query_f64(io: &mut InstrumentIo, command: &str) -> Result<f64> {
    let response = io.query(command).await?;
    response
        .trim()
        .parse::<f64>()
        .with_context(|| format!("Failed to parse response to {}: '{}'", command, response))
}

/// Resolve a source or measure range setting: "auto" passes through, numeric
/// values must sit on the device's range ladder or fall back to `default`.
fn resolve_range(config: &Value, key: &str, ranges: &[f64], default: f64) -> Option<f64> {
    match config.get(key) {
        None => Some(default),
        Some(v) => {
            if v.as_str().map(str::to_lowercase).as_deref() == Some("auto") {
                None
            } else {
                match v.as_f64() {
                    Some(n) if ranges.contains(&n) => Some(n),
                    _ => Some(default),
                }
            }
        }
    }
}

#[async_trait]
impl Instrument for Keithley2470 {
    fn name(&self) -> &str {
        &self.name
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn reset(&self) -> Result<()> {
        let inner = &mut *self.inner.lock().await;
        inner.io.command("*CLS").await?;
        inner.io.command("*RST").await
    }

    async fn read(&self) -> Result<Readings> {
        let inner = &mut *self.inner.lock().await;
        let voltage = query_f64(&mut inner.io, "MEAS:VOLT?").await?;
        let current = query_f64(&mut inner.io, "MEAS:CURR?").await?;
        let power_state = query_f64(&mut inner.io, "OUTP?").await?;

        let mut readings = Readings::new();
        readings.insert("voltage".to_string(), voltage);
        readings.insert("current".to_string(), current);
        readings.insert("power_state".to_string(), power_state);
        Ok(readings)
    }

    async fn get_set_values(&self) -> Result<Readings> {
        let inner = &mut *self.inner.lock().await;
        let voltage = query_f64(&mut inner.io, "SOUR:VOLT?").await?;
        let current = query_f64(&mut inner.io, "SOUR:CURR?").await?;

        let mut values = Readings::new();
        values.insert("set_voltage".to_string(), voltage);
        values.insert("set_current".to_string(), current);
        Ok(values)
    }

    async fn configure(&self, overrides: Option<&Value>) -> Result<()> {
        let supply = effective_config(overrides, &self.config);
        let inner = &mut *self.inner.lock().await;
        let io = &mut inner.io;

        // Output off and a clean slate before touching any setting.
        io.command("OUTP OFF").await?;
        io.command("*RST").await?;
        io.command("SYST:CLE").await?;

        let source = match supply.get("source").and_then(Value::as_str) {
            Some(s) if s.eq_ignore_ascii_case("current") => "current",
            _ => "voltage",
        };

        let source_range = if source == "current" {
            // Configured in microamps.
            resolve_range(supply, "source_range", CURRENT_RANGES_UA, 10.0).map(|ua| ua * 1e-6)
        } else {
            resolve_range(supply, "source_range", VOLTAGE_RANGES, 20.0)
        };

        inner.source_limit = scpi::magnitude(supply, "source_limit");

        let voltage_measure_range = resolve_range(supply, "voltage_range", VOLTAGE_RANGES, 20.0);
        let current_measure_range =
            resolve_range(supply, "current_range", CURRENT_RANGES_UA, 10.0).map(|ua| ua * 1e-6);

        let io = &mut inner.io;

        // Measure function first, then source function; the manual notes the
        // measure selection can change the source selection.
        if source == "voltage" {
            io.command("SENS:FUNC \"CURR\"").await?;
            match current_measure_range {
                None => io.command("SENS:CURR:RANG:AUTO ON").await?,
                Some(range) => {
                    io.command("SENS:CURR:RANG:AUTO OFF").await?;
                    io.command(&format!("SENS:CURR:RANG {}", range)).await?;
                }
            }

            io.command("SOUR:FUNC VOLT").await?;
            match source_range {
                None => io.command("SOUR:VOLT:RANG:AUTO ON").await?,
                Some(range) => {
                    io.command("SOUR:VOLT:RANG:AUTO OFF").await?;
                    io.command(&format!("SOUR:VOLT:RANG {}", range)).await?;
                }
            }

            // Read back the actual value, not the programmed one.
            io.command("SOUR:VOLT:READ:BACK ON").await?;
            io.command("SOUR:VOLT:HIGH:CAP ON").await?;
        } else {
            io.command("SENS:FUNC \"VOLT\"").await?;
            match voltage_measure_range {
                None => io.command("SENS:VOLT:RANG:AUTO ON").await?,
                Some(range) => {
                    io.command("SENS:VOLT:RANG:AUTO OFF").await?;
                    io.command(&format!("SENS:VOLT:RANG {}", range)).await?;
                }
            }

            io.command("SOUR:FUNC CURR").await?;
            match source_range {
                None => io.command("SOUR:CURR:RANG:AUTO ON").await?,
                Some(range) => {
                    io.command("SOUR:CURR:RANG:AUTO OFF").await?;
                    io.command(&format!("SOUR:CURR:RANG {}", range)).await?;
                }
            }

            io.command("SOUR:CURR:READ:BACK ON").await?;
            io.command("SOUR:CURR:HIGH:CAP ON").await?;
        }

        // Protection before polarity/ramps/setpoints so the device is never
        // armed with defaults it should not have.
        let overvoltage = supply
            .get("overvoltage_protection")
            .and_then(Value::as_str)
            .map(str::to_uppercase)
            .filter(|v| VOLTAGE_PROTECTION.contains(&v.as_str()))
            .unwrap_or_else(|| "NONE".to_string());
        io.command(&format!("SOUR:VOLT:PROT {}", overvoltage)).await?;

        let off_state = scpi::resolve_symbol(supply.get("off_state"), OFF_STATE, "NORM");
        io.command(&format!("OUTP:SMOD {}", off_state)).await?;

        let terminals = scpi::resolve_symbol(supply.get("terminals"), TERMINALS, "FRON");
        io.command(&format!("ROUT:TERM {}", terminals)).await?;

        let remote = scpi::resolve_symbol(supply.get("remote_sense"), REMOTE_SENSE, "OFF");
        io.command(&format!("SENS:CURR:RSEN {}", remote)).await?;
        io.command(&format!("SENS:VOLT:RSEN {}", remote)).await?;

        io.command("SENS:AVER OFF").await?;
        io.command("SENS:CURR:AZER ON").await?;
        io.command("SENS:VOLT:AZER ON").await?;

        let nplc = scpi::numeric_in_range(supply, "nplc", 0.01, 10.0, 2.0, 1.0);
        io.command(&format!("SENS:NPLC {}", nplc)).await?;

        let precision = scpi::numeric_in_range(supply, "precision", 0.0, 16.0, 0.0, 0.0);
        io.command(&format!("FORM:ASC:PREC {}", precision as i64)).await?;

        // Compliance limits: current limit for a voltage source and vice
        // versa. The current figure is configured in microamps.
        let compliance_voltage =
            scpi::numeric_in_range(supply, "compliance_voltage", -1100.0, 1100.0, 15.0, 15.0);
        io.command(&format!("SOUR:CURR:VLIM {}", compliance_voltage))
            .await?;

        let compliance_current =
            scpi::numeric_in_range(supply, "compliance_current", -1.05e6, 1.05e6, 8.0, 8.0) * 1e-6;
        io.command(&format!("SOUR:VOLT:ILIM {}", compliance_current))
            .await?;

        Ok(())
    }

    async fn set_output(&self, on: bool, channel: Option<&str>) -> Result<()> {
        self.reject_channel(channel)?;
        let inner = &mut *self.inner.lock().await;
        inner
            .io
            .command(if on { "OUTP ON" } else { "OUTP OFF" })
            .await
    }

    async fn set_voltage(&self, volts: f64, channel: Option<&str>) -> Result<()> {
        self.reject_channel(channel)?;
        let inner = &mut *self.inner.lock().await;
        let volts = self.clamp_to_limit(volts, inner.source_limit);

        if inner.io.query("SOUR:FUNC?").await?.contains("VOLT") {
            inner.io.command(&format!("SOUR:VOLT {}", volts)).await
        } else {
            warn!(
                "'{}': tried to set voltage while sourcing current; ignored",
                self.name
            );
            Ok(())
        }
    }

    async fn set_current(&self, amps: f64, channel: Option<&str>) -> Result<()> {
        self.reject_channel(channel)?;
        let inner = &mut *self.inner.lock().await;
        let amps = self.clamp_to_limit(amps, inner.source_limit);

        if inner.io.query("SOUR:FUNC?").await?.contains("CURR") {
            inner.io.command(&format!("SOUR:CURR {}", amps)).await
        } else {
            warn!(
                "'{}': tried to set current while sourcing voltage; ignored",
                self.name
            );
            Ok(())
        }
    }
}
