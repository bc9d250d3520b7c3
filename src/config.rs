//! Configuration file loading.
//!
//! Two JSON files drive the daemon:
//!
//! - the instrument file, passed with `--config`, describing every device the
//!   daemon should discover and serve;
//! - the optional bus file, passed with `--mqtt`, describing the broker and
//!   topic roots. Without it the daemon runs in log-only mode.
//!
//! ## Instrument file example
//!
//! ```json
//! {
//!   "instruments": [
//!     {
//!       "name": "smu1",
//!       "type": "Keithley2470",
//!       "serial_number": "04473422",
//!       "config": { "source": "voltage", "source_limit": 200, "nplc": 2 }
//!     },
//!     {
//!       "name": "hv1",
//!       "type": "ISEGSHR",
//!       "resource": "/dev/ttyUSB3",
//!       "serial_number": "8210059",
//!       "read_termination": "\r\n",
//!       "config": {
//!         "channels": {
//!           "CH0": { "voltage": 120.0, "current": 0.0001, "trip_action": "ramp_down" }
//!         }
//!       }
//!     }
//!   ]
//! }
//! ```
//!
//! Descriptors are immutable after load; the type-specific `config` object is
//! kept as raw JSON and interpreted by the matching driver.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// One instrument descriptor from the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentConfig {
    /// Unique key, also used as the topic segment for this instrument.
    pub name: String,

    /// Driver type tag, resolved through the instrument registry.
    #[serde(rename = "type")]
    pub type_tag: String,

    /// Serial number used for discovery and identity verification.
    #[serde(default)]
    pub serial_number: Option<String>,

    /// Explicit resource address, bypassing discovery.
    #[serde(default)]
    pub resource: Option<String>,

    /// Read termination override for transports that need one.
    #[serde(default)]
    pub read_termination: Option<String>,

    /// Write termination override.
    #[serde(default)]
    pub write_termination: Option<String>,

    /// Type-specific settings, possibly per channel. Interpreted by the driver.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Top-level instrument configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentsFile {
    pub instruments: Vec<InstrumentConfig>,

    /// Addresses excluded from discovery. Some onboard serial ports hang the
    /// identification query indefinitely, so they are skipped wholesale.
    #[serde(default = "default_skip_resources")]
    pub skip_resources: Vec<String>,
}

/// Blocklist applied when the config file does not set `skip_resources`.
pub fn default_skip_resources() -> Vec<String> {
    vec!["/dev/ttyS0".to_string(), "/dev/ttyAMA0".to_string()]
}

impl InstrumentsFile {
    /// Load and parse the instrument file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read instrument config '{}'", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse instrument config '{}'", path.display()))
    }
}

/// Message-bus configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Broker hostname or address.
    pub broker: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Topic root for outbound readings (`{readings_topic}/{name}`).
    #[serde(default = "default_readings_topic")]
    pub readings_topic: String,

    /// Topic root for inbound control (`{control_topic}/{name}/#`).
    #[serde(default = "default_control_topic")]
    pub control_topic: String,
}

fn default_port() -> u16 {
    1883
}

fn default_readings_topic() -> String {
    "readings".to_string()
}

fn default_control_topic() -> String {
    "control".to_string()
}

impl BusConfig {
    /// Load and parse the bus file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read bus config '{}'", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse bus config '{}'", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_instrument_file_parses_both_descriptor_forms() {
        let json = r#"{
            "instruments": [
                {"name": "smu1", "type": "Keithley2470", "serial_number": "SN1",
                 "config": {"source_limit": 10}},
                {"name": "psu1", "type": "TTiPL303QMDP", "resource": "/dev/ttyACM0",
                 "serial_number": "SN2", "read_termination": "\n", "config": {}}
            ]
        }"#;
        let file: InstrumentsFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.instruments.len(), 2);
        assert_eq!(file.instruments[0].type_tag, "Keithley2470");
        assert!(file.instruments[0].resource.is_none());
        assert_eq!(file.instruments[1].resource.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(file.instruments[1].read_termination.as_deref(), Some("\n"));
        // Blocklist defaults apply when the field is absent
        assert!(file.skip_resources.contains(&"/dev/ttyS0".to_string()));
    }

    #[test]
    fn test_bus_config_defaults() {
        let cfg: BusConfig = serde_json::from_str(r#"{"broker": "10.0.0.2"}"#).unwrap();
        assert_eq!(cfg.port, 1883);
        assert_eq!(cfg.readings_topic, "readings");
        assert_eq!(cfg.control_topic, "control");
    }

    #[test]
    fn test_load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"broker": "localhost", "port": 1884}}"#).unwrap();
        let cfg = BusConfig::load(f.path()).unwrap();
        assert_eq!(cfg.broker, "localhost");
        assert_eq!(cfg.port, 1884);
    }

    #[test]
    fn test_load_missing_file_reports_path() {
        let err = BusConfig::load(Path::new("/nonexistent/bus.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/bus.json"));
    }
}
