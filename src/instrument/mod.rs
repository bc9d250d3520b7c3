//! Instrument driver abstraction.
//!
//! Every supported device family implements the [`Instrument`] trait; the
//! daemon only ever talks to the trait. New families are added by writing a
//! driver module and registering its constructor in
//! [`InstrumentRegistry::with_builtins`] under the type tag used in the
//! config file — no changes to the daemon core.
//!
//! All driver operations run under the instrument's own lock for the full
//! multi-step wire conversation, so a polling cycle and an inbound control
//! call can never interleave individual wire transactions. Locks are never
//! nested: each driver touches only its own resource.

use crate::config::InstrumentConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::resolver;
use crate::transport::{ResourceManager, WireResource};
use anyhow::Result;
use async_trait::async_trait;
use log::info;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub mod iseg_shr;
pub mod keithley_2470;
pub mod mock;
pub mod tti_pl303qmdp;

pub use iseg_shr::IsegShr;
pub use keithley_2470::Keithley2470;
pub use mock::MockInstrument;
pub use tti_pl303qmdp::TtiPl303Qmdp;

/// Named scalar values read from or written to an instrument.
pub type Readings = BTreeMap<String, f64>;

/// Identity reported by the identification query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

impl Identity {
    /// Parse the four comma-separated identification fields.
    pub fn parse(response: &str) -> BridgeResult<Self> {
        let fields: Vec<&str> = response.trim().split(',').collect();
        match fields.as_slice() {
            [manufacturer, model, serial, firmware] => Ok(Self {
                manufacturer: manufacturer.trim().to_string(),
                model: model.trim().to_string(),
                serial: serial.trim().to_string(),
                firmware: firmware.trim().to_string(),
            }),
            _ => Err(BridgeError::MalformedIdentity(response.to_string())),
        }
    }
}

/// Wire conversation helper shared by all drivers.
///
/// Encapsulates the query-echo quirk: device families whose transport echoes
/// every query back before the real payload set `echoes_queries`, and this
/// helper discards the echo with exactly one extra read. Drivers never deal
/// with the quirk individually.
pub struct InstrumentIo {
    resource: Box<dyn WireResource>,
    echoes_queries: bool,
}

impl InstrumentIo {
    pub fn new(resource: Box<dyn WireResource>, echoes_queries: bool) -> Self {
        Self {
            resource,
            echoes_queries,
        }
    }

    /// Send a command that expects no payload.
    ///
    /// Echoing devices still produce an echo line and a status line per
    /// command; both are consumed here.
    pub async fn command(&mut self, command: &str) -> Result<()> {
        if self.echoes_queries {
            self.resource.query(command).await?;
            self.resource.read().await?;
            Ok(())
        } else {
            self.resource.write(command).await
        }
    }

    /// Send a query and return the payload line, discarding the echo when
    /// the device produces one.
    pub async fn query(&mut self, command: &str) -> Result<String> {
        let first = self.resource.query(command).await?;
        if self.echoes_queries {
            return self.resource.read().await;
        }
        Ok(first)
    }

    /// Address of the underlying resource, for log context.
    pub fn address(&self) -> &str {
        self.resource.address()
    }
}

/// Polymorphic contract every device family implements.
///
/// `channel` is required by multi-channel supplies and rejected or ignored by
/// single-channel units; see each driver for its convention. All operations
/// return `Err` only for faults the caller can act on — configuration
/// validation never fails, it falls back to documented defaults.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Config name, also the topic segment for this instrument.
    fn name(&self) -> &str;

    /// Identity captured once at construction.
    fn identity(&self) -> &Identity;

    /// Reset the instrument.
    async fn reset(&self) -> Result<()>;

    /// Current measurement readings (voltage, current, output state, ...).
    async fn read(&self) -> Result<Readings>;

    /// Configured setpoints (target voltage, current limit, ...).
    async fn get_set_values(&self) -> Result<Readings>;

    /// Reconfigure from the stored descriptor, or from `overrides` when
    /// given. Always disables output and resets the device first, so no
    /// stale state survives reconfiguration.
    async fn configure(&self, overrides: Option<&Value>) -> Result<()>;

    /// Enable or disable output, for one channel or all.
    async fn set_output(&self, on: bool, channel: Option<&str>) -> Result<()>;

    /// Set the target voltage.
    async fn set_voltage(&self, volts: f64, channel: Option<&str>) -> Result<()>;

    /// Set the target current.
    async fn set_current(&self, amps: f64, channel: Option<&str>) -> Result<()>;
}

impl std::fmt::Debug for dyn Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrument")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// Pick the config object a reconfiguration should apply: the override
/// payload when present (unwrapping a descriptor-shaped `{"config": ...}`
/// envelope), otherwise the stored descriptor config.
pub(crate) fn effective_config<'a>(overrides: Option<&'a Value>, stored: &'a Value) -> &'a Value {
    match overrides {
        Some(v) => v.get("config").unwrap_or(v),
        None => stored,
    }
}

/// Constructor registered for one device family.
///
/// Constructors are synchronous: the resource is already open and identity
/// already verified by [`InstrumentRegistry::connect`]; they only capture
/// configuration.
pub type DriverConstructor =
    fn(&InstrumentConfig, InstrumentIo, Identity) -> Result<Arc<dyn Instrument>>;

/// Registry entry for one device family.
pub struct DriverSpec {
    /// Whether the family's transport echoes queries (consumed by
    /// [`InstrumentIo`]).
    pub echoes_queries: bool,
    /// Driver constructor.
    pub construct: DriverConstructor,
}

/// Maps config type tags to driver constructors.
pub struct InstrumentRegistry {
    entries: HashMap<String, DriverSpec>,
}

impl InstrumentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registry with every built-in device family.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            "Keithley2470",
            DriverSpec {
                echoes_queries: false,
                construct: Keithley2470::connect,
            },
        );
        registry.register(
            "ISEGSHR",
            DriverSpec {
                echoes_queries: true,
                construct: IsegShr::connect,
            },
        );
        registry.register(
            "TTiPL303QMDP",
            DriverSpec {
                echoes_queries: false,
                construct: TtiPl303Qmdp::connect,
            },
        );
        registry
    }

    /// Register (or replace) a device family under `type_tag`.
    pub fn register(&mut self, type_tag: &str, spec: DriverSpec) {
        self.entries.insert(type_tag.to_string(), spec);
    }

    /// Discover, open, identify and construct the instrument described by
    /// `cfg`. Identity mismatch is fatal: a misidentified device cannot be
    /// trusted with subsequent control commands.
    pub async fn connect(
        &self,
        manager: &dyn ResourceManager,
        cfg: &InstrumentConfig,
        skip: &[String],
    ) -> Result<Arc<dyn Instrument>> {
        let spec = self
            .entries
            .get(&cfg.type_tag)
            .ok_or_else(|| BridgeError::UnknownInstrumentType(cfg.type_tag.clone()))?;

        let resource = resolver::find_matching_resource(manager, cfg, skip).await?;
        let mut io = InstrumentIo::new(resource, spec.echoes_queries);
        let identity = verify_identity(&mut io, cfg).await?;
        info!(
            "Connected '{}' ({} {} serial {} firmware {}) at {}",
            cfg.name,
            identity.manufacturer,
            identity.model,
            identity.serial,
            identity.firmware,
            io.address()
        );
        (spec.construct)(cfg, io, identity)
    }
}

impl Default for InstrumentRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Issue the identification query and check the reported serial number
/// against the descriptor.
pub async fn verify_identity(
    io: &mut InstrumentIo,
    cfg: &InstrumentConfig,
) -> Result<Identity> {
    let response = io.query("*IDN?").await?;
    let identity = Identity::parse(&response)?;
    if let Some(configured) = &cfg.serial_number {
        if configured != &identity.serial {
            return Err(BridgeError::IdentityMismatch {
                configured: configured.clone(),
                reported: identity.serial.clone(),
            }
            .into());
        }
    }
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_parses_four_fields() {
        let id = Identity::parse("ACME,MODEL X,SN123,1.0").unwrap();
        assert_eq!(id.manufacturer, "ACME");
        assert_eq!(id.model, "MODEL X");
        assert_eq!(id.serial, "SN123");
        assert_eq!(id.firmware, "1.0");
    }

    #[test]
    fn test_identity_trims_fields() {
        let id = Identity::parse("Keithley, 2470 , 04473422 ,1.7.12b\r\n").unwrap();
        assert_eq!(id.model, "2470");
        assert_eq!(id.serial, "04473422");
    }

    #[test]
    fn test_identity_rejects_wrong_field_count() {
        assert!(matches!(
            Identity::parse("ACME,MODEL X,SN123"),
            Err(BridgeError::MalformedIdentity(_))
        ));
        assert!(matches!(
            Identity::parse("a,b,c,d,e"),
            Err(BridgeError::MalformedIdentity(_))
        ));
    }

    #[test]
    fn test_effective_config_unwraps_descriptor_envelope() {
        let stored = serde_json::json!({"nplc": 2});
        let envelope = serde_json::json!({"config": {"nplc": 5}});
        let bare = serde_json::json!({"nplc": 7});

        assert_eq!(effective_config(None, &stored)["nplc"], 2);
        assert_eq!(effective_config(Some(&envelope), &stored)["nplc"], 5);
        assert_eq!(effective_config(Some(&bare), &stored)["nplc"], 7);
    }
}
