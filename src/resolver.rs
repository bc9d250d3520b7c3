//! Discovery of the transport resource backing each configured instrument.
//!
//! Descriptors either pin an explicit resource address or give a serial
//! number to match. Serial matching probes every candidate address the
//! resource manager reports (minus a blocklist of addresses known to hang),
//! sends the identification query with a bounded timeout, and returns the
//! first resource whose reported serial number matches exactly. Candidates
//! that fail to open, fail to identify, or identify as someone else are
//! logged at debug level and discarded.

use crate::config::InstrumentConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::instrument::Identity;
use crate::transport::{ResourceManager, WireResource};
use anyhow::Result;
use log::{debug, warn};
use std::time::Duration;

/// Bound on each probe transaction during discovery.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

fn apply_overrides(resource: &mut dyn WireResource, cfg: &InstrumentConfig) {
    resource.set_timeout(DISCOVERY_TIMEOUT);
    if let Some(term) = &cfg.read_termination {
        resource.set_read_termination(term);
    }
    if let Some(term) = &cfg.write_termination {
        resource.set_write_termination(term);
    }
}

/// Send `*IDN?` and parse the reply, compensating for transports that echo
/// the query text back before the payload (one extra read, no more).
pub async fn query_identity(resource: &mut dyn WireResource) -> Result<Identity> {
    let mut idn = resource.query("*IDN?").await?.trim().to_string();
    if idn == "*IDN?" {
        idn = resource.read().await?.trim().to_string();
    }
    debug!("Got *IDN? response: {}", idn);
    Ok(Identity::parse(&idn)?)
}

/// Open the resource the descriptor points at.
///
/// An explicit address is opened directly; otherwise every candidate is
/// probed until one reports the configured serial number. Exhaustion yields
/// [`BridgeError::ResourceNotFound`] naming the serial (or address) that
/// could not be found.
pub async fn find_matching_resource(
    manager: &dyn ResourceManager,
    cfg: &InstrumentConfig,
    skip: &[String],
) -> BridgeResult<Box<dyn WireResource>> {
    if let Some(address) = &cfg.resource {
        let mut resource = match manager.open(address).await {
            Ok(resource) => resource,
            Err(e) => {
                warn!("Failed to open configured resource '{}': {:#}", address, e);
                return Err(BridgeError::ResourceNotFound(address.clone()));
            }
        };
        apply_overrides(&mut *resource, cfg);
        return Ok(resource);
    }

    let serial = cfg
        .serial_number
        .as_ref()
        .ok_or_else(|| BridgeError::IncompleteDescriptor(cfg.name.clone()))?;

    let candidates = match manager.list_resources().await {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!("Resource enumeration failed: {:#}", e);
            return Err(BridgeError::ResourceNotFound(serial.clone()));
        }
    };

    for address in candidates {
        if skip.contains(&address) {
            continue;
        }
        debug!("Probing resource: {}", address);
        match probe(manager, &address, cfg).await {
            Ok((resource, identity)) => {
                if identity.serial == *serial {
                    debug!("Serial {} matched at {}", serial, address);
                    return Ok(resource);
                }
                // Someone else's instrument; discard the open.
                debug!(
                    "Resource {} reports serial {}, wanted {}",
                    address, identity.serial, serial
                );
            }
            Err(e) => {
                debug!("Skipping resource {}: {:#}", address, e);
            }
        }
    }

    Err(BridgeError::ResourceNotFound(serial.clone()))
}

async fn probe(
    manager: &dyn ResourceManager,
    address: &str,
    cfg: &InstrumentConfig,
) -> Result<(Box<dyn WireResource>, Identity)> {
    let mut resource = manager.open(address).await?;
    apply_overrides(&mut *resource, cfg);
    let identity = query_identity(&mut *resource).await?;
    Ok((resource, identity))
}

/// Probe every visible address and report what answers the identification
/// query. Used by `--list-devices` when commissioning new hardware.
pub async fn survey(manager: &dyn ResourceManager, skip: &[String]) -> Result<Vec<(String, String)>> {
    let mut report = Vec::new();
    for address in manager.list_resources().await? {
        if skip.contains(&address) {
            report.push((address, "skipped (blocklist)".to_string()));
            continue;
        }
        let line = match manager.open(&address).await {
            Err(e) => format!("failed to open: {:#}", e),
            Ok(mut resource) => {
                resource.set_timeout(DISCOVERY_TIMEOUT);
                match query_identity(&mut *resource).await {
                    Ok(id) => format!(
                        "{} {} (serial {}, firmware {})",
                        id.manufacturer, id.model, id.serial, id.firmware
                    ),
                    Err(e) => format!("no identification: {:#}", e),
                }
            }
        };
        report.push((address, line));
    }
    Ok(report)
}
