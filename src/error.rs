//! Custom error types for the bridge daemon.
//!
//! This module defines the primary error type, `BridgeError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to classify the faults that matter operationally:
//!
//! - **`ResourceNotFound`**: discovery exhausted every candidate address (or an
//!   explicitly configured address failed to open). Fatal at startup for the
//!   affected instrument.
//! - **`IdentityMismatch`**: the serial number reported by the device does not
//!   match the configured one. Fatal at startup, since a misidentified device
//!   cannot be trusted with control commands.
//! - **`InvalidChannel`**: a set call named a channel the device does not have,
//!   or omitted a channel the device requires. Raised synchronously to the
//!   caller.
//! - **`MalformedIdentity`**: the `*IDN?` response did not contain the four
//!   expected comma-separated fields.
//! - **`WireTimeout`**: a bounded wire transaction ran out of time. Caught and
//!   logged per instrument inside the polling cycle; never fatal.
//!
//! Configuration-validation problems are deliberately absent from this enum:
//! out-of-domain settings fall back to documented defaults instead of failing
//! (see the driver modules).

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("No instrument found for '{0}'")]
    ResourceNotFound(String),

    #[error("Configured serial number '{configured}' does not match the serial number reported by the instrument ('{reported}')")]
    IdentityMismatch {
        configured: String,
        reported: String,
    },

    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("Malformed identification response: '{0}'")]
    MalformedIdentity(String),

    #[error("Wire timeout on '{0}'")]
    WireTimeout(String),

    #[error("Unknown instrument type '{0}'")]
    UnknownInstrumentType(String),

    #[error("Instrument '{0}' needs either a serial_number or an explicit resource address")]
    IncompleteDescriptor(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_not_found_names_the_key() {
        let err = BridgeError::ResourceNotFound("SN123".to_string());
        assert_eq!(err.to_string(), "No instrument found for 'SN123'");
    }

    #[test]
    fn test_identity_mismatch_display() {
        let err = BridgeError::IdentityMismatch {
            configured: "A".into(),
            reported: "B".into(),
        };
        assert!(err.to_string().contains("'A'"));
        assert!(err.to_string().contains("'B'"));
    }
}
