//! Wire transport abstraction.
//!
//! This module contains the seams to the resource-manager collaborator: a
//! [`ResourceManager`] that enumerates and opens candidate addresses, and a
//! [`WireResource`] carrying timed write/query/read primitives over one open
//! connection. The daemon core only ever talks to these traits; the serial
//! backend lives behind the `instrument_serial` feature and the scripted mock
//! backs every test.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;

pub use mock::{MockEndpoint, MockResourceManager, MockWireResource};
#[cfg(feature = "instrument_serial")]
pub use serial::SerialResourceManager;

/// One open command/response connection to an instrument.
///
/// Every operation is bounded by the configured timeout so one unresponsive
/// device cannot stall the daemon. Implementations strip the read termination
/// before returning response text.
#[async_trait]
pub trait WireResource: Send {
    /// Send one command line.
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Read one response line.
    async fn read(&mut self) -> Result<String>;

    /// Send one command line and read one response line.
    async fn query(&mut self, command: &str) -> Result<String>;

    /// Bound every subsequent transaction by `timeout`.
    fn set_timeout(&mut self, timeout: Duration);

    /// Override the response termination sequence.
    fn set_read_termination(&mut self, termination: &str);

    /// Override the command termination sequence.
    fn set_write_termination(&mut self, termination: &str);

    /// Address this resource was opened from.
    fn address(&self) -> &str;
}

impl std::fmt::Debug for dyn WireResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireResource")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Enumerates candidate addresses and opens them.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// List every candidate address currently visible to the transport.
    async fn list_resources(&self) -> Result<Vec<String>>;

    /// Open the resource at `address`.
    async fn open(&self, address: &str) -> Result<Box<dyn WireResource>>;
}
