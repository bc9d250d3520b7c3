//! Core library for the psu_bridge daemon.
//!
//! Bridges SCPI-style laboratory power supplies and source-measure units to
//! an MQTT broker: instruments are discovered by serial number, polled on a
//! schedule and controlled through per-instrument command topics. The binary
//! in `main.rs` wires these modules together; everything here is usable as a
//! library for tests and tooling.

pub mod bus;
pub mod config;
pub mod daemon;
pub mod error;
pub mod instrument;
pub mod resolver;
pub mod schedule;
pub mod scpi;
pub mod transport;
