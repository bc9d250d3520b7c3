//! In-memory instrument for daemon and routing tests.
//!
//! Records every control call and serves scripted readings, so tests can
//! assert on exactly what the daemon asked an instrument to do without any
//! transport underneath. Reads can be made to fail for failure-isolation
//! tests.

use super::{Identity, Instrument, Readings};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One recorded control call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Reset,
    Configure(Option<Value>),
    SetOutput(bool, Option<String>),
    SetVoltage(f64, Option<String>),
    SetCurrent(f64, Option<String>),
}

/// Scripted instrument.
pub struct MockInstrument {
    name: String,
    identity: Identity,
    readings: Mutex<Readings>,
    set_values: Mutex<Readings>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    fail_reads: AtomicBool,
}

#[allow(clippy::unwrap_used)]
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // Mock-only state; a poisoned lock means the test already failed.
    m.lock().unwrap()
}

impl MockInstrument {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            identity: Identity {
                manufacturer: "Mock".to_string(),
                model: "PSU".to_string(),
                serial: format!("{}-serial", name),
                firmware: "0.0".to_string(),
            },
            readings: Mutex::new(Readings::new()),
            set_values: Mutex::new(Readings::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_reads: AtomicBool::new(false),
        }
    }

    pub fn with_readings(self, readings: &[(&str, f64)]) -> Self {
        *lock(&self.readings) = readings
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        self
    }

    pub fn with_set_values(self, values: &[(&str, f64)]) -> Self {
        *lock(&self.set_values) = values
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        self
    }

    /// Make every subsequent `read` fail.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Handle for asserting on recorded calls after the instrument has been
    /// handed to the daemon.
    pub fn calls(&self) -> Arc<Mutex<Vec<MockCall>>> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Instrument for MockInstrument {
    fn name(&self) -> &str {
        &self.name
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn reset(&self) -> Result<()> {
        lock(&self.calls).push(MockCall::Reset);
        Ok(())
    }

    async fn read(&self) -> Result<Readings> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("Mock '{}': scripted read failure", self.name));
        }
        Ok(lock(&self.readings).clone())
    }

    async fn get_set_values(&self) -> Result<Readings> {
        Ok(lock(&self.set_values).clone())
    }

    async fn configure(&self, overrides: Option<&Value>) -> Result<()> {
        lock(&self.calls).push(MockCall::Configure(overrides.cloned()));
        Ok(())
    }

    async fn set_output(&self, on: bool, channel: Option<&str>) -> Result<()> {
        lock(&self.calls).push(MockCall::SetOutput(on, channel.map(str::to_string)));
        Ok(())
    }

    async fn set_voltage(&self, volts: f64, channel: Option<&str>) -> Result<()> {
        lock(&self.calls).push(MockCall::SetVoltage(volts, channel.map(str::to_string)));
        Ok(())
    }

    async fn set_current(&self, amps: f64, channel: Option<&str>) -> Result<()> {
        lock(&self.calls).push(MockCall::SetCurrent(amps, channel.map(str::to_string)));
        Ok(())
    }
}
