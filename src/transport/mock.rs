//! Scripted in-memory transport for tests.
//!
//! [`MockWireResource`] answers queries through a handler closure and keeps a
//! shared trace of everything written and read, so tests can assert on the
//! exact wire conversation a driver produced. [`MockResourceManager`] serves
//! a fixed set of endpoints for discovery tests, including endpoints that
//! fail to open and endpoints exhibiting the query-echo quirk.

use super::{ResourceManager, WireResource};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Handler mapping one written command to an optional response line.
pub type ReplyHandler = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// Shared observable state of one mock resource.
#[derive(Debug, Default)]
pub struct MockTrace {
    /// Every command written, in order.
    pub written: Vec<String>,
    /// Response lines queued but not yet read.
    pub pending: VecDeque<String>,
    /// Total number of successful reads.
    pub reads: usize,
}

/// Scripted wire resource.
pub struct MockWireResource {
    address: String,
    echoes: bool,
    handler: ReplyHandler,
    trace: Arc<Mutex<MockTrace>>,
}

impl MockWireResource {
    /// Build a mock answering through `handler`. With `echoes` set, every
    /// written command queues its own text ahead of the handler's response,
    /// mimicking transports that echo queries back.
    pub fn new(
        address: &str,
        echoes: bool,
        handler: impl FnMut(&str) -> Option<String> + Send + 'static,
    ) -> Self {
        Self {
            address: address.to_string(),
            echoes,
            handler: Box::new(handler),
            trace: Arc::new(Mutex::new(MockTrace::default())),
        }
    }

    /// Handle for inspecting the conversation after the resource has been
    /// handed to a driver.
    pub fn trace(&self) -> Arc<Mutex<MockTrace>> {
        Arc::clone(&self.trace)
    }
}

#[allow(clippy::unwrap_used)]
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // Mock-only state; a poisoned lock means the test already failed.
    m.lock().unwrap()
}

#[async_trait]
impl WireResource for MockWireResource {
    async fn write(&mut self, command: &str) -> Result<()> {
        let reply = (self.handler)(command);
        let mut trace = lock(&self.trace);
        trace.written.push(command.to_string());
        if self.echoes {
            trace.pending.push_back(command.to_string());
        }
        if let Some(reply) = reply {
            trace.pending.push_back(reply);
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<String> {
        let mut trace = lock(&self.trace);
        let line = trace
            .pending
            .pop_front()
            .ok_or_else(|| anyhow!("Mock '{}': read with no pending response", self.address))?;
        trace.reads += 1;
        Ok(line)
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;
        self.read().await
    }

    fn set_timeout(&mut self, _timeout: Duration) {}

    fn set_read_termination(&mut self, _termination: &str) {}

    fn set_write_termination(&mut self, _termination: &str) {}

    fn address(&self) -> &str {
        &self.address
    }
}

/// One address served by the mock resource manager.
pub struct MockEndpoint {
    /// Address reported by `list_resources`.
    pub address: String,
    /// `*IDN?` response text, when the endpoint identifies itself.
    pub identity: Option<String>,
    /// Whether the endpoint echoes queries before the payload.
    pub echoes: bool,
    /// Whether `open` fails outright.
    pub fail_open: bool,
}

impl MockEndpoint {
    /// Endpoint answering `*IDN?` with `identity`.
    pub fn identified(address: &str, identity: &str) -> Self {
        Self {
            address: address.to_string(),
            identity: Some(identity.to_string()),
            echoes: false,
            fail_open: false,
        }
    }

    /// Same, but echoing every query back first.
    pub fn echoing(address: &str, identity: &str) -> Self {
        Self {
            echoes: true,
            ..Self::identified(address, identity)
        }
    }

    /// Endpoint whose open always fails.
    pub fn unopenable(address: &str) -> Self {
        Self {
            address: address.to_string(),
            identity: None,
            echoes: false,
            fail_open: true,
        }
    }
}

/// Resource manager serving a fixed set of mock endpoints.
pub struct MockResourceManager {
    endpoints: Vec<MockEndpoint>,
}

impl MockResourceManager {
    pub fn new(endpoints: Vec<MockEndpoint>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl ResourceManager for MockResourceManager {
    async fn list_resources(&self) -> Result<Vec<String>> {
        Ok(self.endpoints.iter().map(|e| e.address.clone()).collect())
    }

    async fn open(&self, address: &str) -> Result<Box<dyn WireResource>> {
        let endpoint = self
            .endpoints
            .iter()
            .find(|e| e.address == address)
            .ok_or_else(|| anyhow!("No mock endpoint at '{}'", address))?;
        if endpoint.fail_open {
            return Err(anyhow!("Mock endpoint '{}' refuses to open", address));
        }
        let identity = endpoint.identity.clone();
        Ok(Box::new(MockWireResource::new(
            address,
            endpoint.echoes,
            move |cmd| {
                if cmd == "*IDN?" {
                    identity.clone()
                } else {
                    None
                }
            },
        )))
    }
}
