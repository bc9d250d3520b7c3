//! Polling loop and control-message routing.
//!
//! The polling loop walks every instrument each cycle, merges live readings
//! with setpoint read-backs and publishes one JSON document per instrument.
//! A failing instrument is logged and skipped; the cycle always completes for
//! the others.
//!
//! Control messages arrive on `control/{name}/{command}` or
//! `control/{name}/{channel}/{command}`. Routing is decoupled from execution:
//! the router validates and classifies each message, arms the responsiveness
//! override for every accepted one, and queues an intent on a bounded
//! channel; a single consumer task applies intents to the instruments
//! serially. The broker connection therefore never waits on a wire
//! conversation.

use crate::bus::{BusHandle, Inbound};
use crate::instrument::{Instrument, Readings};
use crate::schedule::{ScheduleState, SharedSchedule};
use anyhow::Result;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Connected instruments keyed by config name.
pub type InstrumentMap = BTreeMap<String, Arc<dyn Instrument>>;

/// Intents queued ahead of the consumer.
pub const CONTROL_QUEUE: usize = 32;

/// Granularity of the deadline wait; bounds both shutdown latency and how
/// long an armed override takes to preempt a sleeping scheduler.
const WAIT_SLICE: Duration = Duration::from_millis(10);

fn lock_schedule(schedule: &SharedSchedule) -> MutexGuard<'_, ScheduleState> {
    schedule.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A validated control command.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    SetVoltage(f64),
    SetCurrent(f64),
    SetOutput(bool),
    Configure(Option<Value>),
    Reset,
}

/// One command bound to its target, ready for the consumer.
pub struct ControlIntent {
    pub instrument: Arc<dyn Instrument>,
    pub channel: Option<String>,
    pub command: ControlCommand,
}

/// Classification of one inbound message.
pub enum RouteOutcome {
    /// Valid command; arm the override and queue the intent.
    Dispatch(ControlIntent),
    /// Accepted but nothing to execute (no-op payload, unknown command).
    /// Still arms the override.
    ArmOnly,
    /// Not addressed to us, unknown instrument, or unparseable payload.
    Ignore,
}

fn truthy(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|n| n != 0.0),
        _ => None,
    }
}

/// Classify one inbound control message.
///
/// Acceptance requires a known instrument and a JSON payload; everything
/// after that point arms the override even when the command itself turns out
/// to be unusable, so an operator poking at the topic sees fast feedback
/// while diagnosing their mistake from the logs.
pub fn route_control_message(
    instruments: &InstrumentMap,
    control_topic: &str,
    topic: &str,
    payload: &[u8],
) -> RouteOutcome {
    // The topic root may itself contain '/', so strip it as a prefix before
    // splitting the remainder.
    let rest = match topic
        .strip_prefix(control_topic)
        .and_then(|rest| rest.strip_prefix('/'))
    {
        Some(rest) => rest,
        None => return RouteOutcome::Ignore,
    };

    let parts: Vec<&str> = rest.split('/').collect();
    if !(2..=3).contains(&parts.len()) {
        return RouteOutcome::Ignore;
    }

    let instrument = match instruments.get(parts[0]) {
        Some(instrument) => instrument,
        None => return RouteOutcome::Ignore,
    };

    let (channel, command) = if parts.len() == 3 {
        (Some(parts[1].to_string()), parts[2])
    } else {
        (None, parts[1])
    };

    let value: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(_) => {
            warn!(
                "Invalid payload for topic {}: {}",
                topic,
                String::from_utf8_lossy(payload)
            );
            return RouteOutcome::Ignore;
        }
    };

    debug!("Trying to process command: {}", command);

    let command = match command {
        "set_voltage" => match value.as_f64() {
            Some(volts) => ControlCommand::SetVoltage(volts),
            None => {
                error!("Non-numeric set_voltage payload on {}", topic);
                return RouteOutcome::ArmOnly;
            }
        },
        "set_current" => match value.as_f64() {
            Some(amps) => ControlCommand::SetCurrent(amps),
            None => {
                error!("Non-numeric set_current payload on {}", topic);
                return RouteOutcome::ArmOnly;
            }
        },
        "output" => match truthy(&value) {
            Some(on) => ControlCommand::SetOutput(on),
            None => {
                error!("Output payload on {} is not a boolean or number", topic);
                return RouteOutcome::ArmOnly;
            }
        },
        "configure" => {
            if value.is_object() {
                ControlCommand::Configure(Some(value))
            } else {
                match truthy(&value) {
                    Some(true) => ControlCommand::Configure(None),
                    Some(false) => return RouteOutcome::ArmOnly,
                    None => {
                        error!("Configure payload on {} is not an object or flag", topic);
                        return RouteOutcome::ArmOnly;
                    }
                }
            }
        }
        "reset" => match truthy(&value) {
            Some(true) => ControlCommand::Reset,
            _ => return RouteOutcome::ArmOnly,
        },
        other => {
            error!("Unknown command: {}", other);
            return RouteOutcome::ArmOnly;
        }
    };

    RouteOutcome::Dispatch(ControlIntent {
        instrument: Arc::clone(instrument),
        channel,
        command,
    })
}

/// Execute one intent against its instrument.
pub async fn apply_intent(intent: &ControlIntent) -> Result<()> {
    let channel = intent.channel.as_deref();
    match &intent.command {
        ControlCommand::SetVoltage(volts) => intent.instrument.set_voltage(*volts, channel).await,
        ControlCommand::SetCurrent(amps) => intent.instrument.set_current(*amps, channel).await,
        ControlCommand::SetOutput(on) => intent.instrument.set_output(*on, channel).await,
        ControlCommand::Configure(overrides) => {
            intent.instrument.configure(overrides.as_ref()).await
        }
        ControlCommand::Reset => intent.instrument.reset().await,
    }
}

/// Router task: classify inbound messages, arm the override on acceptance,
/// queue dispatchable intents.
pub async fn control_router(
    mut inbound: mpsc::Receiver<Inbound>,
    instruments: Arc<InstrumentMap>,
    control_topic: String,
    schedule: SharedSchedule,
    intents: mpsc::Sender<ControlIntent>,
) {
    while let Some(message) = inbound.recv().await {
        match route_control_message(&instruments, &control_topic, &message.topic, &message.payload)
        {
            RouteOutcome::Dispatch(intent) => {
                lock_schedule(&schedule).arm_override(Instant::now());
                if intents.send(intent).await.is_err() {
                    break;
                }
            }
            RouteOutcome::ArmOnly => {
                lock_schedule(&schedule).arm_override(Instant::now());
            }
            RouteOutcome::Ignore => {}
        }
    }
}

/// Consumer task: apply queued intents one at a time.
///
/// Serial execution means an instrument's own lock is the only contention a
/// control command ever sees.
pub async fn control_consumer(mut intents: mpsc::Receiver<ControlIntent>) {
    while let Some(intent) = intents.recv().await {
        debug!("Applying {:?} to '{}'", intent.command, intent.instrument.name());
        if let Err(e) = apply_intent(&intent).await {
            error!(
                "Control command failed on '{}': {:#}",
                intent.instrument.name(),
                e
            );
        }
    }
}

/// Merge live readings with setpoint read-backs; on key collision the
/// setpoint wins.
pub fn merge_readings(readings: Readings, set_values: Readings) -> Readings {
    let mut merged = readings;
    merged.extend(set_values);
    merged
}

async fn poll_instrument(instrument: &dyn Instrument) -> Result<String> {
    let readings = instrument.read().await?;
    let set_values = instrument.get_set_values().await?;
    Ok(serde_json::to_string(&merge_readings(readings, set_values))?)
}

/// Poll every instrument once, publishing (or logging) each payload.
pub async fn polling_cycle(instruments: &InstrumentMap, bus: Option<&BusHandle>) {
    for (name, instrument) in instruments {
        let payload = match poll_instrument(instrument.as_ref()).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Polling '{}' failed: {:#}", name, e);
                continue;
            }
        };
        match bus {
            Some(bus) => {
                let topic = format!("{}/{}", bus.readings_topic, name);
                if let Err(e) = bus.publish(&topic, &payload).await {
                    warn!("Publishing '{}' failed: {:#}", topic, e);
                }
            }
            None => info!("{}: {}", name, payload),
        }
    }
}

/// Scheduler: run polling cycles at the effective interval until shutdown.
///
/// The deadline is re-read on every wait slice, so a control message that
/// arms the override preempts a sleeping scheduler within one slice.
pub async fn polling_loop(
    instruments: &InstrumentMap,
    schedule: SharedSchedule,
    bus: Option<&BusHandle>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        polling_cycle(instruments, bus).await;
        lock_schedule(&schedule).advance_deadline(Instant::now());

        loop {
            if *shutdown.borrow() {
                return;
            }
            let deadline = lock_schedule(&schedule).next_deadline();
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(WAIT_SLICE).await;
        }
    }
}

/// Read and log every instrument once; used by `--single-shot`.
pub async fn single_shot(instruments: &InstrumentMap) -> Result<()> {
    for (name, instrument) in instruments {
        let readings = instrument.read().await?;
        let set_values = instrument.get_set_values().await?;
        info!("{}: readings={:?}, set_values={:?}", name, readings, set_values);
    }
    Ok(())
}
