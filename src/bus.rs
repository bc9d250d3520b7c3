//! MQTT connectivity.
//!
//! Thin wrapper over `rumqttc`: one background task drives the event loop and
//! forwards inbound publishes through a bounded channel, so slow instrument
//! conversations never back up into the network layer. Publishing goes
//! through [`BusHandle`], which is cheap to clone.
//!
//! ## Configuration
//!
//! ```json
//! {
//!   "broker": "localhost",
//!   "port": 1883,
//!   "readings_topic": "readings",
//!   "control_topic": "control"
//! }
//! ```

use crate::config::BusConfig;
use anyhow::{Context, Result};
use log::{debug, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;

/// Inbound messages queued ahead of the consumer before drops start.
const INBOUND_QUEUE: usize = 64;

/// One message received from the broker.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Cloneable handle for publishing and subscribing.
#[derive(Clone)]
pub struct BusHandle {
    client: AsyncClient,
    pub readings_topic: String,
    pub control_topic: String,
}

impl BusHandle {
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes())
            .await
            .with_context(|| format!("Failed to publish to '{}'", topic))
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        debug!("Subscribing to: {}", topic);
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .with_context(|| format!("Failed to subscribe to '{}'", topic))
    }
}

/// Connect to the broker and spawn the event-loop task.
///
/// Returns the publish handle and the channel of inbound messages. The task
/// reconnects on event-loop errors with a one-second backoff; messages
/// arriving while the consumer is saturated are dropped with a warning.
pub fn connect(cfg: &BusConfig, client_id: &str) -> (BusHandle, mpsc::Receiver<Inbound>) {
    let mut options = MqttOptions::new(client_id, &cfg.broker, cfg.port);
    options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(options, 10);
    let (tx, rx) = mpsc::channel(INBOUND_QUEUE);

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let inbound = Inbound {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    };
                    if tx.try_send(inbound).is_err() {
                        warn!("Inbound queue full; dropping message on '{}'", publish.topic);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT event loop error: {}; reconnecting", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    (
        BusHandle {
            client,
            readings_topic: cfg.readings_topic.clone(),
            control_topic: cfg.control_topic.clone(),
        },
        rx,
    )
}
