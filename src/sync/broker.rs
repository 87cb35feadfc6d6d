//! MQTT connection and channel naming.
use rumqttc::{Client, ClientError, Connection, LastWill, MqttOptions, QoS};
use tracing::warn;

use crate::constants::{BROKER_CHANNEL_CAPACITY, BROKER_KEEP_ALIVE, DEFAULT_BROKER_PORT};

use super::{DeviceCredentials, SyncError};

/// Anything that can put a payload on a topic. The daemon publishes through the MQTT
/// client; tests record what would have been sent.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SyncError>;
}

/// Never blocks: with the request queue full (a burst of inbound requests, or no broker
/// to drain it) the message is dropped and logged.
impl Publisher for Client {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SyncError> {
        match Client::try_publish(self, topic, QoS::AtLeastOnce, false, payload) {
            Ok(()) => Ok(()),
            Err(ClientError::TryRequest(_)) => {
                warn!("Broker queue full; dropped message for {topic}");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Queues the subscriptions of this device without blocking. Called on every
/// CONNACK, since a clean session forgets them on reconnect.
pub fn subscribe(client: &Client, topics: &Topics) {
    for topic in [&topics.config, &topics.sync] {
        if let Err(err) = client.try_subscribe(topic, QoS::AtLeastOnce) {
            warn!("Failed to subscribe to {topic}: {err}");
        }
    }
}

/// The six sub-channels of one device channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub config: String,
    pub sync: String,
    pub presence: String,
    pub live: String,
    pub events: String,
    pub metrics: String,
}

impl Topics {
    pub fn new(channel: &str) -> Self {
        let topic = |suffix: &str| format!("{channel}/{suffix}");
        Self {
            config: topic("config"),
            sync: topic("sync"),
            presence: topic("presence"),
            live: topic("live"),
            events: topic("events"),
            metrics: topic("metrics"),
        }
    }
}

/// Host and port of the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    /// Accepts `tcp://host:port`, `mqtt://host:port`, `host:port` or a bare `host`.
    pub fn parse(url: &str) -> Result<Self, SyncError> {
        let invalid = || SyncError::InvalidBrokerUrl(url.to_string());
        let trimmed = url.trim();
        let rest = trimmed
            .strip_prefix("tcp://")
            .or_else(|| trimmed.strip_prefix("mqtt://"))
            .unwrap_or(trimmed)
            .trim_end_matches('/');
        if rest.is_empty() || rest.contains("://") {
            return Err(invalid());
        }

        match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid())?;
                if host.is_empty() {
                    return Err(invalid());
                }
                Ok(Self {
                    host: host.to_string(),
                    port,
                })
            }
            None => Ok(Self {
                host: rest.to_string(),
                port: DEFAULT_BROKER_PORT,
            }),
        }
    }
}

/// Opens the MQTT session for this device. The broker publishes `last_will` on the
/// presence channel if the device drops off without saying goodbye.
pub fn connect(
    credentials: &DeviceCredentials,
    topics: &Topics,
    last_will: Vec<u8>,
) -> Result<(Client, Connection), SyncError> {
    let address = BrokerAddress::parse(&credentials.broker_url)?;

    let mut options = MqttOptions::new(&credentials.identifier, address.host, address.port);
    options.set_keep_alive(BROKER_KEEP_ALIVE);
    if let Some(username) = &credentials.broker_id {
        options.set_credentials(
            username,
            credentials.broker_secret.clone().unwrap_or_default(),
        );
    }
    options.set_last_will(LastWill::new(
        &topics.presence,
        last_will,
        QoS::AtLeastOnce,
        false,
    ));

    Ok(Client::new(options, BROKER_CHANNEL_CAPACITY))
}
