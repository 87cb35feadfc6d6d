//! Fleet-wide synchronization of the project configuration file over MQTT.
//!
//! Every device publishes its configuration file as a base64 snapshot on
//! `{channel}/config`. A snapshot from another device (its `source` address differs
//! from ours) replaces the local file; our own echo is ignored.
use std::{io, path::PathBuf};

use thiserror::Error;

use crate::error::{ConfigError, PidFileError};

pub mod broker;
pub mod credentials;
pub mod daemon;
pub mod payload;

pub use broker::{BrokerAddress, Publisher, Topics};
pub use credentials::DeviceCredentials;
pub use daemon::{MessageOutcome, SyncAgent, SyncDaemon};
pub use payload::{Presence, SyncPayload};

/// Errors raised by the sync daemon and its helpers.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Device credential file {0} not found; register this device first")]
    CredentialFileMissing(PathBuf),

    #[error("Unable to find the context {0} inside credential file")]
    UnknownContext(String),

    #[error("Your device is not registered.")]
    NotRegistered,

    #[error("Credential field '{0}' is missing")]
    MissingCredential(&'static str),

    #[error("Invalid broker URL '{0}'")]
    InvalidBrokerUrl(String),

    #[error("Unable to resolve the device network address: {0}")]
    Address(String),

    #[error("Broker client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Malformed sync payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Malformed configuration snapshot: {0}")]
    Context(#[from] base64::DecodeError),

    #[error(transparent)]
    Credentials(#[from] ConfigError),

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
