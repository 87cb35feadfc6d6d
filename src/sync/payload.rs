//! JSON messages exchanged on the broker.
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::metrics::HostSnapshot;

use super::{DeviceCredentials, SyncError};

/// Presence states announced on `{channel}/presence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Presence {
    Connected,
    Alive,
    Disconnected,
}

/// A message on any sync channel: the device template plus one type-specific field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    /// Network address of the publishing device; the loop-avoidance key.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub group_id: String,
    /// Base64 of the raw configuration file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<HostSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl SyncPayload {
    /// Device template every message starts from.
    pub fn template(credentials: &DeviceCredentials, source: &str) -> Self {
        Self {
            identifier: credentials.identifier.clone(),
            app_id: credentials.app_id.clone(),
            app_secret: credentials.app_secret.clone(),
            source: source.to_string(),
            group_id: credentials.group_id.clone(),
            ..Self::default()
        }
    }

    fn stamped(&self) -> Self {
        Self {
            identifier: self.identifier.clone(),
            app_id: self.app_id.clone(),
            app_secret: self.app_secret.clone(),
            source: self.source.clone(),
            group_id: self.group_id.clone(),
            timestamp: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Snapshot of the configuration file bytes.
    pub fn config(&self, contents: &[u8]) -> Self {
        Self {
            context: Some(STANDARD.encode(contents)),
            ..self.stamped()
        }
    }

    pub fn presence(&self, presence: Presence) -> Self {
        Self {
            status: Some(presence.to_string()),
            ..self.stamped()
        }
    }

    pub fn live(&self, live: bool) -> Self {
        Self {
            live: Some(live),
            ..self.stamped()
        }
    }

    pub fn event(&self, kind: &str, data: serde_json::Value) -> Self {
        Self {
            event: Some(kind.to_string()),
            data: Some(data),
            ..self.stamped()
        }
    }

    pub fn metrics(&self, snapshot: HostSnapshot) -> Self {
        Self {
            metrics: Some(snapshot),
            ..self.stamped()
        }
    }

    /// Whether this message was published by the device at `address`.
    pub fn is_from(&self, address: &str) -> bool {
        self.source == address
    }

    /// Decoded configuration bytes, if the message carries a snapshot.
    pub fn decode_context(&self) -> Result<Option<Vec<u8>>, SyncError> {
        self.context
            .as_deref()
            .map(|encoded| STANDARD.decode(encoded.trim()))
            .transpose()
            .map_err(SyncError::from)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> SyncPayload {
        let credentials = DeviceCredentials {
            identifier: "device-7".into(),
            app_id: "app".into(),
            group_id: "lab".into(),
            ..DeviceCredentials::default()
        };
        SyncPayload::template(&credentials, "10.0.0.9")
    }

    #[test]
    fn config_snapshot_carries_base64_context() {
        let payload = template().config(b"version: '1'\n");
        assert_eq!(payload.context.as_deref(), Some("dmVyc2lvbjogJzEnCg=="));
        assert_eq!(payload.source, "10.0.0.9");
        assert!(payload.timestamp.is_some());
        assert_eq!(
            payload.decode_context().unwrap().as_deref(),
            Some(&b"version: '1'\n"[..])
        );
    }

    #[test]
    fn presence_only_sets_status() {
        let json: serde_json::Value =
            serde_json::from_slice(&template().presence(Presence::Disconnected).to_bytes().unwrap())
                .unwrap();
        assert_eq!(json["status"], "disconnected");
        assert_eq!(json["identifier"], "device-7");
        assert!(json.get("context").is_none());
        assert!(json.get("live").is_none());
    }

    #[test]
    fn minimal_foreign_message_parses() {
        let payload =
            SyncPayload::from_bytes(br#"{"source": "10.0.0.5", "context": "eDogMQo="}"#).unwrap();
        assert!(!payload.is_from("10.0.0.9"));
        assert_eq!(payload.decode_context().unwrap().unwrap(), b"x: 1\n");
    }

    #[test]
    fn bad_base64_is_an_error() {
        let payload = SyncPayload {
            context: Some("@@not base64@@".into()),
            ..SyncPayload::default()
        };
        assert!(matches!(payload.decode_context(), Err(SyncError::Context(_))));
    }
}
