//! Device credentials written by the registration flow.
use std::{fs, io, path::Path};

use crate::manifest::Manifest;

use super::SyncError;

/// Fields of one context section of the credential file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub app_id: String,
    pub app_secret: String,
    pub broker_id: Option<String>,
    pub broker_secret: Option<String>,
    pub broker_url: String,
    pub channel_id: String,
    pub identifier: String,
    pub group_id: String,
}

impl DeviceCredentials {
    /// Reads `context` from the credential file at `path`.
    pub fn load(path: &Path, context: &str) -> Result<Self, SyncError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(SyncError::CredentialFileMissing(path.to_path_buf()));
            }
            Err(err) => return Err(err.into()),
        };
        Self::parse(&text, context)
    }

    /// Parses credential file text (INI, one section per context).
    pub fn parse(text: &str, context: &str) -> Result<Self, SyncError> {
        let document = Manifest::parse(text)?;
        let section = document
            .section(context)
            .ok_or_else(|| SyncError::UnknownContext(context.to_string()))?;
        if section.entries().next().is_none() {
            return Err(SyncError::NotRegistered);
        }

        let optional = |key: &str| {
            section
                .get(key)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let required = |key: &'static str| optional(key).ok_or(SyncError::MissingCredential(key));

        Ok(Self {
            app_id: optional("AppId").unwrap_or_default(),
            app_secret: optional("AppSecret").unwrap_or_default(),
            broker_id: optional("BrokerId"),
            broker_secret: optional("BrokerSecret"),
            broker_url: required("BrokerTcpUrl")?,
            channel_id: required("ChannelId")?,
            identifier: required("Identifier")?,
            group_id: optional("GroupID").unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const FILE: &str = "
[fleet]
AppId = app-1
AppSecret = s3cret
BrokerId = broker-user
BrokerSecret = broker-pass
BrokerTcpUrl = tcp://broker.local:1884
ChannelId = unit-42
Identifier = device-7
GroupID = lab

[empty]
";

    #[test]
    fn context_section_is_read() {
        let creds = DeviceCredentials::parse(FILE, "fleet").unwrap();
        assert_eq!(creds.app_id, "app-1");
        assert_eq!(creds.broker_id.as_deref(), Some("broker-user"));
        assert_eq!(creds.broker_url, "tcp://broker.local:1884");
        assert_eq!(creds.channel_id, "unit-42");
        assert_eq!(creds.identifier, "device-7");
        assert_eq!(creds.group_id, "lab");
    }

    #[test]
    fn unknown_context_is_reported() {
        let err = DeviceCredentials::parse(FILE, "staging").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unable to find the context staging inside credential file"
        );
    }

    #[test]
    fn empty_context_is_unregistered() {
        let err = DeviceCredentials::parse(FILE, "empty").unwrap_err();
        assert_eq!(err.to_string(), "Your device is not registered.");
    }

    #[test]
    fn missing_channel_is_reported() {
        let err = DeviceCredentials::parse(
            "[fleet]\nBrokerTcpUrl = localhost\nIdentifier = d\n",
            "fleet",
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::MissingCredential("ChannelId")));
    }

    #[test]
    fn missing_file_is_distinct() {
        let dir = tempdir().unwrap();
        let err = DeviceCredentials::load(&dir.path().join("tandem.conf"), "fleet").unwrap_err();
        assert!(matches!(err, SyncError::CredentialFileMissing(_)));
    }
}
