//! Receiver configuration stored as JSON in the data directory.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use lanvault_common::{Error, Result};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 53317;

/// Receiver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub bind_host: String,
    pub port: u16,
    /// Folder uploads are stored in.
    pub default_folder: String,
    pub registration_timeout_secs: u64,
    pub prepare_timeout_secs: u64,
    /// How long stop waits for in-flight requests before closing them.
    pub shutdown_grace_secs: u64,
    pub max_upload_bytes: usize,
    /// Extra subject alternative names for the certificate.
    pub extra_hostnames: Vec<String>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            default_folder: "Received".to_string(),
            registration_timeout_secs: 30,
            prepare_timeout_secs: 300,
            shutdown_grace_secs: 5,
            max_upload_bytes: 1024 * 1024 * 1024,
            extra_hostnames: Vec::new(),
        }
    }
}

impl ReceiverConfig {
    /// Load the config at `path`, writing defaults there first if missing.
    ///
    /// # Errors
    /// - `Serialization` if the file is not valid JSON
    /// - `InvalidInput` if a value is out of range
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            info!(path = %path.display(), "Wrote default receiver config");
            return Ok(config);
        }

        let data = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_folder.trim().is_empty() {
            return Err(Error::InvalidInput(
                "default_folder cannot be empty".to_string(),
            ));
        }
        if self.registration_timeout_secs == 0 || self.prepare_timeout_secs == 0 {
            return Err(Error::InvalidInput(
                "Decision timeouts must be positive".to_string(),
            ));
        }
        if self.max_upload_bytes == 0 {
            return Err(Error::InvalidInput(
                "max_upload_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        if self.bind_host.contains(':') {
            format!("[{}]:{}", self.bind_host, self.port)
        } else {
            format!("{}:{}", self.bind_host, self.port)
        }
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_secs(self.prepare_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReceiverConfig::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:53317");
        assert_eq!(config.registration_timeout(), Duration::from_secs(30));
        assert_eq!(config.prepare_timeout(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let created = ReceiverConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(ReceiverConfig::load_or_create(&path).unwrap(), created);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"port": 9000, "default_folder": "Inbox"}"#).unwrap();

        let config = ReceiverConfig::load_or_create(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.default_folder, "Inbox");
        assert_eq!(config.shutdown_grace_secs, 5);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"prepare_timeout_secs": 0}"#).unwrap();
        assert!(matches!(
            ReceiverConfig::load_or_create(&path),
            Err(Error::InvalidInput(_))
        ));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            ReceiverConfig::load_or_create(&path),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_ipv6_bind_addr() {
        let config = ReceiverConfig {
            bind_host: "::1".to_string(),
            port: 1,
            ..Default::default()
        };
        assert_eq!(config.bind_addr(), "[::1]:1");
    }
}
