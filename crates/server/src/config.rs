//! Server configuration
//!
//! Read from a JSON file with `config_version` 1. TLS is on unless the file
//! disables it; when on, the certificate, key and key password fields must
//! all be present so the failure can name the missing piece.

use common::{DEFAULT_PORT, Error, SERVER_NAME_MAX_LEN};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

const SUPPORTED_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_version")]
    pub config_version: u32,
    #[serde(default = "default_name")]
    pub server_name: String,
    #[serde(default = "default_true")]
    pub bcast_enabled: bool,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default = "default_port")]
    pub port: u16,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    /// Accepted for contract compatibility; keys must be stored decrypted
    pub key_pass: Option<String>,
    #[serde(default)]
    pub disable_array: Vec<DisabledBus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisabledBus {
    pub bus: u32,
}

fn default_version() -> u32 {
    SUPPORTED_CONFIG_VERSION
}

fn default_name() -> String {
    "RemoteHub".to_string()
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl ServerConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigRead(anyhow::Error::new(e)))?;
        let mut config: ServerConfig =
            serde_json::from_str(&content).map_err(|e| Error::ConfigRead(anyhow::Error::new(e)))?;

        if config.config_version != SUPPORTED_CONFIG_VERSION {
            return Err(Error::ConfigRead(anyhow::anyhow!(
                "Config version {} not supported",
                config.config_version
            )));
        }

        config.server_name.truncate(SERVER_NAME_MAX_LEN - 1);
        config.validate()?;

        debug!("Server name: {}", config.server_name);
        debug!("Using port {}", config.port);
        Ok(config)
    }

    /// Check the TLS field contract of the loaded file.
    pub fn validate(&self) -> Result<(), Error> {
        if self.use_tls {
            debug!("TLS enabled");
            if self.cert_path.as_deref().unwrap_or("").is_empty() {
                return Err(Error::CertPathNotDefined);
            }
            if self.key_path.as_deref().unwrap_or("").is_empty() {
                return Err(Error::KeyPathNotDefined);
            }
            if self.key_pass.is_none() {
                return Err(Error::KeyPassNotDefined);
            }
        }
        Ok(())
    }

    pub fn disabled_buses(&self) -> Vec<u32> {
        self.disable_array.iter().map(|d| d.bus).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_str(json: &str) -> Result<ServerConfig, Error> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        ServerConfig::load(file.path())
    }

    #[test]
    fn test_defaults() {
        let config = load_str(r#"{"config_version": 1, "use_tls": false}"#).unwrap();
        assert_eq!(config.server_name, "RemoteHub");
        assert_eq!(config.port, 3240);
        assert!(config.bcast_enabled);
        assert!(!config.use_tls);
        assert!(config.disabled_buses().is_empty());
    }

    #[test]
    fn test_tls_requires_material() {
        let err = load_str(r#"{"config_version": 1}"#).unwrap_err();
        assert!(matches!(err, Error::CertPathNotDefined));

        let err = load_str(r#"{"config_version": 1, "cert_path": "/tmp/c.pem"}"#).unwrap_err();
        assert!(matches!(err, Error::KeyPathNotDefined));

        let err = load_str(
            r#"{"config_version": 1, "cert_path": "/tmp/c.pem", "key_path": "/tmp/k.pem"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::KeyPassNotDefined));

        let ok = load_str(
            r#"{"config_version": 1, "cert_path": "/tmp/c.pem",
                "key_path": "/tmp/k.pem", "key_pass": ""}"#,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_unsupported_version() {
        let err = load_str(r#"{"config_version": 2, "use_tls": false}"#).unwrap_err();
        assert!(matches!(err, Error::ConfigRead(_)));
    }

    #[test]
    fn test_disabled_buses() {
        let config = load_str(
            r#"{"config_version": 1, "use_tls": false,
                "disable_array": [{"bus": 1}, {"bus": 3}]}"#,
        )
        .unwrap();
        assert_eq!(config.disabled_buses(), vec![1, 3]);
    }

    #[test]
    fn test_name_truncation() {
        let long = "n".repeat(200);
        let config =
            load_str(&format!(r#"{{"config_version": 1, "use_tls": false, "server_name": "{long}"}}"#))
                .unwrap();
        assert_eq!(config.server_name.len(), SERVER_NAME_MAX_LEN - 1);
    }

    #[test]
    fn test_missing_file() {
        let err = ServerConfig::load(Path::new("/nonexistent/rh.json")).unwrap_err();
        assert!(matches!(err, Error::ConfigRead(_)));
    }
}
