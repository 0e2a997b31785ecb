//! Client configuration
//!
//! JSON file with `config_version` 1. An empty `ca_path` keeps TLS on but
//! skips server certificate verification.

use common::Error;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

const SUPPORTED_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_version")]
    pub config_version: u32,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default)]
    pub ca_path: String,
}

fn default_version() -> u32 {
    SUPPORTED_CONFIG_VERSION
}

fn default_true() -> bool {
    true
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigRead(anyhow::Error::new(e)))?;
        let config: ClientConfig =
            serde_json::from_str(&content).map_err(|e| Error::ConfigRead(anyhow::Error::new(e)))?;

        if config.config_version != SUPPORTED_CONFIG_VERSION {
            return Err(Error::ConfigRead(anyhow::anyhow!(
                "Config version {} not supported",
                config.config_version
            )));
        }

        if config.use_tls {
            debug!("TLS enabled");
            if config.ca_path.is_empty() {
                debug!("Server verification disabled");
            } else {
                debug!("Verifying server with CA cert");
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_str(json: &str) -> Result<ClientConfig, Error> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        ClientConfig::load(file.path())
    }

    #[test]
    fn test_defaults() {
        let config = load_str(r#"{"config_version": 1}"#).unwrap();
        assert!(config.use_tls);
        assert!(config.ca_path.is_empty());
    }

    #[test]
    fn test_explicit_fields() {
        let config =
            load_str(r#"{"config_version": 1, "use_tls": false, "ca_path": "/etc/ca.pem"}"#)
                .unwrap();
        assert!(!config.use_tls);
        assert_eq!(config.ca_path, "/etc/ca.pem");
    }

    #[test]
    fn test_bad_version() {
        assert!(matches!(
            load_str(r#"{"config_version": 3}"#),
            Err(Error::ConfigRead(_))
        ));
    }

    #[test]
    fn test_unparseable() {
        assert!(matches!(load_str("not json"), Err(Error::ConfigRead(_))));
    }
}
