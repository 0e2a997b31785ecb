//! Error kinds surfaced to embedders
//!
//! Startup failures map to a specific kind so the embedder can print a
//! stable, human-readable explanation and exit. Runtime failures inside a
//! forwarding session never surface here; they terminate that session only.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("JSON config read failed")]
    ConfigRead(anyhow::Error),

    #[error("Init failed")]
    Init,

    #[error("Failed to start timer task")]
    InitTimer,

    #[error("Failed to start beacon task")]
    InitBeacon,

    #[error("Failed to start USB task")]
    InitUsb(anyhow::Error),

    #[error("Failed to start host network task")]
    InitHost(anyhow::Error),

    #[error("Failed to start interface task")]
    InitInterface,

    #[error("Failed to start manager task")]
    InitManager,

    #[error("Failed to start event handling")]
    InitHandler,

    #[error("Root permission required")]
    Permission,

    #[error("Certificate path for TLS communication needed")]
    CertPathNotDefined,

    #[error("Private key path for TLS communication needed")]
    KeyPathNotDefined,

    #[error("CA certificate path for TLS communication needed")]
    CaPathNotDefined,

    #[error("Private key password for TLS communication needed")]
    KeyPassNotDefined,

    #[error("Load VHCI driver with 'modprobe vhci-hcd'")]
    VhciDriver,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_strings() {
        assert_eq!(Error::Permission.to_string(), "Root permission required");
        assert_eq!(
            Error::VhciDriver.to_string(),
            "Load VHCI driver with 'modprobe vhci-hcd'"
        );
        assert_eq!(
            Error::CaPathNotDefined.to_string(),
            "CA certificate path for TLS communication needed"
        );
    }
}
