//! Protocol decode errors

use thiserror::Error;

/// Errors raised while decoding wire records
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Record shorter than its fixed layout
    #[error("Truncated record: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// Command code not defined by the protocol
    #[error("Unknown USB/IP command {0:#06x}")]
    UnknownCommand(u32),

    /// Operation code not defined by the protocol
    #[error("Unknown USB/IP operation {0:#06x}")]
    UnknownOp(u16),

    /// Status value outside the defined set
    #[error("Unknown USB/IP status {0:#x}")]
    UnknownStatus(u32),

    /// Direction field was neither IN nor OUT
    #[error("Invalid transfer direction {0}")]
    InvalidDirection(u32),

    /// A NUL-padded string field held invalid UTF-8
    #[error("Invalid string field: {0}")]
    InvalidString(#[from] std::str::Utf8Error),

    /// I/O error surfaced by the underlying reader/writer
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
