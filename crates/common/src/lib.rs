//! Shared runtime for the RemoteHub server and client
//!
//! This crate provides the pieces both binaries are built from: the typed,
//! mask-filtered event bus with per-task mailboxes, the shared timer worker,
//! the TCP/TLS link abstraction, error kinds, and logging setup.

pub mod error;
pub mod link;
pub mod logging;
pub mod runtime;
pub mod timer;

pub use error::{Error, Result};
pub use link::{
    HANDSHAKE_TIMEOUT, Link, SharedLink, TlsClientSetup, build_tls_acceptor, share_link, take_link,
};
pub use logging::setup_logging;
pub use runtime::{BusEvent, EventBus, MAILBOX_CAPACITY, Mailbox};
pub use timer::spawn_timer;

/// Default USB/IP TCP and beacon UDP port (IANA)
pub const DEFAULT_PORT: u16 = 3240;

/// Maximum length of a server name, including the trailing NUL
pub const SERVER_NAME_MAX_LEN: usize = 64;

/// Maximum length of a textual server address
pub const IP_NAME_MAX_LEN: usize = 64;
