//! USB/IP wire protocol for RemoteHub
//!
//! This crate defines the on-wire representation shared by the server and
//! client: the OP_REQ/OP_REP command headers exchanged during device listing
//! and import, the 48-byte data header used while a device is being
//! forwarded, the device/interface records, and the UDP discovery beacon.
//!
//! All multi-byte integers are network byte order on the wire. Every record
//! provides `encode`/`decode` pairs over plain byte buffers so the transport
//! layer stays free of format knowledge.
//!
//! The format is compatible with the in-kernel USB/IP subsystem; see the
//! kernel's `Documentation/usb/usbip_protocol.rst` and
//! `drivers/usb/usbip/usbip_common.h`.

pub mod beacon;
pub mod device;
pub mod error;
pub mod op;
pub mod usbip;

pub use beacon::{AvailableServer, BEACON_IDENT, BeaconPacket};
pub use device::{Speed, UsbDevice, UsbInterface};
pub use error::{ProtocolError, Result};
pub use op::{
    OP_REP_DEVLIST, OP_REP_IMPORT, OP_REQ_DEVLIST, OP_REQ_IMPORT, OpCommon, Status,
    decode_import_request, encode_import_request,
};
pub use usbip::{
    CMD_SUBMIT, CMD_UNLINK, CmdSubmit, CmdUnlink, Direction, HeaderBasic, IsoPacketDescriptor,
    RET_SUBMIT, RET_UNLINK, RetSubmit, RetUnlink, UsbIpHeader, UsbIpHeaderUnion,
};

/// USB/IP protocol version advertised in every OP header (v1.1.1).
pub const PROTOCOL_VERSION: u16 = 0x0111;

/// Fixed size of the busid field in import requests and device records.
pub const BUSID_SIZE: usize = 32;

/// Fixed size of the path/display-string field in device records.
pub const PATH_SIZE: usize = 256;

/// Upper bound on interfaces carried per device in a devlist reply.
pub const MAX_INTERFACES: usize = 32;

/// Library version, used for beacon compatibility checks.
pub fn version() -> (u32, u32, u32) {
    let parse = |s: &str| s.parse().unwrap_or(0);
    (
        parse(env!("CARGO_PKG_VERSION_MAJOR")),
        parse(env!("CARGO_PKG_VERSION_MINOR")),
        parse(env!("CARGO_PKG_VERSION_PATCH")),
    )
}
