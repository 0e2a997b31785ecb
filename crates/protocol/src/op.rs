//! OP_REQ/OP_REP command headers for device listing and import
//!
//! Every exchange starts with the 8-byte `OpCommon` header. The devlist
//! reply is followed by a `u32` device count, then device records each
//! trailed by their interface records; the import request carries a 32-byte
//! NUL-padded busid and its reply echoes the `UsbDevice` record.

use crate::device::{read_padded, write_padded};
use crate::error::{ProtocolError, Result};
use crate::{BUSID_SIZE, PROTOCOL_VERSION};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub const OP_REQ_DEVLIST: u16 = 0x8005;
pub const OP_REP_DEVLIST: u16 = 0x0005;
pub const OP_REQ_IMPORT: u16 = 0x8003;
pub const OP_REP_IMPORT: u16 = 0x0003;

/// Status codes carried in `OpCommon.status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0x00,
    Na = 0x01,
    DevBusy = 0x02,
    DevErr = 0x03,
    NoDev = 0x04,
    Error = 0x05,
}

impl Status {
    pub fn from_wire(value: u32) -> Result<Self> {
        match value {
            0x00 => Ok(Status::Ok),
            0x01 => Ok(Status::Na),
            0x02 => Ok(Status::DevBusy),
            0x03 => Ok(Status::DevErr),
            0x04 => Ok(Status::NoDev),
            0x05 => Ok(Status::Error),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

/// Shared request/reply header `{version, code, status}` (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCommon {
    pub version: u16,
    pub code: u16,
    pub status: u32,
}

impl OpCommon {
    /// Encoded size in bytes
    pub const SIZE: usize = 8;

    /// A request header for the given op code.
    pub fn request(code: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            code,
            status: Status::Ok as u32,
        }
    }

    /// A reply header for the given op code and status.
    pub fn reply(code: u16, status: Status) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            code,
            status: status as u32,
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.version)?;
        writer.write_u16::<BigEndian>(self.code)?;
        writer.write_u32::<BigEndian>(self.status)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            version: reader.read_u16::<BigEndian>()?,
            code: reader.read_u16::<BigEndian>()?,
            status: reader.read_u32::<BigEndian>()?,
        })
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        self.write_to(&mut &mut buf[..]).expect("array write");
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                needed: Self::SIZE,
                available: buf.len(),
            });
        }
        Self::read_from(&mut &buf[..])
    }
}

/// Encode the devlist reply device count.
pub fn encode_device_count(ndev: u32) -> [u8; 4] {
    ndev.to_be_bytes()
}

/// Decode the devlist reply device count.
pub fn decode_device_count(buf: &[u8]) -> Result<u32> {
    if buf.len() < 4 {
        return Err(ProtocolError::Truncated {
            needed: 4,
            available: buf.len(),
        });
    }
    Ok(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

/// Encode the import request body: a NUL-padded 32-byte busid.
pub fn encode_import_request(busid: &str) -> [u8; BUSID_SIZE] {
    let mut buf = [0u8; BUSID_SIZE];
    write_padded(&mut &mut buf[..], busid, BUSID_SIZE).expect("array write");
    buf
}

/// Decode the import request body.
pub fn decode_import_request(buf: &[u8]) -> Result<String> {
    if buf.len() < BUSID_SIZE {
        return Err(ProtocolError::Truncated {
            needed: BUSID_SIZE,
            available: buf.len(),
        });
    }
    read_padded(&mut &buf[..], BUSID_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_common_roundtrip() {
        let hdr = OpCommon::reply(OP_REP_DEVLIST, Status::Ok);
        let buf = hdr.encode();
        assert_eq!(buf, [0x01, 0x11, 0x00, 0x05, 0, 0, 0, 0]);
        assert_eq!(OpCommon::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_request_header() {
        let hdr = OpCommon::request(OP_REQ_IMPORT);
        assert_eq!(hdr.version, PROTOCOL_VERSION);
        assert_eq!(hdr.code, 0x8003);
        assert_eq!(hdr.status, 0);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::from_wire(2).unwrap(), Status::DevBusy);
        assert_eq!(Status::from_wire(4).unwrap(), Status::NoDev);
        assert!(Status::from_wire(9).is_err());
    }

    #[test]
    fn test_import_request_roundtrip() {
        let buf = encode_import_request("3-2.1");
        assert_eq!(buf.len(), BUSID_SIZE);
        assert_eq!(decode_import_request(&buf).unwrap(), "3-2.1");
    }

    #[test]
    fn test_device_count() {
        let buf = encode_device_count(2);
        assert_eq!(decode_device_count(&buf).unwrap(), 2);
        assert!(decode_device_count(&buf[..3]).is_err());
    }
}
