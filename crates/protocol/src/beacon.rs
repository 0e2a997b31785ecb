//! UDP discovery beacon packet
//!
//! Servers broadcast one of these every five seconds; clients listen on the
//! same port and filter by ident, TLS mode and version. The `attention`
//! field is carried on the wire but not interpreted by either side.

use crate::device::{read_padded, write_padded};
use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// "RHBN" in network order
pub const BEACON_IDENT: u32 = 0x5248424E;

/// Maximum server name length, including the trailing NUL
pub const SERVER_NAME_SIZE: usize = 64;

/// Discovery packet broadcast by servers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeaconPacket {
    pub ident: u32,
    pub id: u32,
    pub version_major: u32,
    pub version_minor: u32,
    pub name: String,
    pub port: u16,
    pub use_tls: bool,
    /// Reserved
    pub attention: u32,
}

impl BeaconPacket {
    /// Encoded size in bytes (packed layout)
    pub const SIZE: usize = 16 + SERVER_NAME_SIZE + 2 + 1 + 4;

    pub fn new(name: &str, port: u16, use_tls: bool) -> Self {
        let (major, minor, _) = crate::version();
        Self {
            ident: BEACON_IDENT,
            id: 0,
            version_major: major,
            version_minor: minor,
            name: name.to_string(),
            port,
            use_tls,
            attention: 0,
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.ident)?;
        writer.write_u32::<BigEndian>(self.id)?;
        writer.write_u32::<BigEndian>(self.version_major)?;
        writer.write_u32::<BigEndian>(self.version_minor)?;
        write_padded(writer, &self.name, SERVER_NAME_SIZE)?;
        writer.write_u16::<BigEndian>(self.port)?;
        writer.write_u8(self.use_tls as u8)?;
        writer.write_u32::<BigEndian>(self.attention)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            ident: reader.read_u32::<BigEndian>()?,
            id: reader.read_u32::<BigEndian>()?,
            version_major: reader.read_u32::<BigEndian>()?,
            version_minor: reader.read_u32::<BigEndian>()?,
            name: read_padded(reader, SERVER_NAME_SIZE)?,
            port: reader.read_u16::<BigEndian>()?,
            use_tls: reader.read_u8()? != 0,
            attention: reader.read_u32::<BigEndian>()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut buf).expect("vec write");
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

/// A server seen on the local network, as reported to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableServer {
    pub ip: String,
    pub id: u32,
    pub port: u16,
    pub version: (u32, u32),
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_roundtrip() {
        let pkt = BeaconPacket {
            ident: BEACON_IDENT,
            id: 7,
            version_major: 0,
            version_minor: 1,
            name: "workbench".into(),
            port: 3240,
            use_tls: true,
            attention: 0,
        };
        let buf = pkt.encode();
        assert_eq!(buf.len(), BeaconPacket::SIZE);
        assert_eq!(BeaconPacket::decode(&buf).unwrap(), pkt);
    }

    #[test]
    fn test_beacon_ident_bytes() {
        let buf = BeaconPacket::new("x", 3240, false).encode();
        // "RHBN"
        assert_eq!(&buf[..4], &[0x52, 0x48, 0x42, 0x4E]);
    }

    #[test]
    fn test_beacon_short_datagram() {
        let pkt = BeaconPacket::new("x", 3240, false);
        let buf = pkt.encode();
        assert!(BeaconPacket::decode(&buf[..40]).is_err());
    }
}
