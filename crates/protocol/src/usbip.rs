//! The 48-byte USB/IP data header used in forwarding mode
//!
//! After an import succeeds the link carries a stream of these headers:
//! `CMD_SUBMIT`/`CMD_UNLINK` from the importing kernel, `RET_SUBMIT`/
//! `RET_UNLINK` back from the exporting side. The header is a 20-byte base
//! followed by a 28-byte command-specific body, zero-padded so every header
//! is exactly 48 bytes. Isochronous transfers append 16-byte packet
//! descriptors after the header (and after any data payload).

use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub const CMD_SUBMIT: u32 = 0x0001;
pub const CMD_UNLINK: u32 = 0x0002;
pub const RET_SUBMIT: u32 = 0x0003;
pub const RET_UNLINK: u32 = 0x0004;

/// Transfer direction as carried in `base.direction`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Direction {
    Out = 0,
    In = 1,
}

impl Direction {
    pub fn from_wire(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Direction::Out),
            1 => Ok(Direction::In),
            other => Err(ProtocolError::InvalidDirection(other)),
        }
    }
}

/// Common first five words of every data header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderBasic {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
}

/// CMD_SUBMIT body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CmdSubmit {
    pub transfer_flags: u32,
    pub transfer_buffer_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub interval: i32,
    /// Control setup packet; ignored on non-control endpoints
    pub setup: [u8; 8],
}

/// RET_SUBMIT body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetSubmit {
    /// 0 on success, negative POSIX errno on failure
    pub status: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
}

/// CMD_UNLINK body: the seqnum of the submission to cancel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CmdUnlink {
    pub seqnum: u32,
}

/// RET_UNLINK body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetUnlink {
    pub status: i32,
}

/// Command-specific body, keyed by `base.command`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbIpHeaderUnion {
    CmdSubmit(CmdSubmit),
    RetSubmit(RetSubmit),
    CmdUnlink(CmdUnlink),
    RetUnlink(RetUnlink),
}

/// One complete 48-byte data header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbIpHeader {
    pub base: HeaderBasic,
    pub u: UsbIpHeaderUnion,
}

impl UsbIpHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 48;

    pub fn cmd_submit(&self) -> Option<&CmdSubmit> {
        match &self.u {
            UsbIpHeaderUnion::CmdSubmit(c) => Some(c),
            _ => None,
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.base.command)?;
        writer.write_u32::<BigEndian>(self.base.seqnum)?;
        writer.write_u32::<BigEndian>(self.base.devid)?;
        writer.write_u32::<BigEndian>(self.base.direction)?;
        writer.write_u32::<BigEndian>(self.base.ep)?;

        match &self.u {
            UsbIpHeaderUnion::CmdSubmit(c) => {
                writer.write_u32::<BigEndian>(c.transfer_flags)?;
                writer.write_i32::<BigEndian>(c.transfer_buffer_length)?;
                writer.write_i32::<BigEndian>(c.start_frame)?;
                writer.write_i32::<BigEndian>(c.number_of_packets)?;
                writer.write_i32::<BigEndian>(c.interval)?;
                writer.write_all(&c.setup)?;
            }
            UsbIpHeaderUnion::RetSubmit(r) => {
                writer.write_i32::<BigEndian>(r.status)?;
                writer.write_i32::<BigEndian>(r.actual_length)?;
                writer.write_i32::<BigEndian>(r.start_frame)?;
                writer.write_i32::<BigEndian>(r.number_of_packets)?;
                writer.write_i32::<BigEndian>(r.error_count)?;
                writer.write_all(&[0u8; 8])?;
            }
            UsbIpHeaderUnion::CmdUnlink(c) => {
                writer.write_u32::<BigEndian>(c.seqnum)?;
                writer.write_all(&[0u8; 24])?;
            }
            UsbIpHeaderUnion::RetUnlink(r) => {
                writer.write_i32::<BigEndian>(r.status)?;
                writer.write_all(&[0u8; 24])?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let base = HeaderBasic {
            command: reader.read_u32::<BigEndian>()?,
            seqnum: reader.read_u32::<BigEndian>()?,
            devid: reader.read_u32::<BigEndian>()?,
            direction: reader.read_u32::<BigEndian>()?,
            ep: reader.read_u32::<BigEndian>()?,
        };

        let mut body = [0u8; 28];
        reader.read_exact(&mut body)?;
        let r = &mut &body[..];

        let u = match base.command {
            CMD_SUBMIT => {
                let mut c = CmdSubmit {
                    transfer_flags: r.read_u32::<BigEndian>()?,
                    transfer_buffer_length: r.read_i32::<BigEndian>()?,
                    start_frame: r.read_i32::<BigEndian>()?,
                    number_of_packets: r.read_i32::<BigEndian>()?,
                    interval: r.read_i32::<BigEndian>()?,
                    setup: [0u8; 8],
                };
                r.read_exact(&mut c.setup)?;
                UsbIpHeaderUnion::CmdSubmit(c)
            }
            RET_SUBMIT => UsbIpHeaderUnion::RetSubmit(RetSubmit {
                status: r.read_i32::<BigEndian>()?,
                actual_length: r.read_i32::<BigEndian>()?,
                start_frame: r.read_i32::<BigEndian>()?,
                number_of_packets: r.read_i32::<BigEndian>()?,
                error_count: r.read_i32::<BigEndian>()?,
            }),
            CMD_UNLINK => UsbIpHeaderUnion::CmdUnlink(CmdUnlink {
                seqnum: r.read_u32::<BigEndian>()?,
            }),
            RET_UNLINK => UsbIpHeaderUnion::RetUnlink(RetUnlink {
                status: r.read_i32::<BigEndian>()?,
            }),
            other => return Err(ProtocolError::UnknownCommand(other)),
        };

        Ok(Self { base, u })
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

/// Isochronous packet descriptor (wire layout, 16 bytes)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsoPacketDescriptor {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

impl IsoPacketDescriptor {
    /// Encoded size in bytes
    pub const SIZE: usize = 16;

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.offset)?;
        writer.write_u32::<BigEndian>(self.length)?;
        writer.write_u32::<BigEndian>(self.actual_length)?;
        writer.write_i32::<BigEndian>(self.status)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            offset: reader.read_u32::<BigEndian>()?,
            length: reader.read_u32::<BigEndian>()?,
            actual_length: reader.read_u32::<BigEndian>()?,
            status: reader.read_i32::<BigEndian>()?,
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
