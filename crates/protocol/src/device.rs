//! Device and interface records exchanged in devlist and import replies
//!
//! `UsbDevice` is the fixed 312-byte descriptor snapshot defined by the
//! USB/IP tool headers. The `path` field carries the human display string
//! ("Manufacturer - Product") rather than a sysfs path.

use crate::error::{ProtocolError, Result};
use crate::{BUSID_SIZE, PATH_SIZE};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// USB device speed, using the kernel's `usb_device_speed` codes.
///
/// The wireless slot (4) is skipped so the values line up with what the
/// VHCI driver expects in its attach string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Speed {
    Unknown = 0,
    /// 1.5 Mbps (USB 1.0)
    Low = 1,
    /// 12 Mbps (USB 1.1)
    Full = 2,
    /// 480 Mbps (USB 2.0)
    High = 3,
    /// 5 Gbps (USB 3.0)
    Super = 5,
    /// 10 Gbps (USB 3.1+)
    SuperPlus = 6,
}

impl Speed {
    pub fn from_wire(value: u32) -> Self {
        match value {
            1 => Speed::Low,
            2 => Speed::Full,
            3 => Speed::High,
            5 => Speed::Super,
            6 => Speed::SuperPlus,
            _ => Speed::Unknown,
        }
    }

    /// USB3 devices must be attached to a SuperSpeed VHCI hub.
    pub fn is_usb3(value: u32) -> bool {
        matches!(Speed::from_wire(value), Speed::Super | Speed::SuperPlus)
    }
}

/// Immutable device descriptor snapshot (wire layout, 312 bytes)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbDevice {
    /// Display string "Manufacturer - Product" (NUL-padded to 256 on wire)
    pub path: String,
    /// Platform bus id, e.g. "1-1.4" (NUL-padded to 32 on wire)
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub b_device_class: u8,
    pub b_device_subclass: u8,
    pub b_device_protocol: u8,
    pub b_configuration_value: u8,
    pub b_num_configurations: u8,
    pub b_num_interfaces: u8,
}

impl UsbDevice {
    /// Encoded size in bytes
    pub const SIZE: usize = PATH_SIZE + BUSID_SIZE + 12 + 6 + 6;

    /// The devid the VHCI driver expects: `devnum | busnum << 16`.
    pub fn devid(&self) -> u32 {
        self.devnum | (self.busnum << 16)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_padded(writer, &self.path, PATH_SIZE)?;
        write_padded(writer, &self.busid, BUSID_SIZE)?;
        writer.write_u32::<BigEndian>(self.busnum)?;
        writer.write_u32::<BigEndian>(self.devnum)?;
        writer.write_u32::<BigEndian>(self.speed)?;
        writer.write_u16::<BigEndian>(self.id_vendor)?;
        writer.write_u16::<BigEndian>(self.id_product)?;
        writer.write_u16::<BigEndian>(self.bcd_device)?;
        writer.write_u8(self.b_device_class)?;
        writer.write_u8(self.b_device_subclass)?;
        writer.write_u8(self.b_device_protocol)?;
        writer.write_u8(self.b_configuration_value)?;
        writer.write_u8(self.b_num_configurations)?;
        writer.write_u8(self.b_num_interfaces)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let path = read_padded(reader, PATH_SIZE)?;
        let busid = read_padded(reader, BUSID_SIZE)?;
        Ok(Self {
            path,
            busid,
            busnum: reader.read_u32::<BigEndian>()?,
            devnum: reader.read_u32::<BigEndian>()?,
            speed: reader.read_u32::<BigEndian>()?,
            id_vendor: reader.read_u16::<BigEndian>()?,
            id_product: reader.read_u16::<BigEndian>()?,
            bcd_device: reader.read_u16::<BigEndian>()?,
            b_device_class: reader.read_u8()?,
            b_device_subclass: reader.read_u8()?,
            b_device_protocol: reader.read_u8()?,
            b_configuration_value: reader.read_u8()?,
            b_num_configurations: reader.read_u8()?,
            b_num_interfaces: reader.read_u8()?,
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

/// Per-interface class triple (wire layout, 4 bytes)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsbInterface {
    pub b_interface_class: u8,
    pub b_interface_subclass: u8,
    pub b_interface_protocol: u8,
    pub padding: u8,
}

impl UsbInterface {
    /// Encoded size in bytes
    pub const SIZE: usize = 4;

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.b_interface_class)?;
        writer.write_u8(self.b_interface_subclass)?;
        writer.write_u8(self.b_interface_protocol)?;
        writer.write_u8(self.padding)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            b_interface_class: reader.read_u8()?,
            b_interface_subclass: reader.read_u8()?,
            b_interface_protocol: reader.read_u8()?,
            padding: reader.read_u8()?,
        })
    }
}

/// Write a string NUL-padded to `len` bytes, truncating to `len - 1`.
pub(crate) fn write_padded<W: Write>(writer: &mut W, s: &str, len: usize) -> Result<()> {
    let bytes = s.as_bytes();
    let take = bytes.len().min(len - 1);
    writer.write_all(&bytes[..take])?;
    writer.write_all(&vec![0u8; len - take])?;
    Ok(())
}

/// Read a NUL-padded string field of `len` bytes.
pub(crate) fn read_padded<R: Read>(reader: &mut R, len: usize) -> Result<String> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(len);
    Ok(std::str::from_utf8(&buf[..end])?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_device() -> UsbDevice {
        UsbDevice {
            path: "Logitech - Unifying Receiver".into(),
            busid: "1-1.4".into(),
            busnum: 1,
            devnum: 4,
            speed: Speed::Full as u32,
            id_vendor: 0x046d,
            id_product: 0xc52b,
            bcd_device: 0x1201,
            b_device_class: 0,
            b_device_subclass: 0,
            b_device_protocol: 0,
            b_configuration_value: 0,
            b_num_configurations: 1,
            b_num_interfaces: 3,
        }
    }

    #[test]
    fn test_device_roundtrip() {
        let dev = sample_device();
        let buf = dev.encode();
        assert_eq!(buf.len(), UsbDevice::SIZE);

        let decoded = UsbDevice::decode(&buf).unwrap();
        assert_eq!(decoded, dev);
    }

    #[test]
    fn test_device_field_offsets() {
        let buf = sample_device().encode();
        // busnum begins right after the two string fields, network order
        assert_eq!(&buf[288..292], &[0, 0, 0, 1]);
        // idVendor after busnum/devnum/speed
        assert_eq!(&buf[300..302], &[0x04, 0x6d]);
        assert_eq!(&buf[302..304], &[0xc5, 0x2b]);
    }

    #[test]
    fn test_device_truncated() {
        let buf = sample_device().encode();
        assert!(matches!(
            UsbDevice::decode(&buf[..100]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_devid() {
        let dev = sample_device();
        assert_eq!(dev.devid(), (1 << 16) | 4);
    }

    #[test]
    fn test_interface_roundtrip() {
        let intf = UsbInterface {
            b_interface_class: 3,
            b_interface_subclass: 1,
            b_interface_protocol: 2,
            padding: 0,
        };
        let mut buf = Vec::new();
        intf.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), UsbInterface::SIZE);
        assert_eq!(UsbInterface::read_from(&mut &buf[..]).unwrap(), intf);
    }

    #[test]
    fn test_speed_mapping() {
        assert_eq!(Speed::from_wire(1), Speed::Low);
        assert_eq!(Speed::from_wire(3), Speed::High);
        assert_eq!(Speed::from_wire(4), Speed::Unknown);
        assert_eq!(Speed::from_wire(5), Speed::Super);
        assert!(Speed::is_usb3(6));
        assert!(!Speed::is_usb3(3));
    }

    #[test]
    fn test_padded_string_truncation() {
        let mut buf = Vec::new();
        let long = "x".repeat(BUSID_SIZE * 2);
        write_padded(&mut buf, &long, BUSID_SIZE).unwrap();
        assert_eq!(buf.len(), BUSID_SIZE);
        // last byte always NUL
        assert_eq!(buf[BUSID_SIZE - 1], 0);
        let back = read_padded(&mut &buf[..], BUSID_SIZE).unwrap();
        assert_eq!(back.len(), BUSID_SIZE - 1);
    }
}
