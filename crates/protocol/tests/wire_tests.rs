//! Integration tests for the USB/IP wire format
//!
//! Exercises full devlist/import byte streams the way the two peers produce
//! and consume them, on top of the per-record round-trips in the unit tests.

use protocol::{
    BUSID_SIZE, BeaconPacket, CMD_SUBMIT, CmdSubmit, Direction, HeaderBasic, IsoPacketDescriptor,
    OP_REP_DEVLIST, OP_REQ_DEVLIST, OpCommon, PROTOCOL_VERSION, RET_SUBMIT, RetSubmit, Status,
    UsbDevice, UsbIpHeader, UsbIpHeaderUnion, UsbInterface, decode_import_request,
    encode_import_request,
};
use protocol::op::{decode_device_count, encode_device_count};

fn device(busid: &str, vid: u16, pid: u16, interfaces: u8) -> UsbDevice {
    UsbDevice {
        path: format!("Vendor{vid:04x} - Product{pid:04x}"),
        busid: busid.to_string(),
        busnum: 1,
        devnum: 2,
        speed: 3,
        id_vendor: vid,
        id_product: pid,
        bcd_device: 0x0100,
        b_device_class: 0,
        b_device_subclass: 0,
        b_device_protocol: 0,
        b_configuration_value: 0,
        b_num_configurations: 1,
        b_num_interfaces: interfaces,
    }
}

/// Build the byte stream a server emits for a devlist reply.
fn devlist_reply_stream(devices: &[(UsbDevice, Vec<UsbInterface>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&OpCommon::reply(OP_REP_DEVLIST, Status::Ok).encode());
    out.extend_from_slice(&encode_device_count(devices.len() as u32));
    for (dev, intfs) in devices {
        out.extend_from_slice(&dev.encode());
        for intf in intfs {
            let mut buf = Vec::new();
            intf.write_to(&mut buf).unwrap();
            out.extend_from_slice(&buf);
        }
    }
    out
}

#[test]
fn devlist_empty_reply() {
    let stream = devlist_reply_stream(&[]);
    assert_eq!(stream.len(), OpCommon::SIZE + 4);

    let hdr = OpCommon::decode(&stream).unwrap();
    assert_eq!(hdr.version, PROTOCOL_VERSION);
    assert_eq!(hdr.code, OP_REP_DEVLIST);
    assert_eq!(Status::from_wire(hdr.status).unwrap(), Status::Ok);
    assert_eq!(decode_device_count(&stream[OpCommon::SIZE..]).unwrap(), 0);
}

#[test]
fn devlist_two_devices() {
    let hid = UsbInterface {
        b_interface_class: 3,
        b_interface_subclass: 1,
        b_interface_protocol: 1,
        padding: 0,
    };
    let devices = vec![
        (device("1-1", 0x046d, 0xc52b, 2), vec![hid, hid]),
        (device("1-2", 0x1234, 0x5678, 1), vec![hid]),
    ];
    let stream = devlist_reply_stream(&devices);

    // Client-side parse
    let mut cursor = &stream[..];
    let hdr = OpCommon::read_from(&mut cursor).unwrap();
    assert_eq!(hdr.code, OP_REP_DEVLIST);
    let mut count_buf = [0u8; 4];
    std::io::Read::read_exact(&mut cursor, &mut count_buf).unwrap();
    let ndev = decode_device_count(&count_buf).unwrap();
    assert_eq!(ndev, 2);

    let mut seen = Vec::new();
    for _ in 0..ndev {
        let dev = UsbDevice::read_from(&mut cursor).unwrap();
        for _ in 0..dev.b_num_interfaces {
            let intf = UsbInterface::read_from(&mut cursor).unwrap();
            assert_eq!(intf.b_interface_class, 3);
        }
        seen.push(dev);
    }
    assert!(cursor.is_empty());
    assert_eq!(seen[0].busid, "1-1");
    assert_eq!(seen[0].id_vendor, 0x046d);
    assert_eq!(seen[1].busid, "1-2");
    assert_eq!(seen[1].id_product, 0x5678);
}

#[test]
fn devlist_request_header() {
    let hdr = OpCommon::request(OP_REQ_DEVLIST);
    let decoded = OpCommon::decode(&hdr.encode()).unwrap();
    assert_eq!(decoded.code, OP_REQ_DEVLIST);
    assert_eq!(decoded.status, Status::Ok as u32);
}

#[test]
fn import_exchange_bytes() {
    // Request: header + padded busid
    let req = encode_import_request("1-1.4");
    assert_eq!(req.len(), BUSID_SIZE);
    assert_eq!(decode_import_request(&req).unwrap(), "1-1.4");

    // Reply: header + device record
    let dev = device("1-1.4", 0x046d, 0xc52b, 2);
    let mut stream = Vec::new();
    stream.extend_from_slice(&OpCommon::reply(protocol::OP_REP_IMPORT, Status::Ok).encode());
    stream.extend_from_slice(&dev.encode());

    let mut cursor = &stream[..];
    let hdr = OpCommon::read_from(&mut cursor).unwrap();
    assert_eq!(hdr.code, protocol::OP_REP_IMPORT);
    let echoed = UsbDevice::read_from(&mut cursor).unwrap();
    assert_eq!(echoed, dev);
}

#[test]
fn submit_reply_seqnum_echo() {
    // The GET_DESCRIPTOR(DEVICE) shape from a freshly imported device
    let submit = UsbIpHeader {
        base: HeaderBasic {
            command: CMD_SUBMIT,
            seqnum: 1,
            devid: (1 << 16) | 2,
            direction: Direction::In as u32,
            ep: 0,
        },
        u: UsbIpHeaderUnion::CmdSubmit(CmdSubmit {
            transfer_flags: 0,
            transfer_buffer_length: 18,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
        }),
    };
    let parsed = UsbIpHeader::decode(&submit.encode()).unwrap();

    // The reply reuses the request base, as the forwarding engine does
    let reply = UsbIpHeader {
        base: HeaderBasic {
            command: RET_SUBMIT,
            ..parsed.base
        },
        u: UsbIpHeaderUnion::RetSubmit(RetSubmit {
            status: 0,
            actual_length: 18,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
        }),
    };
    let parsed_reply = UsbIpHeader::decode(&reply.encode()).unwrap();
    assert_eq!(parsed_reply.base.seqnum, 1);
    assert_eq!(parsed_reply.base.devid, (1 << 16) | 2);
    match parsed_reply.u {
        UsbIpHeaderUnion::RetSubmit(r) => {
            assert_eq!(r.status, 0);
            assert_eq!(r.actual_length, 18);
        }
        other => panic!("unexpected union {other:?}"),
    }
}

#[test]
fn iso_descriptor_stream() {
    let descs: Vec<IsoPacketDescriptor> = (0..4)
        .map(|i| IsoPacketDescriptor {
            offset: i * 192,
            length: 192,
            actual_length: 188,
            status: 0,
        })
        .collect();

    let mut stream = Vec::new();
    for d in &descs {
        stream.extend_from_slice(&d.encode());
    }
    assert_eq!(stream.len(), 4 * IsoPacketDescriptor::SIZE);

    for (i, chunk) in stream.chunks(IsoPacketDescriptor::SIZE).enumerate() {
        let d = IsoPacketDescriptor::decode(chunk).unwrap();
        assert_eq!(d.offset, i as u32 * 192);
        assert_eq!(d.actual_length, 188);
    }
}

#[test]
fn beacon_size_is_stable() {
    // The packed layout the listener depends on when filtering datagrams
    let buf = BeaconPacket::new("RemoteHub", 3240, true).encode();
    assert_eq!(buf.len(), BeaconPacket::SIZE);
    assert_eq!(BeaconPacket::SIZE, 87);
}
