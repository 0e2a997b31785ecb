//! Beacon discovery from raw datagrams
//!
//! Runs the datagram-to-AvailableServer path the listener uses: decode the
//! packet bytes, then apply the compatibility filter.

use client::beacon::evaluate_beacon;
use protocol::{BEACON_IDENT, BeaconPacket};
use std::net::{IpAddr, Ipv4Addr};

fn datagram(major: u32, minor: u32, use_tls: bool, name: &str) -> Vec<u8> {
    BeaconPacket {
        ident: BEACON_IDENT,
        id: 3,
        version_major: major,
        version_minor: minor,
        name: name.into(),
        port: 3240,
        use_tls,
        attention: 0,
    }
    .encode()
}

fn source() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))
}

#[test]
fn compatible_server_is_discovered_from_bytes() {
    let bytes = datagram(0, 0, true, "lab-server");
    let packet = BeaconPacket::decode(&bytes).unwrap();

    let server = evaluate_beacon(&packet, source(), true, (0, 0)).unwrap();
    assert_eq!(server.ip, "10.0.0.7");
    assert_eq!(server.port, 3240);
    assert_eq!(server.name, "lab-server");
    assert_eq!(server.id, 3);
    assert_eq!(server.version, (0, 0));
}

#[test]
fn version_compatibility_matrix() {
    // Newer server minor: reported, with a warning in the log
    let packet = BeaconPacket::decode(&datagram(0, 1, true, "s")).unwrap();
    assert!(evaluate_beacon(&packet, source(), true, (0, 0)).is_some());

    // Newer server major: dropped silently
    let packet = BeaconPacket::decode(&datagram(1, 0, true, "s")).unwrap();
    assert!(evaluate_beacon(&packet, source(), true, (0, 0)).is_none());

    // Older server than client: fine
    let packet = BeaconPacket::decode(&datagram(0, 0, true, "s")).unwrap();
    assert!(evaluate_beacon(&packet, source(), true, (1, 2)).is_some());
}

#[test]
fn tls_mismatch_is_ignored() {
    let packet = BeaconPacket::decode(&datagram(0, 0, false, "plain")).unwrap();
    assert!(evaluate_beacon(&packet, source(), true, (0, 0)).is_none());
}

#[test]
fn short_datagram_is_dropped() {
    let bytes = datagram(0, 0, true, "s");
    assert!(BeaconPacket::decode(&bytes[..50]).is_err());
}

#[test]
fn truncated_name_still_decodes() {
    let long = "n".repeat(200);
    let bytes = datagram(0, 0, true, &long);
    let packet = BeaconPacket::decode(&bytes).unwrap();
    assert_eq!(packet.name.len(), 63);
}
