//! VHCI sysfs interface
//!
//! Talks to the vhci_hcd kernel driver: parses its `status` file to find a
//! free port of the right USB generation and writes the `attach`/`detach`
//! nodes. Each write is a single syscall on the node.

use protocol::BUSID_SIZE;
use std::io::Write;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use tracing::{debug, error};

const VHCI_BASE: &str = "/sys/devices/platform/vhci_hcd.0";

pub const VHCI_MAX_PORTS: usize = 16;
pub const VHCI_PORT_AVAILABLE: i32 = 4;

/// One row of the VHCI status file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhciPort {
    /// "hs" or "ss"
    pub hub: String,
    pub port: u32,
    pub status: i32,
    pub speed: u32,
    pub devid: u32,
    pub connfd: i32,
    pub local_busid: String,
}

fn node(attr: &str) -> PathBuf {
    PathBuf::from(VHCI_BASE).join(attr)
}

/// The vhci_hcd module is loaded and its status node readable.
pub fn is_available() -> bool {
    node("status").exists()
}

/// Parse the status file: a header line, then
/// `hub port sta spd dev sockfd local_busid` rows (devid in hex).
pub fn parse_status(content: &str) -> anyhow::Result<Vec<VhciPort>> {
    let mut ports = Vec::new();

    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 7 {
            anyhow::bail!("Malformed status row: {:?}", line);
        }

        let mut local_busid = fields[6].to_string();
        local_busid.truncate(BUSID_SIZE - 1);

        ports.push(VhciPort {
            hub: fields[0].chars().take(2).collect(),
            port: fields[1].parse()?,
            status: fields[2].parse()?,
            speed: fields[3].parse()?,
            devid: u32::from_str_radix(fields[4], 16)?,
            connfd: fields[5].parse()?,
            local_busid,
        });
        if ports.len() >= VHCI_MAX_PORTS {
            break;
        }
    }

    Ok(ports)
}

/// First available port on the hub matching the device generation.
pub fn free_port(ports: &[VhciPort], usb3: bool) -> Option<u32> {
    let hub = if usb3 { "ss" } else { "hs" };
    let found = ports
        .iter()
        .find(|p| p.hub == hub && p.status == VHCI_PORT_AVAILABLE)
        .map(|p| p.port);
    if found.is_none() {
        error!("No free {} ports", if usb3 { "USB3" } else { "USB2" });
    }
    found
}

/// Read and parse the live status node.
pub fn read_ports() -> anyhow::Result<Vec<VhciPort>> {
    let content = std::fs::read_to_string(node("status"))?;
    parse_status(&content)
}

/// Hand a connected socket to the kernel:
/// `attach` takes `"<port> <sockfd> <devid> <speed>"`.
pub fn attach(port: u32, sockfd: RawFd, devid: u32, speed: u32) -> anyhow::Result<()> {
    let value = format!("{} {} {} {}", port, sockfd, devid, speed);
    debug!("VHCI attach: {}", value);

    let mut file = std::fs::OpenOptions::new().write(true).open(node("attach"))?;
    file.write_all(value.as_bytes())?;
    Ok(())
}

/// Release a VHCI port: `detach` takes `"<port>"`.
pub fn detach(port: u32) -> anyhow::Result<()> {
    debug!("Detach port {}", port);

    let mut file = std::fs::OpenOptions::new().write(true).open(node("detach"))?;
    file.write_all(port.to_string().as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "\
hub port sta spd dev      sockfd local_busid
hs  0000 004 000 00000000 000000 0-0
hs  0001 006 003 00010004 000005 1-1
ss  0008 004 000 00000000 000000 0-0
ss  0009 006 005 00020003 000007 2-2
";

    #[test]
    fn test_parse_status() {
        let ports = parse_status(STATUS).unwrap();
        assert_eq!(ports.len(), 4);

        assert_eq!(ports[0].hub, "hs");
        assert_eq!(ports[0].port, 0);
        assert_eq!(ports[0].status, VHCI_PORT_AVAILABLE);

        assert_eq!(ports[1].status, 6);
        assert_eq!(ports[1].speed, 3);
        assert_eq!(ports[1].devid, 0x00010004);
        assert_eq!(ports[1].connfd, 5);
        assert_eq!(ports[1].local_busid, "1-1");

        assert_eq!(ports[2].hub, "ss");
        assert_eq!(ports[2].port, 8);
        assert_eq!(ports[3].devid, 0x00020003);
    }

    #[test]
    fn test_free_port_by_generation() {
        let ports = parse_status(STATUS).unwrap();
        assert_eq!(free_port(&ports, false), Some(0));
        assert_eq!(free_port(&ports, true), Some(8));
    }

    #[test]
    fn test_no_free_port() {
        let full = "\
hub port sta spd dev      sockfd local_busid
hs  0000 006 003 00010004 000005 1-1
ss  0008 006 005 00020003 000007 2-2
";
        let ports = parse_status(full).unwrap();
        assert_eq!(free_port(&ports, false), None);
        assert_eq!(free_port(&ports, true), None);
    }

    #[test]
    fn test_malformed_row() {
        assert!(parse_status("header\nhs 0000 004\n").is_err());
    }

    #[test]
    fn test_header_only() {
        let ports = parse_status("hub port sta spd dev sockfd local_busid\n").unwrap();
        assert!(ports.is_empty());
    }
}
