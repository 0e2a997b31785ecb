//! Client sides of the devlist and import exchanges
//!
//! Each command opens its own link to the server. The devlist link is
//! closed once the records are in; the import link is returned to the
//! caller, ready to carry the forwarding session.

use common::link::HANDSHAKE_TIMEOUT;
use common::{Link, TlsClientSetup};
use protocol::{
    OP_REP_DEVLIST, OP_REP_IMPORT, OP_REQ_DEVLIST, OP_REQ_IMPORT, OpCommon, Status, UsbDevice,
    UsbInterface, encode_import_request,
};
use protocol::op::decode_device_count;
use std::net::{IpAddr, SocketAddr};
use tokio::time::timeout;
use tracing::{debug, error};

/// Where and how to reach one server
pub struct ClientConn {
    pub ip: IpAddr,
    pub port: u16,
    pub tls: Option<TlsClientSetup>,
}

impl ClientConn {
    fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

async fn recv_reply_header(link: &mut Link, expected_code: u16) -> anyhow::Result<()> {
    let mut hdr_buf = [0u8; OpCommon::SIZE];
    timeout(HANDSHAKE_TIMEOUT, link.recv_all(&mut hdr_buf)).await??;
    let hdr = OpCommon::decode(&hdr_buf)?;

    if hdr.code != expected_code {
        anyhow::bail!("Incorrect header {:#x}", hdr.code);
    }
    let status = Status::from_wire(hdr.status)?;
    if status != Status::Ok {
        anyhow::bail!("Request failed with {:?}", status);
    }
    Ok(())
}

/// Fetch the exportable-device list from a server.
pub async fn exec_devlist(conn: &ClientConn) -> anyhow::Result<Vec<UsbDevice>> {
    let mut link = Link::connect(conn.addr(), conn.tls.as_ref()).await?;

    link.send_all(&OpCommon::request(OP_REQ_DEVLIST).encode())
        .await?;
    recv_reply_header(&mut link, OP_REP_DEVLIST).await?;

    let mut count_buf = [0u8; 4];
    timeout(HANDSHAKE_TIMEOUT, link.recv_all(&mut count_buf)).await??;
    let ndev = decode_device_count(&count_buf)?;
    debug!("Incoming {} devices", ndev);

    let mut devices = Vec::with_capacity(ndev as usize);
    for _ in 0..ndev {
        let mut dev_buf = vec![0u8; UsbDevice::SIZE];
        timeout(HANDSHAKE_TIMEOUT, link.recv_all(&mut dev_buf)).await??;
        let dev = UsbDevice::decode(&dev_buf)?;

        // Interface records are drained but not kept
        let mut intf_buf = [0u8; UsbInterface::SIZE];
        for _ in 0..dev.b_num_interfaces {
            timeout(HANDSHAKE_TIMEOUT, link.recv_all(&mut intf_buf)).await??;
        }
        devices.push(dev);
    }

    link.shut().await;
    Ok(devices)
}

/// Import a device by busid. On success the returned link is in forwarding
/// mode and the echoed device record describes what the server exported.
pub async fn exec_import(conn: &ClientConn, busid: &str) -> anyhow::Result<(UsbDevice, Link)> {
    let mut link = match Link::connect(conn.addr(), conn.tls.as_ref()).await {
        Ok(link) => link,
        Err(e) => {
            error!("Connect failed: {}", e);
            return Err(e.into());
        }
    };

    link.send_all(&OpCommon::request(OP_REQ_IMPORT).encode())
        .await?;
    link.send_all(&encode_import_request(busid)).await?;
    recv_reply_header(&mut link, OP_REP_IMPORT).await?;

    let mut dev_buf = vec![0u8; UsbDevice::SIZE];
    timeout(HANDSHAKE_TIMEOUT, link.recv_all(&mut dev_buf)).await??;
    let dev = UsbDevice::decode(&dev_buf)?;

    Ok((dev, link))
}
