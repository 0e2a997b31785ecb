//! Discovery beacon listener
//!
//! Binds the beacon UDP port and turns acceptable datagrams into
//! `SERVER_DISCOVERED` events. A server is acceptable when the ident
//! matches, its TLS mode equals ours and its major version is not newer;
//! a newer minor version only warns.

use crate::events::ClientEvent;
use common::runtime::EventBus;
use common::DEFAULT_PORT;
use protocol::{AvailableServer, BEACON_IDENT, BeaconPacket};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

pub struct BeaconTask {
    stop_tx: Option<watch::Sender<bool>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

/// Decide whether a received beacon describes a usable server.
pub fn evaluate_beacon(
    packet: &BeaconPacket,
    source: IpAddr,
    use_tls: bool,
    our_version: (u32, u32),
) -> Option<AvailableServer> {
    if packet.ident != BEACON_IDENT || packet.use_tls != use_tls {
        return None;
    }

    debug!(
        "Found {} at {}:{}, version {}.{}",
        packet.name, source, packet.port, packet.version_major, packet.version_minor
    );

    if packet.version_major > our_version.0 {
        debug!("Server is not compatible");
        return None;
    }
    if packet.version_minor > our_version.1 {
        debug!("Server may have unsupported features");
    }

    Some(AvailableServer {
        ip: source.to_string(),
        id: packet.id,
        port: packet.port,
        version: (packet.version_major, packet.version_minor),
        name: packet.name.clone(),
    })
}

impl BeaconTask {
    /// Start listening. Failing to bind is tolerated: another listener
    /// already owns the port and discovery is simply unavailable.
    pub async fn spawn(bus: Arc<EventBus<ClientEvent>>, use_tls: bool) -> Self {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Beacon not supported: {}", e);
                return Self {
                    stop_tx: None,
                    handle: None,
                };
            }
        };

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            trace!("Beacon task starting");
            let mut buf = [0u8; 512];
            loop {
                let received = tokio::select! {
                    r = socket.recv_from(&mut buf) => r,
                    _ = stop_rx.wait_for(|s| *s) => break,
                };
                let (len, from) = match received {
                    Ok(rcv) => rcv,
                    Err(e) => {
                        debug!("Beacon receive failed ({})", e);
                        continue;
                    }
                };

                let Ok(packet) = BeaconPacket::decode(&buf[..len]) else {
                    continue;
                };
                trace!("Beacon received");

                let (major, minor, _) = protocol::version();
                if let Some(server) = evaluate_beacon(&packet, from.ip(), use_tls, (major, minor))
                    && !bus.enqueue(ClientEvent::ServerDiscovered(server)).await
                {
                    break;
                }
            }
            trace!("Beacon task exit");
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub async fn stop(self) {
        if let Some(stop_tx) = self.stop_tx {
            trace!("Beacon task terminate");
            let _ = stop_tx.send(true);
        }
        if let Some(handle) = self.handle {
            let _ = handle.await;
        }
    }
}
