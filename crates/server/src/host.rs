//! Host network task
//!
//! Accepts incoming TCP (or TLS) connections, reads the one OP header every
//! exchange starts with, and hands the link to the USB task as a devlist or
//! import request. Protocol errors close the link and are never fatal.

use crate::config::ServerConfig;
use crate::events::ServerEvent;
use common::link::{HANDSHAKE_TIMEOUT, TlsAcceptor};
use common::runtime::EventBus;
use common::{Link, build_tls_acceptor, share_link};
use protocol::{OP_REQ_DEVLIST, OP_REQ_IMPORT, OpCommon};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, trace};

pub struct HostTask {
    stop_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl HostTask {
    pub async fn spawn(
        bus: Arc<EventBus<ServerEvent>>,
        config: &ServerConfig,
    ) -> anyhow::Result<Self> {
        trace!("Host network init");

        let acceptor = if config.use_tls {
            let cert = config.cert_path.as_deref().unwrap_or("");
            let key = config.key_path.as_deref().unwrap_or("");
            Some(build_tls_acceptor(cert, key)?)
        } else {
            None
        };

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(5)?;
        debug!("Server bound - port {}", config.port);

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            accept_loop(bus, listener, acceptor, &mut stop_rx).await;
            trace!("Host exit");
        });

        Ok(Self { stop_tx, handle })
    }

    pub async fn stop(self) {
        trace!("Host network terminate");
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
        trace!("Host network terminated");
    }
}

async fn accept_loop(
    bus: Arc<EventBus<ServerEvent>>,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    stop_rx: &mut watch::Receiver<bool>,
) {
    loop {
        trace!("Listening...");
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = stop_rx.wait_for(|s| *s) => return,
        };

        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                error!("Accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };
        debug!("Incoming connection from {}", peer);

        let link = match Link::accept(stream, acceptor.as_ref()).await {
            Ok(link) => link,
            Err(e) => {
                error!("Connection setup failed: {}", e);
                continue;
            }
        };

        handle_usbip_command(&bus, link).await;
    }
}

/// Read the OP header and route the link to the USB task.
async fn handle_usbip_command(bus: &Arc<EventBus<ServerEvent>>, mut link: Link) {
    let mut hdr_buf = [0u8; OpCommon::SIZE];
    let received = timeout(HANDSHAKE_TIMEOUT, link.recv_all(&mut hdr_buf)).await;
    if !matches!(received, Ok(Ok(()))) {
        error!("Failed to receive usbip header");
        return;
    }

    let hdr = match OpCommon::decode(&hdr_buf) {
        Ok(hdr) => hdr,
        Err(e) => {
            error!("Bad usbip header: {}", e);
            return;
        }
    };

    match hdr.code {
        OP_REQ_DEVLIST => {
            debug!("Received OP_REQ_DEVLIST");
            bus.enqueue(ServerEvent::DevlistRequest(share_link(link)))
                .await;
        }
        OP_REQ_IMPORT => {
            debug!("Received OP_REQ_IMPORT");
            bus.enqueue(ServerEvent::ImportRequest(share_link(link)))
                .await;
        }
        other => {
            error!("Unknown command {:#x}", other);
        }
    }
}
