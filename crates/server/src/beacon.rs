//! Discovery beacon transmitter
//!
//! Broadcasts one beacon packet on every 5-second tick so clients on the
//! local network can find this server without configuration.

use crate::events::{EVENT_TIMER_5S, ServerEvent};
use crate::config::ServerConfig;
use common::runtime::EventBus;
use protocol::BeaconPacket;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{trace, warn};

pub struct BeaconTask {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl BeaconTask {
    pub async fn spawn(
        bus: Arc<EventBus<ServerEvent>>,
        config: &ServerConfig,
    ) -> anyhow::Result<Self> {
        if !config.bcast_enabled {
            return Ok(Self { handle: None });
        }

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;

        let packet = BeaconPacket::new(&config.server_name, config.port, config.use_tls);
        let target = (Ipv4Addr::BROADCAST, config.port);
        let mailbox = bus.register("Beacon task", EVENT_TIMER_5S).await;

        let handle = tokio::spawn(async move {
            trace!("Beacon task starting");
            let buf = packet.encode();
            while let Some(event) = mailbox.recv().await {
                if let ServerEvent::Timer5s = event {
                    trace!("Received EVENT_TIMER_5S");
                    if let Err(e) = socket.send_to(&buf, target).await {
                        warn!("Beacon sendto failed: {}", e);
                    }
                }
            }
            trace!("Beacon task exit");
        });

        Ok(Self {
            handle: Some(handle),
        })
    }

    pub async fn stop(self) {
        if let Some(handle) = self.handle {
            trace!("Beacon task terminate");
            let _ = handle.await;
        }
    }
}
