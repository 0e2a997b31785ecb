//! RemoteHub client
//!
//! Discovers servers on the local network, fetches their device lists and
//! attaches selected devices to the local VHCI controller, bridging USB/IP
//! traffic between the kernel and the remote server.

pub mod beacon;
pub mod bridge;
pub mod command;
pub mod config;
pub mod events;
pub mod interface;
pub mod manager;
pub mod vhci;

use crate::beacon::BeaconTask;
use crate::events::{ClientEvent, InterfaceRequest};
use crate::interface::InterfaceTask;
use crate::manager::{MANAGER_EVENT_MASK, ManagerTask};
use common::runtime::EventBus;
use common::{Error, spawn_timer};
use protocol::UsbDevice;
use std::sync::Arc;
use tracing::error;

pub use crate::config::ClientConfig;
pub use crate::interface::{AttachCallback, DevicelistCallback, DiscoveryCallback};

pub struct Client {
    bus: Arc<EventBus<ClientEvent>>,
    timer: tokio::task::JoinHandle<()>,
    beacon: BeaconTask,
    manager: ManagerTask,
    interface: InterfaceTask,
}

impl Client {
    /// Start every client task. Requires root for the VHCI sysfs nodes.
    pub async fn start(config: ClientConfig) -> common::Result<Self> {
        if !nix::unistd::geteuid().is_root() {
            error!("Sudo needed to access USB peripherals");
            return Err(Error::Permission);
        }

        let bus = Arc::new(EventBus::new());
        let timer = spawn_timer(bus.clone(), ClientEvent::Timer1s, ClientEvent::Timer5s);
        let beacon = BeaconTask::spawn(bus.clone(), config.use_tls).await;

        let manager_mailbox = bus.register("Manager task", MANAGER_EVENT_MASK).await;
        let manager = match ManagerTask::spawn(
            bus.clone(),
            manager_mailbox,
            config.use_tls,
            &config.ca_path,
        ) {
            Ok(manager) => manager,
            Err(e) => {
                error!("Manager task init failed");
                bus.enqueue(ClientEvent::Terminate).await;
                beacon.stop().await;
                let _ = timer.await;
                return Err(e);
            }
        };

        let interface = InterfaceTask::spawn(&bus).await;

        Ok(Self {
            bus,
            timer,
            beacon,
            manager,
            interface,
        })
    }

    /// Ask a server for its exportable devices; the result arrives through
    /// the devicelist callback.
    pub async fn get_devicelist(&self, ip: &str, port: u16) {
        self.bus
            .enqueue(ClientEvent::DevicelistRequest(InterfaceRequest {
                ip: ip.to_string(),
                port,
                dev: UsbDevice::default(),
            }))
            .await;
    }

    /// Attach a device previously seen in a device list.
    pub async fn attach_device(&self, ip: &str, port: u16, dev: UsbDevice) {
        self.bus
            .enqueue(ClientEvent::AttachRequested(InterfaceRequest {
                ip: ip.to_string(),
                port,
                dev,
            }))
            .await;
    }

    /// Detach a previously attached device.
    pub async fn detach_device(&self, ip: &str, port: u16, dev: UsbDevice) {
        self.bus
            .enqueue(ClientEvent::DetachRequested(InterfaceRequest {
                ip: ip.to_string(),
                port,
                dev,
            }))
            .await;
    }

    pub fn subscribe_attach(&self, callback: AttachCallback) {
        self.interface.subscribe_attach(callback);
    }

    pub fn subscribe_detach(&self, callback: AttachCallback) {
        self.interface.subscribe_detach(callback);
    }

    pub fn subscribe_devicelist(&self, callback: DevicelistCallback) {
        self.interface.subscribe_devicelist(callback);
    }

    pub fn subscribe_discovery(&self, callback: DiscoveryCallback) {
        self.interface.subscribe_discovery(callback);
    }

    /// Terminate the runtime and stop every task, newest first.
    pub async fn shutdown(self) {
        let Self {
            bus,
            timer,
            beacon,
            manager,
            interface,
        } = self;

        bus.enqueue(ClientEvent::Terminate).await;
        bus.wait_terminated().await;

        interface.stop().await;
        manager.stop().await;
        beacon.stop().await;
        let _ = timer.await;
    }
}
