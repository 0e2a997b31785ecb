//! RemoteHub server
//!
//! Enumerates the host's USB devices, advertises itself on the local
//! network, answers USB/IP devlist and import requests and forwards USB
//! transfers for imported devices. [`Server::start`] brings the task set up
//! in dependency order; failures unwind the already-started tasks in
//! reverse and return the specific error kind.

pub mod beacon;
pub mod config;
pub mod events;
pub mod host;
pub mod interface;
pub mod usb;

use crate::beacon::BeaconTask;
use crate::events::{
    EVENT_REQ_DEVICELIST, EVENT_REQ_IMPORT, EVENT_TIMER_1S, ServerEvent,
};
use crate::host::HostTask;
use crate::interface::InterfaceTask;
use crate::usb::UsbTask;
use common::runtime::EventBus;
use common::{Error, spawn_timer};
use std::sync::Arc;
use tracing::error;

pub use crate::config::ServerConfig;
pub use crate::interface::{DeviceState, DeviceStateCallback, DevicelistCallback};
pub use crate::usb::UsbDeviceInfo;

pub struct Server {
    bus: Arc<EventBus<ServerEvent>>,
    timer: tokio::task::JoinHandle<()>,
    beacon: BeaconTask,
    usb: UsbTask,
    host: HostTask,
    interface: InterfaceTask,
}

impl Server {
    /// Start every server task. Requires root (USB and low-port access).
    pub async fn start(config: ServerConfig) -> common::Result<Self> {
        if !nix::unistd::geteuid().is_root() {
            error!("Sudo needed to access USB peripherals");
            return Err(Error::Permission);
        }
        config.validate()?;

        let bus = Arc::new(EventBus::new());
        let timer = spawn_timer(bus.clone(), ServerEvent::Timer1s, ServerEvent::Timer5s);

        let beacon = match BeaconTask::spawn(bus.clone(), &config).await {
            Ok(beacon) => beacon,
            Err(e) => {
                error!("Beacon task init failed: {}", e);
                abort_startup(&bus, timer, None, None, None).await;
                return Err(Error::InitBeacon);
            }
        };

        let usb_mailbox = bus
            .register(
                "USB task",
                EVENT_TIMER_1S | EVENT_REQ_DEVICELIST | EVENT_REQ_IMPORT,
            )
            .await;
        let usb = match UsbTask::spawn(
            bus.clone(),
            usb_mailbox,
            config.disabled_buses(),
            tokio::runtime::Handle::current(),
        ) {
            Ok(usb) => usb,
            Err(e) => {
                error!("USB task init failed: {}", e);
                abort_startup(&bus, timer, Some(beacon), None, None).await;
                return Err(Error::InitUsb(e));
            }
        };

        let host = match HostTask::spawn(bus.clone(), &config).await {
            Ok(host) => host,
            Err(e) => {
                error!("Host task init failed: {}", e);
                abort_startup(&bus, timer, Some(beacon), Some(usb), None).await;
                return Err(Error::InitHost(e));
            }
        };

        let interface = InterfaceTask::spawn(&bus).await;

        Ok(Self {
            bus,
            timer,
            beacon,
            usb,
            host,
            interface,
        })
    }

    pub fn subscribe_devicelist(&self, callback: DevicelistCallback) {
        self.interface.subscribe_devicelist(callback);
    }

    pub fn unsubscribe_devicelist(&self) {
        self.interface.unsubscribe_devicelist();
    }

    pub fn subscribe_attached(&self, callback: DeviceStateCallback) {
        self.interface.subscribe_attached(callback);
    }

    pub fn unsubscribe_attached(&self) {
        self.interface.unsubscribe_attached();
    }

    pub fn subscribe_detached(&self, callback: DeviceStateCallback) {
        self.interface.subscribe_detached(callback);
    }

    pub fn unsubscribe_detached(&self) {
        self.interface.unsubscribe_detached();
    }

    pub fn subscribe_exported(&self, callback: DeviceStateCallback) {
        self.interface.subscribe_exported(callback);
    }

    pub fn unsubscribe_exported(&self) {
        self.interface.unsubscribe_exported();
    }

    pub fn subscribe_unexported(&self, callback: DeviceStateCallback) {
        self.interface.subscribe_unexported(callback);
    }

    pub fn unsubscribe_unexported(&self) {
        self.interface.unsubscribe_unexported();
    }

    /// Terminate the runtime and stop every task, newest first.
    pub async fn shutdown(self) {
        let Self {
            bus,
            timer,
            beacon,
            usb,
            host,
            interface,
        } = self;

        bus.enqueue(ServerEvent::Terminate).await;
        bus.wait_terminated().await;

        interface.stop().await;
        host.stop().await;
        let _ = tokio::task::spawn_blocking(move || usb.stop()).await;
        beacon.stop().await;
        let _ = timer.await;
    }
}

async fn abort_startup(
    bus: &Arc<EventBus<ServerEvent>>,
    timer: tokio::task::JoinHandle<()>,
    beacon: Option<BeaconTask>,
    usb: Option<UsbTask>,
    host: Option<HostTask>,
) {
    bus.enqueue(ServerEvent::Terminate).await;
    if let Some(host) = host {
        host.stop().await;
    }
    if let Some(usb) = usb {
        let _ = tokio::task::spawn_blocking(move || usb.stop()).await;
    }
    if let Some(beacon) = beacon {
        beacon.stop().await;
    }
    let _ = timer.await;
}
