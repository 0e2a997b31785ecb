//! Manager task: attach/detach state machine
//!
//! Owns the set of attached devices, keyed by `(server_ip, server_port,
//! busid)`. Attaching imports the device over a fresh link, takes a free
//! VHCI port of the matching USB generation and bridges the link to the
//! socketpair handed to the kernel. Every five seconds devices whose
//! bridge died are reaped and reported as detached.

use crate::bridge::{self, BridgeHandle};
use crate::command::{ClientConn, exec_devlist, exec_import};
use crate::events::{
    ClientEvent, DeviceNotice, EVENT_ATTACH_REQUESTED, EVENT_DETACH_REQUESTED,
    EVENT_DEVICELIST_REQUEST, EVENT_TIMER_5S, InterfaceRequest,
};
use crate::vhci;
use common::runtime::{EventBus, Mailbox};
use common::{Error, TlsClientSetup};
use protocol::{Speed, UsbDevice};
use std::net::IpAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use tracing::{debug, error, trace};

pub const MANAGER_EVENT_MASK: u32 =
    EVENT_TIMER_5S | EVENT_DEVICELIST_REQUEST | EVENT_ATTACH_REQUESTED | EVENT_DETACH_REQUESTED;

struct ClientUsbDevice {
    udev: UsbDevice,
    server_ip: String,
    server_port: u16,
    vhci_port: u32,
    bridge: BridgeHandle,
}

struct ManagerState {
    bus: Arc<EventBus<ClientEvent>>,
    devices: Vec<ClientUsbDevice>,
    tls: Option<TlsClientSetup>,
}

pub struct ManagerTask {
    handle: tokio::task::JoinHandle<()>,
}

impl ManagerTask {
    /// Validate the VHCI and TLS prerequisites, then start the worker.
    pub fn spawn(
        bus: Arc<EventBus<ClientEvent>>,
        mailbox: Mailbox<ClientEvent>,
        use_tls: bool,
        ca_path: &str,
    ) -> Result<Self, Error> {
        if !vhci::is_available() {
            error!("Need to load the VHCI driver");
            return Err(Error::VhciDriver);
        }

        let tls = if use_tls {
            if !ca_path.is_empty() && !std::path::Path::new(ca_path).exists() {
                error!("Given CA cert file does not exist");
                return Err(Error::CaPathNotDefined);
            }
            match TlsClientSetup::new(ca_path) {
                Ok(setup) => Some(setup),
                Err(e) => {
                    error!("TLS setup failed: {}", e);
                    return Err(Error::CaPathNotDefined);
                }
            }
        } else {
            None
        };

        let mut state = ManagerState {
            bus,
            devices: Vec::new(),
            tls,
        };

        let handle = tokio::spawn(async move {
            trace!("Manager starting");
            while let Some(event) = mailbox.recv().await {
                state.handle_event(event).await;
            }

            trace!("Terminate connections");
            while let Some(device) = state.devices.pop() {
                teardown_device(device).await;
            }
            trace!("Manager exit");
        });

        Ok(Self { handle })
    }

    pub async fn stop(self) {
        let _ = self.handle.await;
    }
}

/// Shut the bridge down, wait it out and free the VHCI port.
async fn teardown_device(device: ClientUsbDevice) {
    debug!("Stopping forwarding [{}]", device.udev.path);
    device.bridge.request_stop();
    device.bridge.join().await;
    if let Err(e) = vhci::detach(device.vhci_port) {
        debug!("VHCI detach note: {}", e);
    }
}

impl ManagerState {
    async fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Timer5s => self.reap_terminated().await,
            ClientEvent::DevicelistRequest(req) => self.get_server_devicelist(req).await,
            ClientEvent::AttachRequested(req) => {
                self.attach_remote_device(req).await;
            }
            ClientEvent::DetachRequested(req) => {
                self.detach_remote_device(req).await;
            }
            _ => {}
        }
    }

    fn conn(&self, ip: IpAddr, port: u16) -> ClientConn {
        ClientConn {
            ip,
            port,
            tls: self.tls.clone(),
        }
    }

    fn find_device(&self, busid: &str, ip: &str, port: u16) -> Option<usize> {
        self.devices.iter().position(|d| {
            d.udev.busid == busid && d.server_ip == ip && d.server_port == port
        })
    }

    /// Devices whose forwarder died since the last pass are detached.
    async fn reap_terminated(&mut self) {
        trace!("Updating port usage");
        let mut i = 0;
        while i < self.devices.len() {
            if self.devices[i].bridge.fwd_terminated() {
                let device = self.devices.remove(i);
                let notice = DeviceNotice {
                    server: device.server_ip.clone(),
                    port: device.server_port,
                    dev: device.udev.clone(),
                };
                teardown_device(device).await;
                self.bus.enqueue(ClientEvent::Detached(notice)).await;
                continue;
            }
            i += 1;
        }
    }

    async fn get_server_devicelist(&mut self, req: InterfaceRequest) {
        let ip: IpAddr = match req.ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                error!("Failed to read given IP address");
                self.bus
                    .enqueue(ClientEvent::DevicelistFailed {
                        server: req.ip,
                        port: req.port,
                    })
                    .await;
                return;
            }
        };

        debug!("Sending devlist query to [{}]", req.ip);
        match exec_devlist(&self.conn(ip, req.port)).await {
            Ok(devices) => {
                self.bus
                    .enqueue(ClientEvent::DevicelistReady {
                        server: req.ip,
                        port: req.port,
                        devices,
                    })
                    .await;
            }
            Err(e) => {
                error!("Devicelisting failed: {}", e);
                self.bus
                    .enqueue(ClientEvent::DevicelistFailed {
                        server: req.ip,
                        port: req.port,
                    })
                    .await;
            }
        }
    }

    async fn inform_attach_failed(&self, req: &InterfaceRequest) {
        self.bus
            .enqueue(ClientEvent::AttachFailed(DeviceNotice {
                server: req.ip.clone(),
                port: req.port,
                dev: req.dev.clone(),
            }))
            .await;
    }

    async fn attach_remote_device(&mut self, req: InterfaceRequest) -> bool {
        debug!("Attaching {} [{}]", req.dev.busid, req.dev.path);

        let ip: IpAddr = match req.ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                debug!("Failed to read ip");
                self.inform_attach_failed(&req).await;
                return false;
            }
        };

        if self.find_device(&req.dev.busid, &req.ip, req.port).is_some() {
            debug!("Device already attached");
            self.inform_attach_failed(&req).await;
            return false;
        }

        let (dev_at_busid, link) =
            match exec_import(&self.conn(ip, req.port), &req.dev.busid).await {
                Ok(imported) => imported,
                Err(e) => {
                    error!("Import command execution failed: {}", e);
                    self.inform_attach_failed(&req).await;
                    return false;
                }
            };

        // The server's list went stale since discovery; the embedder
        // should fetch a fresh one
        if req.dev.id_product != dev_at_busid.id_product
            || req.dev.id_vendor != dev_at_busid.id_vendor
        {
            error!("Devicelist needed again");
            self.inform_attach_failed(&req).await;
            return false;
        }

        let ports = match vhci::read_ports() {
            Ok(ports) => ports,
            Err(e) => {
                error!("Failed to parse VHCI: {}", e);
                self.inform_attach_failed(&req).await;
                return false;
            }
        };
        let Some(port) = vhci::free_port(&ports, Speed::is_usb3(req.dev.speed)) else {
            error!("Failed to get free VHCI port");
            self.inform_attach_failed(&req).await;
            return false;
        };
        debug!("Got VHCI port {}", port);

        let (bridge, kernel_fd) = match bridge::start(link, &dev_at_busid.path) {
            Ok(started) => started,
            Err(e) => {
                error!("Failed to create forwarding sockets: {}", e);
                self.inform_attach_failed(&req).await;
                return false;
            }
        };

        if let Err(e) = vhci::attach(
            port,
            kernel_fd.as_raw_fd(),
            dev_at_busid.devid(),
            dev_at_busid.speed,
        ) {
            error!("Failed to write attach: {}", e);
            self.inform_attach_failed(&req).await;
            bridge.request_stop();
            bridge.join().await;
            return false;
        }
        // The kernel dup'ed the descriptor during the attach write
        drop(kernel_fd);

        self.devices.push(ClientUsbDevice {
            udev: dev_at_busid,
            server_ip: req.ip.clone(),
            server_port: req.port,
            vhci_port: port,
            bridge,
        });

        self.bus
            .enqueue(ClientEvent::Attached(DeviceNotice {
                server: req.ip,
                port: req.port,
                dev: req.dev,
            }))
            .await;
        true
    }

    async fn detach_remote_device(&mut self, req: InterfaceRequest) -> bool {
        debug!("Detaching {}", req.dev.busid);

        let notice = DeviceNotice {
            server: req.ip.clone(),
            port: req.port,
            dev: req.dev.clone(),
        };

        match self.find_device(&req.dev.busid, &req.ip, req.port) {
            Some(idx) => {
                let device = self.devices.remove(idx);
                teardown_device(device).await;
                self.bus.enqueue(ClientEvent::Detached(notice)).await;
                true
            }
            None => {
                self.bus.enqueue(ClientEvent::DetachFailed(notice)).await;
                false
            }
        }
    }
}
