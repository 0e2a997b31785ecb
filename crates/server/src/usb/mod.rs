//! USB task: enumeration, export state and the USB/IP request handlers
//!
//! Runs on a dedicated thread because everything it does against libusb is
//! blocking. Once a second it reconciles the tracked device list with the
//! host's, emits attach/detach events and publishes a full snapshot; on
//! devlist/import requests it answers over the link handed to it by the
//! host task, transitioning accepted imports into forwarding sessions.

pub mod forward;
pub mod ring;
pub mod transfer;

use crate::events::ServerEvent;
use crate::usb::forward::ForwardHandle;
use crate::usb::transfer::EventPump;
use common::link::HANDSHAKE_TIMEOUT;
use common::runtime::{EventBus, Mailbox};
use common::{Link, take_link};
use protocol::op::encode_device_count;
use protocol::{
    BUSID_SIZE, MAX_INTERFACES, OP_REP_DEVLIST, OP_REP_IMPORT, OpCommon, Status, UsbDevice,
    UsbInterface, decode_import_request,
};
use rusb::{Context, Device, UsbContext};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

/// Everything the server knows about one enumerated device
#[derive(Debug, Clone, Default)]
pub struct UsbDeviceInfo {
    pub udev: UsbDevice,
    pub interfaces: Vec<UsbInterface>,
    pub manufacturer: String,
    pub product: String,
    /// Transfer type of each IN endpoint, from the last alternate setting
    /// that defined it
    pub ep_in_type: [u8; 16],
    /// Transfer type of each OUT endpoint
    pub ep_out_type: [u8; 16],
    pub exported: bool,
}

struct ServerUsbDevice {
    info: UsbDeviceInfo,
    device: Device<Context>,
    forward: Option<ForwardHandle>,
}

/// Tracked device list, mutated only by the USB task thread
pub struct DeviceRegistry {
    devices: Vec<ServerUsbDevice>,
    disabled_buses: Vec<u32>,
}

impl DeviceRegistry {
    pub fn new(disabled_buses: Vec<u32>) -> Self {
        Self {
            devices: Vec::new(),
            disabled_buses,
        }
    }

    fn bus_disabled(&self, busnum: u32) -> bool {
        self.disabled_buses.contains(&busnum)
    }

    /// Snapshot of the tracked list; `include_exported` distinguishes the
    /// local subscriber view from the wire devlist.
    pub fn snapshot(&self, include_exported: bool) -> Vec<UsbDeviceInfo> {
        self.devices
            .iter()
            .filter(|d| include_exported || !d.info.exported)
            .map(|d| d.info.clone())
            .collect()
    }

    /// Reconcile with the host device list: reap dead sessions, drop
    /// unplugged devices, pick up new ones.
    fn refresh(
        &mut self,
        context: &Context,
        bus: &Arc<EventBus<ServerEvent>>,
        rt: &tokio::runtime::Handle,
    ) -> anyhow::Result<()> {
        let list = context.devices()?;
        let host: Vec<Device<Context>> = list.iter().collect();

        // Removal pass, including reaping terminated forwarding sessions
        let mut i = 0;
        while i < self.devices.len() {
            let entry = &mut self.devices[i];

            if entry
                .forward
                .as_ref()
                .is_some_and(|f| f.terminated() || f.finished())
                && let Some(forward) = entry.forward.take()
            {
                forward.request_stop();
                forward.join(rt);
            }
            entry.info.exported = entry.forward.is_some();

            let busid = entry.info.udev.busid.clone();
            let still_present = host.iter().any(|d| {
                d.device_descriptor()
                    .is_ok_and(|desc| desc.class_code() != 0x09)
                    && busid_for(d).as_deref() == Some(busid.as_str())
            });

            if !still_present {
                debug!("Deleting {}", entry.info.udev.path);
                if let Some(forward) = entry.forward.take() {
                    forward.request_stop();
                    forward.join(rt);
                }
                let removed = self.devices.remove(i);
                bus.enqueue_blocking(ServerEvent::DeviceDetached(removed.info.udev));
                continue;
            }
            i += 1;
        }

        // Addition pass
        for device in host {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            // Hubs are not exportable
            if desc.class_code() == 0x09 {
                continue;
            }
            let Some(busid) = busid_for(&device) else {
                continue;
            };
            if self.devices.iter().any(|d| d.info.udev.busid == busid) {
                trace!("Device {} already exists", busid);
                continue;
            }
            if self.bus_disabled(device.bus_number() as u32) {
                continue;
            }

            match read_device_info(&device, busid) {
                Ok(info) => {
                    debug!("Inserting new device {}", info.product);
                    bus.enqueue_blocking(ServerEvent::DeviceAttached(info.udev.clone()));
                    self.devices.push(ServerUsbDevice {
                        info,
                        device,
                        forward: None,
                    });
                }
                Err(e) => debug!("Skipping device: {}", e),
            }
        }

        Ok(())
    }

    fn shutdown(&mut self, rt: &tokio::runtime::Handle) {
        for entry in &mut self.devices {
            if let Some(forward) = entry.forward.take() {
                forward.request_stop();
                forward.join(rt);
            }
        }
        self.devices.clear();
    }
}

/// Bus-and-port-path identifier, e.g. "1-1.4". `None` for devices without
/// a port path (root hubs).
fn busid_for(device: &Device<Context>) -> Option<String> {
    let ports = device.port_numbers().ok()?;
    if ports.is_empty() {
        return None;
    }
    let path: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
    Some(format!("{}-{}", device.bus_number(), path.join(".")))
}

fn kernel_speed(speed: rusb::Speed) -> u32 {
    // Kernel speed codes skip the wireless slot
    match speed {
        rusb::Speed::Low => 1,
        rusb::Speed::Full => 2,
        rusb::Speed::High => 3,
        rusb::Speed::Super => 5,
        rusb::Speed::SuperPlus => 6,
        _ => 0,
    }
}

fn read_device_info(device: &Device<Context>, busid: String) -> anyhow::Result<UsbDeviceInfo> {
    let desc = device.device_descriptor()?;
    let version = desc.device_version();

    let mut info = UsbDeviceInfo {
        udev: UsbDevice {
            busid,
            busnum: device.bus_number() as u32,
            devnum: device.port_number() as u32,
            speed: kernel_speed(device.speed()),
            id_vendor: desc.vendor_id(),
            id_product: desc.product_id(),
            bcd_device: ((version.major() as u16) << 8)
                | ((version.minor() as u16) << 4)
                | (version.sub_minor() as u16 & 0x0f),
            b_device_class: desc.class_code(),
            b_device_subclass: desc.sub_class_code(),
            b_device_protocol: desc.protocol_code(),
            b_configuration_value: 0,
            b_num_configurations: desc.num_configurations(),
            ..Default::default()
        },
        ..Default::default()
    };

    debug!(
        "Initializing device {:#06x}:{:#06x}",
        info.udev.id_vendor, info.udev.id_product
    );

    // Only the first configuration is supported
    let cfg = device.config_descriptor(0)?;
    info.udev.b_num_interfaces = cfg.num_interfaces();
    if cfg.num_interfaces() as usize > MAX_INTERFACES {
        anyhow::bail!("Too many interfaces");
    }

    for intf in cfg.interfaces() {
        if let Some(first_alt) = intf.descriptors().next() {
            info.interfaces.push(UsbInterface {
                b_interface_class: first_alt.class_code(),
                b_interface_subclass: first_alt.sub_class_code(),
                b_interface_protocol: first_alt.protocol_code(),
                padding: 0,
            });
        }
        // Walk every alternate setting; a later alternate overrides the
        // type recorded for the same endpoint
        for alt in intf.descriptors() {
            for ep in alt.endpoint_descriptors() {
                let epnum = (ep.address() & 0x0f) as usize;
                let xfer_type = ep.transfer_type() as u8;
                match ep.direction() {
                    rusb::Direction::In => info.ep_in_type[epnum] = xfer_type,
                    rusb::Direction::Out => info.ep_out_type[epnum] = xfer_type,
                }
            }
        }
    }

    // Short open for the display strings
    let handle = device.open()?;
    info.manufacturer = handle
        .read_manufacturer_string_ascii(&desc)
        .unwrap_or_default();
    info.product = handle.read_product_string_ascii(&desc).unwrap_or_default();
    drop(handle);

    info.udev.path = format!("{} - {}", info.manufacturer, info.product);

    Ok(info)
}

/// Serialise the OP_REP_DEVLIST byte stream for a device snapshot.
pub fn devlist_reply_bytes(list: &[UsbDeviceInfo]) -> Vec<u8> {
    let mut buf = Vec::new();
    let hdr = OpCommon::reply(OP_REP_DEVLIST, Status::Ok);
    buf.extend_from_slice(&hdr.encode());
    buf.extend_from_slice(&encode_device_count(list.len() as u32));
    for info in list {
        let _ = info.udev.write_to(&mut buf);
        for intf in &info.interfaces {
            let _ = intf.write_to(&mut buf);
        }
    }
    buf
}

/// Import policy: first match in enumeration order, `NoDev` for an unknown
/// busid, `DevBusy` when the bus is disabled or the device is already
/// exported.
pub fn import_status(
    devices: &[UsbDeviceInfo],
    disabled_buses: &[u32],
    busid: &str,
) -> Result<usize, Status> {
    let idx = devices
        .iter()
        .position(|d| d.udev.busid == busid)
        .ok_or(Status::NoDev)?;

    if disabled_buses.contains(&devices[idx].udev.busnum) {
        return Err(Status::DevBusy);
    }
    if devices[idx].exported {
        return Err(Status::DevBusy);
    }
    Ok(idx)
}

/// Answer OP_REQ_DEVLIST: non-exported devices with their interfaces.
fn handle_devlist(registry: &DeviceRegistry, link: &mut Link, rt: &tokio::runtime::Handle) {
    let list = registry.snapshot(false);
    debug!("{} devices available", list.len());

    let buf = devlist_reply_bytes(&list);
    let sent = rt.block_on(async { timeout(HANDSHAKE_TIMEOUT, link.send_all(&buf)).await });
    if !matches!(sent, Ok(Ok(()))) {
        error!("Failed to send devlist reply");
    }
}

fn send_status(link: &mut Link, status: Status, rt: &tokio::runtime::Handle) {
    let buf = OpCommon::reply(OP_REP_IMPORT, status).encode();
    let sent = rt.block_on(async { timeout(HANDSHAKE_TIMEOUT, link.send_all(&buf)).await });
    if !matches!(sent, Ok(Ok(()))) {
        error!("Failed to send USBIP header");
    }
}

/// Answer OP_REQ_IMPORT and, on success, move the link into forwarding
/// mode. The link is dropped (closed) on every failure path.
fn handle_import(
    registry: &mut DeviceRegistry,
    mut link: Link,
    bus: &Arc<EventBus<ServerEvent>>,
    rt: &tokio::runtime::Handle,
) {
    let mut busid_buf = [0u8; BUSID_SIZE];
    let received =
        rt.block_on(async { timeout(HANDSHAKE_TIMEOUT, link.recv_all(&mut busid_buf)).await });
    if !matches!(received, Ok(Ok(()))) {
        error!("Failed to receive import request");
        return;
    }
    let busid = match decode_import_request(&busid_buf) {
        Ok(busid) => busid,
        Err(e) => {
            error!("Bad import request: {}", e);
            return;
        }
    };

    let snapshot = registry.snapshot(true);
    let idx = match import_status(&snapshot, &registry.disabled_buses, &busid) {
        Ok(idx) => idx,
        Err(status) => {
            error!("Import of {} refused ({:?})", busid, status);
            send_status(&mut link, status, rt);
            return;
        }
    };

    let entry = &mut registry.devices[idx];
    debug!("Device {} found", entry.info.product);

    let mut buf = Vec::new();
    buf.extend_from_slice(&OpCommon::reply(OP_REP_IMPORT, Status::Ok).encode());
    if entry.info.udev.write_to(&mut buf).is_err() {
        return;
    }
    let sent = rt.block_on(async { timeout(HANDSHAKE_TIMEOUT, link.send_all(&buf)).await });
    if !matches!(sent, Ok(Ok(()))) {
        error!("Failed to send import reply");
        return;
    }

    match forward::start(&entry.info, &entry.device, link, bus.clone(), rt) {
        Ok(handle) => {
            entry.forward = Some(handle);
            entry.info.exported = true;
            trace!("Device [{}] forwarding", entry.info.manufacturer);
        }
        Err(e) => {
            error!("Device [{}] fwd failed: {}", entry.info.manufacturer, e);
        }
    }
}

/// The USB task thread plus the libusb event pump it relies on
pub struct UsbTask {
    thread: Option<std::thread::JoinHandle<()>>,
    pump: Option<EventPump>,
}

impl UsbTask {
    pub fn spawn(
        bus: Arc<EventBus<ServerEvent>>,
        mailbox: Mailbox<ServerEvent>,
        disabled_buses: Vec<u32>,
        rt: tokio::runtime::Handle,
    ) -> anyhow::Result<Self> {
        let context = Context::new()?;
        let pump = EventPump::spawn(context.clone())?;

        let thread = std::thread::Builder::new()
            .name("usb-task".to_string())
            .spawn(move || {
                trace!("USB task starting");
                let mut registry = DeviceRegistry::new(disabled_buses);

                while let Some(event) = mailbox.recv_blocking() {
                    match event {
                        ServerEvent::Timer1s => {
                            trace!("Updating local USB devices");
                            if let Err(e) = registry.refresh(&context, &bus, &rt) {
                                warn!("Device enumeration failed: {}", e);
                            }
                            bus.enqueue_blocking(ServerEvent::LocalDevicelist(
                                registry.snapshot(true),
                            ));
                        }
                        ServerEvent::DevlistRequest(shared) => {
                            if let Some(mut link) = take_link(&shared) {
                                handle_devlist(&registry, &mut link, &rt);
                            }
                        }
                        ServerEvent::ImportRequest(shared) => {
                            if let Some(link) = take_link(&shared) {
                                handle_import(&mut registry, link, &bus, &rt);
                            }
                        }
                        _ => {}
                    }
                }

                trace!("USB task stopping");
                registry.shutdown(&rt);
                trace!("USB task exit");
            })?;

        Ok(Self {
            thread: Some(thread),
            pump: Some(pump),
        })
    }

    /// Join the task thread (unblocked by bus termination) and stop the
    /// event pump.
    pub fn stop(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if let Some(pump) = self.pump.take() {
            pump.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(busid: &str, exported: bool) -> UsbDeviceInfo {
        UsbDeviceInfo {
            udev: UsbDevice {
                busid: busid.to_string(),
                busnum: 1,
                ..Default::default()
            },
            exported,
            ..Default::default()
        }
    }

    #[test]
    fn test_bus_disabled() {
        let registry = DeviceRegistry::new(vec![2]);
        assert!(registry.bus_disabled(2));
        assert!(!registry.bus_disabled(1));
    }

    #[test]
    fn test_import_status_policy() {
        let mut busy = info("1-2", true);
        busy.udev.busnum = 1;
        let mut disabled = info("2-1", false);
        disabled.udev.busnum = 2;
        let devices = [info("1-1", false), busy, disabled];

        assert_eq!(import_status(&devices, &[2], "1-1"), Ok(0));
        assert_eq!(import_status(&devices, &[2], "1-2"), Err(Status::DevBusy));
        assert_eq!(import_status(&devices, &[2], "2-1"), Err(Status::DevBusy));
        assert_eq!(import_status(&devices, &[2], "9-9"), Err(Status::NoDev));
    }

    #[test]
    fn test_devlist_reply_bytes_shape() {
        let mut with_intf = info("1-1", false);
        with_intf.udev.b_num_interfaces = 2;
        with_intf.interfaces = vec![UsbInterface::default(); 2];

        let buf = devlist_reply_bytes(&[with_intf]);
        assert_eq!(
            buf.len(),
            OpCommon::SIZE + 4 + UsbDevice::SIZE + 2 * UsbInterface::SIZE
        );

        let hdr = OpCommon::decode(&buf).unwrap();
        assert_eq!(hdr.code, OP_REP_DEVLIST);
        assert_eq!(hdr.status, Status::Ok as u32);
    }

    #[test]
    fn test_kernel_speed_skips_wireless() {
        assert_eq!(kernel_speed(rusb::Speed::Low), 1);
        assert_eq!(kernel_speed(rusb::Speed::High), 3);
        assert_eq!(kernel_speed(rusb::Speed::Super), 5);
        assert_eq!(kernel_speed(rusb::Speed::SuperPlus), 6);
        assert_eq!(kernel_speed(rusb::Speed::Unknown), 0);
    }
}
