//! Subscription surface for embedding code
//!
//! A dedicated worker delivers device-list snapshots and device state
//! changes to registered callbacks. Registration is last-writer-wins; the
//! registry mutex is released before any callback runs so a callback may
//! re-enter the library without deadlocking.

use crate::events::{
    EVENT_DEVICE_ATTACHED, EVENT_DEVICE_DETACHED, EVENT_DEVICE_EXPORTED, EVENT_DEVICE_UNEXPORTED,
    EVENT_LOCAL_DEVICELIST, ServerEvent,
};
use crate::usb::UsbDeviceInfo;
use common::runtime::EventBus;
use protocol::UsbDevice;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Device lifecycle states reported to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Attached,
    Detached,
    Exported,
    Unexported,
}

pub type DevicelistCallback = Arc<dyn Fn(&[UsbDeviceInfo]) + Send + Sync>;
pub type DeviceStateCallback = Arc<dyn Fn(DeviceState, &UsbDevice) + Send + Sync>;

#[derive(Default)]
struct Subscriptions {
    devicelist: Option<DevicelistCallback>,
    attached: Option<DeviceStateCallback>,
    detached: Option<DeviceStateCallback>,
    exported: Option<DeviceStateCallback>,
    unexported: Option<DeviceStateCallback>,
}

pub const INTERFACE_EVENT_MASK: u32 = EVENT_LOCAL_DEVICELIST
    | EVENT_DEVICE_EXPORTED
    | EVENT_DEVICE_UNEXPORTED
    | EVENT_DEVICE_ATTACHED
    | EVENT_DEVICE_DETACHED;

pub struct InterfaceTask {
    subs: Arc<Mutex<Subscriptions>>,
    handle: tokio::task::JoinHandle<()>,
}

impl InterfaceTask {
    pub async fn spawn(bus: &EventBus<ServerEvent>) -> Self {
        let mailbox = bus.register("Server interface task", INTERFACE_EVENT_MASK).await;
        let subs = Arc::new(Mutex::new(Subscriptions::default()));
        let worker_subs = subs.clone();

        let handle = tokio::spawn(async move {
            trace!("Server interface starting");
            while let Some(event) = mailbox.recv().await {
                dispatch(&worker_subs, event);
            }
            trace!("Server interface quit");
        });

        Self { subs, handle }
    }

    pub fn subscribe_devicelist(&self, callback: DevicelistCallback) {
        self.subs.lock().unwrap().devicelist = Some(callback);
    }

    pub fn unsubscribe_devicelist(&self) {
        self.subs.lock().unwrap().devicelist = None;
    }

    pub fn subscribe_attached(&self, callback: DeviceStateCallback) {
        self.subs.lock().unwrap().attached = Some(callback);
    }

    pub fn unsubscribe_attached(&self) {
        self.subs.lock().unwrap().attached = None;
    }

    pub fn subscribe_detached(&self, callback: DeviceStateCallback) {
        self.subs.lock().unwrap().detached = Some(callback);
    }

    pub fn unsubscribe_detached(&self) {
        self.subs.lock().unwrap().detached = None;
    }

    pub fn subscribe_exported(&self, callback: DeviceStateCallback) {
        self.subs.lock().unwrap().exported = Some(callback);
    }

    pub fn unsubscribe_exported(&self) {
        self.subs.lock().unwrap().exported = None;
    }

    pub fn subscribe_unexported(&self, callback: DeviceStateCallback) {
        self.subs.lock().unwrap().unexported = Some(callback);
    }

    pub fn unsubscribe_unexported(&self) {
        self.subs.lock().unwrap().unexported = None;
    }

    pub async fn stop(self) {
        {
            let mut subs = self.subs.lock().unwrap();
            *subs = Subscriptions::default();
        }
        trace!("Server interface terminate");
        let _ = self.handle.await;
        trace!("Server interface terminated");
    }
}

fn dispatch(subs: &Arc<Mutex<Subscriptions>>, event: ServerEvent) {
    // Clone the callback out, then invoke with the registry unlocked
    match event {
        ServerEvent::LocalDevicelist(list) => {
            let cb = subs.lock().unwrap().devicelist.clone();
            if let Some(cb) = cb {
                cb(&list);
            }
        }
        ServerEvent::DeviceAttached(dev) => {
            let cb = subs.lock().unwrap().attached.clone();
            if let Some(cb) = cb {
                cb(DeviceState::Attached, &dev);
            }
        }
        ServerEvent::DeviceDetached(dev) => {
            let cb = subs.lock().unwrap().detached.clone();
            if let Some(cb) = cb {
                cb(DeviceState::Detached, &dev);
            }
        }
        ServerEvent::DeviceExported(dev) => {
            let cb = subs.lock().unwrap().exported.clone();
            if let Some(cb) = cb {
                cb(DeviceState::Exported, &dev);
            }
        }
        ServerEvent::DeviceUnexported(dev) => {
            let cb = subs.lock().unwrap().unexported.clone();
            if let Some(cb) = cb {
                cb(DeviceState::Unexported, &dev);
            }
        }
        _ => {}
    }
}
