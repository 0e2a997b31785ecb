//! Subscription surface for embedding code
//!
//! Mirrors the server interface worker: events become callback invocations,
//! registration is last-writer-wins, and the registry mutex is never held
//! across a callback.

use crate::events::{
    ClientEvent, EVENT_ATTACH_FAILED, EVENT_ATTACHED, EVENT_DETACH_FAILED, EVENT_DETACHED,
    EVENT_DEVICELIST_FAILED, EVENT_DEVICELIST_READY, EVENT_SERVER_DISCOVERED,
};
use common::runtime::{EventBus, Mailbox};
use protocol::{AvailableServer, UsbDevice};
use std::sync::{Arc, Mutex};
use tracing::trace;

pub type AttachCallback = Arc<dyn Fn(bool, &str, u16, &UsbDevice) + Send + Sync>;
pub type DevicelistCallback = Arc<dyn Fn(bool, &str, u16, &[UsbDevice]) + Send + Sync>;
pub type DiscoveryCallback = Arc<dyn Fn(&AvailableServer) + Send + Sync>;

#[derive(Default)]
struct Subscriptions {
    attach: Option<AttachCallback>,
    detach: Option<AttachCallback>,
    devicelist: Option<DevicelistCallback>,
    discovery: Option<DiscoveryCallback>,
}

pub const INTERFACE_EVENT_MASK: u32 = EVENT_ATTACHED
    | EVENT_ATTACH_FAILED
    | EVENT_DETACHED
    | EVENT_DETACH_FAILED
    | EVENT_DEVICELIST_READY
    | EVENT_DEVICELIST_FAILED
    | EVENT_SERVER_DISCOVERED;

pub struct InterfaceTask {
    subs: Arc<Mutex<Subscriptions>>,
    handle: tokio::task::JoinHandle<()>,
}

impl InterfaceTask {
    pub async fn spawn(bus: &EventBus<ClientEvent>) -> Self {
        let mailbox: Mailbox<ClientEvent> =
            bus.register("Interface task", INTERFACE_EVENT_MASK).await;
        let subs = Arc::new(Mutex::new(Subscriptions::default()));
        let worker_subs = subs.clone();

        let handle = tokio::spawn(async move {
            trace!("Interface starting");
            while let Some(event) = mailbox.recv().await {
                dispatch(&worker_subs, event);
            }
            trace!("Interface quit");
        });

        Self { subs, handle }
    }

    pub fn subscribe_attach(&self, callback: AttachCallback) {
        self.subs.lock().unwrap().attach = Some(callback);
    }

    pub fn subscribe_detach(&self, callback: AttachCallback) {
        self.subs.lock().unwrap().detach = Some(callback);
    }

    pub fn subscribe_devicelist(&self, callback: DevicelistCallback) {
        self.subs.lock().unwrap().devicelist = Some(callback);
    }

    pub fn subscribe_discovery(&self, callback: DiscoveryCallback) {
        self.subs.lock().unwrap().discovery = Some(callback);
    }

    pub async fn stop(self) {
        {
            let mut subs = self.subs.lock().unwrap();
            *subs = Subscriptions::default();
        }
        trace!("Interface terminate");
        let _ = self.handle.await;
    }
}

fn dispatch(subs: &Arc<Mutex<Subscriptions>>, event: ClientEvent) {
    match event {
        ClientEvent::Attached(n) => {
            let cb = subs.lock().unwrap().attach.clone();
            if let Some(cb) = cb {
                cb(true, &n.server, n.port, &n.dev);
            }
        }
        ClientEvent::AttachFailed(n) => {
            let cb = subs.lock().unwrap().attach.clone();
            if let Some(cb) = cb {
                cb(false, &n.server, n.port, &n.dev);
            }
        }
        ClientEvent::Detached(n) => {
            let cb = subs.lock().unwrap().detach.clone();
            if let Some(cb) = cb {
                cb(true, &n.server, n.port, &n.dev);
            }
        }
        ClientEvent::DetachFailed(n) => {
            let cb = subs.lock().unwrap().detach.clone();
            if let Some(cb) = cb {
                cb(false, &n.server, n.port, &n.dev);
            }
        }
        ClientEvent::DevicelistReady {
            server,
            port,
            devices,
        } => {
            let cb = subs.lock().unwrap().devicelist.clone();
            if let Some(cb) = cb {
                cb(true, &server, port, &devices);
            }
        }
        ClientEvent::DevicelistFailed { server, port } => {
            let cb = subs.lock().unwrap().devicelist.clone();
            if let Some(cb) = cb {
                cb(false, &server, port, &[]);
            }
        }
        ClientEvent::ServerDiscovered(server) => {
            let cb = subs.lock().unwrap().discovery.clone();
            if let Some(cb) = cb {
                cb(&server);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DeviceNotice;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn wait_for(count: &Arc<AtomicUsize>) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while count.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("callback should fire");
    }

    #[tokio::test]
    async fn test_attach_failure_reported_as_unsuccessful() {
        let bus = Arc::new(EventBus::new());
        let interface = InterfaceTask::spawn(&bus).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        interface.subscribe_attach(Arc::new(move |success, server, port, dev| {
            assert!(!success);
            assert_eq!(server, "10.0.0.9");
            assert_eq!(port, 3240);
            assert_eq!(dev.busid, "1-1");
            count.fetch_add(1, Ordering::SeqCst);
        }));

        bus.enqueue(ClientEvent::AttachFailed(DeviceNotice {
            server: "10.0.0.9".into(),
            port: 3240,
            dev: UsbDevice {
                busid: "1-1".into(),
                ..Default::default()
            },
        }))
        .await;

        wait_for(&fired).await;
        bus.enqueue(ClientEvent::Terminate).await;
        interface.stop().await;
    }

    #[tokio::test]
    async fn test_discovery_callback() {
        let bus = Arc::new(EventBus::new());
        let interface = InterfaceTask::spawn(&bus).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        interface.subscribe_discovery(Arc::new(move |server| {
            assert_eq!(server.name, "bench");
            count.fetch_add(1, Ordering::SeqCst);
        }));

        bus.enqueue(ClientEvent::ServerDiscovered(AvailableServer {
            ip: "192.168.1.7".into(),
            id: 0,
            port: 3240,
            version: (0, 1),
            name: "bench".into(),
        }))
        .await;

        wait_for(&fired).await;
        bus.enqueue(ClientEvent::Terminate).await;
        interface.stop().await;
    }
}
