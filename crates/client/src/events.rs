//! Client-side event types and subscription masks

use common::runtime::BusEvent;
use protocol::{AvailableServer, UsbDevice};

pub const EVENT_TIMER_1S: u32 = 0x0001;
pub const EVENT_TIMER_5S: u32 = 0x0002;
pub const EVENT_SERVER_DISCOVERED: u32 = 0x0004;
pub const EVENT_ATTACH_REQUESTED: u32 = 0x0008;
pub const EVENT_ATTACHED: u32 = 0x0010;
pub const EVENT_ATTACH_FAILED: u32 = 0x0020;
pub const EVENT_DETACH_REQUESTED: u32 = 0x0040;
pub const EVENT_DETACHED: u32 = 0x0080;
pub const EVENT_DETACH_FAILED: u32 = 0x0100;
pub const EVENT_DEVICELIST_REQUEST: u32 = 0x0200;
pub const EVENT_DEVICELIST_READY: u32 = 0x0400;
pub const EVENT_DEVICELIST_FAILED: u32 = 0x0800;

/// A request handed to the manager by embedding code
#[derive(Debug, Clone)]
pub struct InterfaceRequest {
    pub ip: String,
    pub port: u16,
    pub dev: UsbDevice,
}

/// Outcome notice carrying the server address and the device concerned
#[derive(Debug, Clone)]
pub struct DeviceNotice {
    pub server: String,
    pub port: u16,
    pub dev: UsbDevice,
}

/// Events flowing between the client tasks
#[derive(Clone)]
pub enum ClientEvent {
    Terminate,
    Timer1s,
    Timer5s,
    ServerDiscovered(AvailableServer),
    AttachRequested(InterfaceRequest),
    Attached(DeviceNotice),
    AttachFailed(DeviceNotice),
    DetachRequested(InterfaceRequest),
    Detached(DeviceNotice),
    DetachFailed(DeviceNotice),
    DevicelistRequest(InterfaceRequest),
    DevicelistReady {
        server: String,
        port: u16,
        devices: Vec<UsbDevice>,
    },
    DevicelistFailed {
        server: String,
        port: u16,
    },
}

impl BusEvent for ClientEvent {
    fn mask_bit(&self) -> u32 {
        match self {
            ClientEvent::Terminate => 0,
            ClientEvent::Timer1s => EVENT_TIMER_1S,
            ClientEvent::Timer5s => EVENT_TIMER_5S,
            ClientEvent::ServerDiscovered(_) => EVENT_SERVER_DISCOVERED,
            ClientEvent::AttachRequested(_) => EVENT_ATTACH_REQUESTED,
            ClientEvent::Attached(_) => EVENT_ATTACHED,
            ClientEvent::AttachFailed(_) => EVENT_ATTACH_FAILED,
            ClientEvent::DetachRequested(_) => EVENT_DETACH_REQUESTED,
            ClientEvent::Detached(_) => EVENT_DETACHED,
            ClientEvent::DetachFailed(_) => EVENT_DETACH_FAILED,
            ClientEvent::DevicelistRequest(_) => EVENT_DEVICELIST_REQUEST,
            ClientEvent::DevicelistReady { .. } => EVENT_DEVICELIST_READY,
            ClientEvent::DevicelistFailed { .. } => EVENT_DEVICELIST_FAILED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_are_one_hot() {
        let bits = [
            EVENT_TIMER_1S,
            EVENT_TIMER_5S,
            EVENT_SERVER_DISCOVERED,
            EVENT_ATTACH_REQUESTED,
            EVENT_ATTACHED,
            EVENT_ATTACH_FAILED,
            EVENT_DETACH_REQUESTED,
            EVENT_DETACHED,
            EVENT_DETACH_FAILED,
            EVENT_DEVICELIST_REQUEST,
            EVENT_DEVICELIST_READY,
            EVENT_DEVICELIST_FAILED,
        ];
        for (i, a) in bits.iter().enumerate() {
            assert_eq!(a.count_ones(), 1);
            for b in &bits[i + 1..] {
                assert_eq!(a & b, 0);
            }
        }
    }
}
