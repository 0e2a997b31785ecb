//! Asynchronous libusb transfers
//!
//! rusb only wraps the synchronous transfer API, so submission, cancellation
//! and the completion callback go through `rusb::ffi` here. This module is
//! the only place in the crate that touches raw libusb memory.
//!
//! Ownership rules:
//! - an [`AsyncTransfer`] lives inside its ring entry from submission until
//!   the entry is freed; the entry is only freed after the completion
//!   callback has run (TX dequeues ready packets, the monitor drains by
//!   cancelling and waiting for completion),
//! - the callback identifies its session through a `Weak` reference and its
//!   packet by seqnum, and mutates ring state under the ring lock only.

use crate::usb::ring::SessionShared;
use protocol::IsoPacketDescriptor;
use rusb::UsbContext;
use rusb::ffi;
use std::os::raw::{c_int, c_uchar, c_void};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

// libusb transfer types (bmAttributes transfer-type bits)
pub const XFER_TYPE_CONTROL: u8 = 0;
pub const XFER_TYPE_ISOC: u8 = 1;
pub const XFER_TYPE_BULK: u8 = 2;
pub const XFER_TYPE_INTERRUPT: u8 = 3;

// POSIX errno values the peer kernel expects in RET_SUBMIT.status
pub const EIO: i32 = 5;
pub const EPIPE: i32 = 32;
pub const EOVERFLOW: i32 = 75;
pub const ECONNRESET: i32 = 104;
pub const ESHUTDOWN: i32 = 108;
pub const ETIMEDOUT: i32 = 110;
const ENOENT: i32 = 2;

/// Completion status of a libusb transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
    Unknown(i32),
}

impl TransferStatus {
    fn from_raw(raw: c_int) -> Self {
        match raw {
            0 => TransferStatus::Completed,
            1 => TransferStatus::Error,
            2 => TransferStatus::TimedOut,
            3 => TransferStatus::Cancelled,
            4 => TransferStatus::Stall,
            5 => TransferStatus::NoDevice,
            6 => TransferStatus::Overflow,
            other => TransferStatus::Unknown(other),
        }
    }
}

/// Map a completion status to the negative errno relayed to the peer.
pub fn status_errno(status: TransferStatus) -> i32 {
    match status {
        TransferStatus::Completed => 0,
        TransferStatus::Error => -EIO,
        TransferStatus::TimedOut => -ETIMEDOUT,
        TransferStatus::Cancelled => -ECONNRESET,
        TransferStatus::Stall => -EPIPE,
        TransferStatus::NoDevice => -ESHUTDOWN,
        TransferStatus::Overflow => -EOVERFLOW,
        TransferStatus::Unknown(_) => -ENOENT,
    }
}

/// What the completion callback extracted from the finished transfer
pub struct Completion {
    pub status: TransferStatus,
    pub actual_length: i32,
    /// Per-packet results; empty for non-isochronous transfers
    pub iso: Vec<IsoPacketDescriptor>,
}

struct CallbackCtx {
    shared: Weak<SessionShared>,
    seqnum: u32,
}

/// One submitted libusb transfer and the buffer it reads/writes
pub struct AsyncTransfer {
    xfer: NonNull<ffi::libusb_transfer>,
    ctx: NonNull<CallbackCtx>,
    buffer: Box<[u8]>,
}

// The transfer is only touched under the ring lock or from the libusb event
// thread via the callback; cancellation is thread-safe in libusb.
unsafe impl Send for AsyncTransfer {}
unsafe impl Sync for AsyncTransfer {}

impl AsyncTransfer {
    /// Build a transfer over `buffer`. `length` is the number of bytes
    /// libusb may touch (buffer length for control transfers including the
    /// 8-byte setup prefix, payload length otherwise). For isochronous
    /// transfers `iso_lengths` carries the per-packet lengths.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shared: &Arc<SessionShared>,
        handle: *mut ffi::libusb_device_handle,
        seqnum: u32,
        endpoint: u8,
        transfer_type: u8,
        mut buffer: Box<[u8]>,
        length: usize,
        iso_lengths: &[u32],
    ) -> anyhow::Result<Self> {
        let num_iso = iso_lengths.len() as c_int;
        let xfer = unsafe { ffi::libusb_alloc_transfer(num_iso) };
        let Some(xfer_ptr) = NonNull::new(xfer) else {
            anyhow::bail!("libusb transfer allocation failed");
        };

        let ctx = Box::new(CallbackCtx {
            shared: Arc::downgrade(shared),
            seqnum,
        });
        let ctx_ptr = NonNull::from(Box::leak(ctx));

        unsafe {
            let t = xfer_ptr.as_ptr();
            (*t).dev_handle = handle;
            (*t).flags = 0;
            (*t).endpoint = endpoint as c_uchar;
            (*t).transfer_type = transfer_type as c_uchar;
            (*t).timeout = 0;
            (*t).length = length as c_int;
            (*t).callback = transfer_callback;
            (*t).user_data = ctx_ptr.as_ptr() as *mut c_void;
            (*t).buffer = buffer.as_mut_ptr();
            (*t).num_iso_packets = num_iso;

            if num_iso > 0 {
                let descs = std::slice::from_raw_parts_mut(
                    (*t).iso_packet_desc.as_mut_ptr(),
                    num_iso as usize,
                );
                for (desc, &len) in descs.iter_mut().zip(iso_lengths) {
                    desc.length = len;
                    desc.actual_length = 0;
                    desc.status = 0;
                }
            }
        }

        Ok(Self {
            xfer: xfer_ptr,
            ctx: ctx_ptr,
            buffer,
        })
    }

    /// Hand the transfer to libusb. The completion callback will fire on
    /// the event-pump thread. The caller must already hold the ring lock so
    /// the callback cannot observe a ring without this packet.
    pub fn submit(&self) -> anyhow::Result<()> {
        let ret = unsafe { ffi::libusb_submit_transfer(self.xfer.as_ptr()) };
        if ret != 0 {
            anyhow::bail!("libusb submit failed ({ret})");
        }
        Ok(())
    }

    /// Request cancellation; the result arrives through the callback.
    pub fn cancel(&self) {
        let ret = unsafe { ffi::libusb_cancel_transfer(self.xfer.as_ptr()) };
        if ret != 0 {
            trace!("Cancel transfer returned {}", ret);
        }
    }

    /// The transfer buffer. Data received on IN transfers is valid once the
    /// completion callback has marked the owning packet ready.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}

impl Drop for AsyncTransfer {
    fn drop(&mut self) {
        unsafe {
            ffi::libusb_free_transfer(self.xfer.as_ptr());
            drop(Box::from_raw(self.ctx.as_ptr()));
        }
    }
}

/// Completion trampoline; runs on the event-pump thread.
extern "system" fn transfer_callback(xfer: *mut ffi::libusb_transfer) {
    let (completion, ctx) = unsafe {
        let t = &*xfer;
        let ctx = &*(t.user_data as *const CallbackCtx);

        let iso = if t.num_iso_packets > 0 {
            let descs =
                std::slice::from_raw_parts(t.iso_packet_desc.as_ptr(), t.num_iso_packets as usize);
            descs
                .iter()
                .map(|d| IsoPacketDescriptor {
                    offset: 0,
                    length: d.length,
                    actual_length: d.actual_length,
                    status: status_errno(TransferStatus::from_raw(d.status)),
                })
                .collect()
        } else {
            Vec::new()
        };

        (
            Completion {
                status: TransferStatus::from_raw(t.status),
                actual_length: t.actual_length,
                iso,
            },
            ctx,
        )
    };

    match ctx.shared.upgrade() {
        Some(shared) => shared.complete(ctx.seqnum, completion),
        None => debug!("Completion after session teardown, seqnum {}", ctx.seqnum),
    }
}

/// The libusb event-pump thread
///
/// All completion callbacks fire from here. Runs `handle_events` with a
/// short timeout so shutdown is noticed promptly.
pub struct EventPump {
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl EventPump {
    pub fn spawn(context: rusb::Context) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let thread = std::thread::Builder::new()
            .name("usb-events".to_string())
            .spawn(move || {
                info!("libusb event pump started");
                while flag.load(Ordering::Acquire) {
                    match context.handle_events(Some(Duration::from_millis(100))) {
                        Ok(()) => {}
                        Err(rusb::Error::Interrupted) => {
                            debug!("USB event handling interrupted");
                        }
                        Err(e) => {
                            warn!("Error handling USB events: {}", e);
                            std::thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
                info!("libusb event pump stopped");
            })?;

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_errno(TransferStatus::Completed), 0);
        assert_eq!(status_errno(TransferStatus::Error), -5);
        assert_eq!(status_errno(TransferStatus::TimedOut), -110);
        assert_eq!(status_errno(TransferStatus::Cancelled), -104);
        assert_eq!(status_errno(TransferStatus::Stall), -32);
        assert_eq!(status_errno(TransferStatus::NoDevice), -108);
        assert_eq!(status_errno(TransferStatus::Overflow), -75);
        assert_eq!(status_errno(TransferStatus::Unknown(42)), -2);
    }

    #[test]
    fn test_status_from_raw() {
        assert_eq!(TransferStatus::from_raw(0), TransferStatus::Completed);
        assert_eq!(TransferStatus::from_raw(3), TransferStatus::Cancelled);
        assert_eq!(TransferStatus::from_raw(5), TransferStatus::NoDevice);
        assert_eq!(TransferStatus::from_raw(9), TransferStatus::Unknown(9));
    }
}
