//! Per-session packet ring
//!
//! Every outstanding USB/IP request of a forwarding session lives here from
//! the moment RX submits it until TX has written its reply (or the monitor
//! discards it on teardown). The ring preserves submission order; TX may
//! dequeue the first *ready* entry past not-yet-ready predecessors, which
//! keep their position.
//!
//! Mutated by four parties under the one lock: RX inserts, TX dequeues, the
//! transfer completion callback marks entries ready, the monitor drains.

use crate::usb::transfer::{AsyncTransfer, Completion, ECONNRESET, TransferStatus, status_errno};
use protocol::{IsoPacketDescriptor, RET_SUBMIT, RetSubmit, UsbIpHeader, UsbIpHeaderUnion};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, watch};
use tracing::{debug, trace};

/// Outstanding-packet bound per forwarding session; RX stalls at this depth
/// until TX drains.
pub const PACKET_BUF_SIZE: usize = 32;

/// One outstanding USB/IP request
pub struct UsbPacket {
    /// Request header on arrival; rewritten to the reply header on
    /// completion
    pub hdr: UsbIpHeader,
    /// The in-flight transfer; `None` for synthesised unlink replies
    pub transfer: Option<AsyncTransfer>,
    /// Completion callback has stored status and length
    pub ready: bool,
    /// Nonzero: seqnum of the UNLINK request that cancelled this submission
    pub unlinked: u32,
    /// Per-packet results of an isochronous transfer, filled on completion
    pub iso_results: Vec<IsoPacketDescriptor>,
}

impl UsbPacket {
    pub fn submitted(hdr: UsbIpHeader, transfer: AsyncTransfer) -> Self {
        Self {
            hdr,
            transfer: Some(transfer),
            ready: false,
            unlinked: 0,
            iso_results: Vec::new(),
        }
    }

    /// A reply packet that was never backed by a transfer (synthesised
    /// RET_UNLINK for an already-completed target).
    pub fn synthesised(hdr: UsbIpHeader) -> Self {
        Self {
            hdr,
            transfer: None,
            ready: true,
            unlinked: 0,
            iso_results: Vec::new(),
        }
    }
}

/// Submission-ordered ring with a ready counter
#[derive(Default)]
pub struct PacketRing {
    entries: std::collections::VecDeque<UsbPacket>,
    ready_count: usize,
}

impl PacketRing {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ready_count(&self) -> usize {
        self.ready_count
    }

    /// Append a packet in submission order.
    pub fn push(&mut self, packet: UsbPacket) {
        if packet.ready {
            self.ready_count += 1;
        }
        self.entries.push_back(packet);
    }

    /// Remove and return the first ready packet, leaving earlier not-ready
    /// entries in place.
    pub fn dequeue_ready(&mut self) -> Option<UsbPacket> {
        let idx = self.entries.iter().position(|p| p.ready)?;
        self.ready_count -= 1;
        self.entries.remove(idx)
    }

    /// Mark the packet with the given submit seqnum as unlinked and cancel
    /// its transfer. Returns false when no such packet is pending.
    pub fn unlink(&mut self, target_seqnum: u32, unlink_seqnum: u32) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|p| p.transfer.is_some() && p.hdr.base.seqnum == target_seqnum)
        {
            Some(packet) => {
                packet.unlinked = unlink_seqnum;
                if let Some(transfer) = &packet.transfer {
                    transfer.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Completion result for the pending packet with this seqnum.
    fn complete_packet(&mut self, seqnum: u32, completion: Completion) -> bool {
        let Some(packet) = self
            .entries
            .iter_mut()
            .find(|p| !p.ready && p.hdr.base.seqnum == seqnum)
        else {
            return false;
        };

        match completion.status {
            TransferStatus::Cancelled => {
                trace!("Transfer {} cancelled", seqnum);
                packet.hdr.u = UsbIpHeaderUnion::RetSubmit(RetSubmit {
                    status: -ECONNRESET,
                    ..Default::default()
                });
            }
            TransferStatus::NoDevice => {
                trace!("Transfer {} completed without device", seqnum);
            }
            status => {
                let mut actual_length = completion.actual_length;
                if !completion.iso.is_empty() {
                    actual_length = completion.iso.iter().map(|d| d.actual_length as i32).sum();
                    debug!("ISO actual length changed to {}", actual_length);
                }
                packet.hdr.base.command = RET_SUBMIT;
                packet.hdr.u = UsbIpHeaderUnion::RetSubmit(RetSubmit {
                    status: status_errno(status),
                    actual_length,
                    start_frame: 0,
                    number_of_packets: completion.iso.len() as i32,
                    error_count: 0,
                });
                packet.iso_results = completion.iso;
            }
        }

        packet.ready = true;
        self.ready_count += 1;
        true
    }

    pub(crate) fn front_ready(&self) -> Option<bool> {
        self.entries.front().map(|p| p.ready)
    }

    pub(crate) fn cancel_front(&mut self) {
        if let Some(transfer) = self.entries.front().and_then(|p| p.transfer.as_ref()) {
            transfer.cancel();
        }
    }

    pub(crate) fn pop_front(&mut self) -> Option<UsbPacket> {
        let packet = self.entries.pop_front()?;
        if packet.ready {
            self.ready_count -= 1;
        }
        Some(packet)
    }
}

/// State shared between RX, TX, the completion callback and the monitor
pub struct SessionShared {
    pub ring: Mutex<PacketRing>,
    /// Signalled whenever the ring contents change (completion, drain)
    pub ring_changed: Notify,
    terminate: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl Default for SessionShared {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionShared {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            ring: Mutex::new(PacketRing::default()),
            ring_changed: Notify::new(),
            terminate: AtomicBool::new(false),
            stop_tx,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Flip the session to terminating and wake every waiter.
    pub fn request_stop(&self) {
        self.terminate.store(true, Ordering::Release);
        let _ = self.stop_tx.send(true);
        self.ring_changed.notify_waiters();
    }

    /// A receiver that resolves once the session is stopping.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Entry point for the transfer completion callback. Runs on the libusb
    /// event thread.
    pub fn complete(&self, seqnum: u32, completion: Completion) {
        if completion.status == TransferStatus::NoDevice {
            debug!("Device gone, terminating session");
            self.terminate.store(true, Ordering::Release);
            let _ = self.stop_tx.send(true);
        }

        {
            let mut ring = self.ring.lock().unwrap();
            if !ring.complete_packet(seqnum, completion) {
                debug!("Completion for unknown seqnum {}", seqnum);
            }
        }
        self.ring_changed.notify_waiters();
    }

    /// Wait until `cond` holds for the ring or the session is stopping.
    pub async fn wait_ring<F>(&self, cond: F)
    where
        F: Fn(&PacketRing) -> bool,
    {
        loop {
            let notified = self.ring_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_terminated() || cond(&self.ring.lock().unwrap()) {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{CMD_SUBMIT, CmdSubmit, CmdUnlink, HeaderBasic, RET_UNLINK, RetUnlink};

    fn submit_hdr(seqnum: u32) -> UsbIpHeader {
        UsbIpHeader {
            base: HeaderBasic {
                command: CMD_SUBMIT,
                seqnum,
                devid: 0x10004,
                direction: 1,
                ep: 1,
            },
            u: UsbIpHeaderUnion::CmdSubmit(CmdSubmit {
                transfer_buffer_length: 64,
                ..Default::default()
            }),
        }
    }

    /// A pending packet without a live transfer; unlink-by-seqnum then
    /// works on header state only.
    fn pending(seqnum: u32) -> UsbPacket {
        UsbPacket {
            hdr: submit_hdr(seqnum),
            transfer: None,
            ready: false,
            unlinked: 0,
            iso_results: Vec::new(),
        }
    }

    fn completed(status: TransferStatus, actual_length: i32) -> Completion {
        Completion {
            status,
            actual_length,
            iso: Vec::new(),
        }
    }

    #[test]
    fn test_ready_dequeue_skips_pending_but_keeps_order() {
        let mut ring = PacketRing::default();
        for seq in 1..=3 {
            ring.push(pending(seq));
        }
        assert!(ring.dequeue_ready().is_none());

        // Second submission completes first
        assert!(ring.complete_packet(2, completed(TransferStatus::Completed, 8)));
        assert_eq!(ring.ready_count(), 1);

        let out = ring.dequeue_ready().unwrap();
        assert_eq!(out.hdr.base.seqnum, 2);
        assert_eq!(out.hdr.base.command, RET_SUBMIT);

        // Predecessor is still first in line
        assert_eq!(ring.len(), 2);
        assert!(ring.complete_packet(1, completed(TransferStatus::Completed, 8)));
        assert!(ring.complete_packet(3, completed(TransferStatus::Completed, 8)));
        assert_eq!(ring.dequeue_ready().unwrap().hdr.base.seqnum, 1);
        assert_eq!(ring.dequeue_ready().unwrap().hdr.base.seqnum, 3);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_reply_echoes_request_seqnum_and_devid() {
        let mut ring = PacketRing::default();
        ring.push(pending(10));
        ring.complete_packet(10, completed(TransferStatus::Completed, 18));

        let packet = ring.dequeue_ready().unwrap();
        assert_eq!(packet.hdr.base.seqnum, 10);
        assert_eq!(packet.hdr.base.devid, 0x10004);
        match packet.hdr.u {
            UsbIpHeaderUnion::RetSubmit(r) => {
                assert_eq!(r.status, 0);
                assert_eq!(r.actual_length, 18);
            }
            _ => panic!("expected RET_SUBMIT"),
        }
    }

    #[test]
    fn test_unlink_marks_pending_packet() {
        let mut ring = PacketRing::default();
        let mut packet = pending(10);
        // unlink() only considers packets with a live transfer; emulate the
        // marking path directly on header state
        packet.unlinked = 11;
        ring.push(packet);

        ring.complete_packet(10, completed(TransferStatus::Cancelled, 0));
        let out = ring.dequeue_ready().unwrap();
        assert_eq!(out.unlinked, 11);
        match out.hdr.u {
            UsbIpHeaderUnion::RetSubmit(r) => assert_eq!(r.status, -ECONNRESET),
            _ => panic!("expected RET_SUBMIT status"),
        }
    }

    #[test]
    fn test_unlink_missing_target_reports_false() {
        let mut ring = PacketRing::default();
        ring.push(pending(1));
        assert!(!ring.unlink(99, 100));
    }

    #[test]
    fn test_synthesised_unlink_reply_is_ready_immediately() {
        let mut ring = PacketRing::default();
        let hdr = UsbIpHeader {
            base: HeaderBasic {
                command: RET_UNLINK,
                seqnum: 11,
                devid: 0,
                direction: 0,
                ep: 0,
            },
            u: UsbIpHeaderUnion::RetUnlink(RetUnlink { status: 0 }),
        };
        ring.push(UsbPacket::synthesised(hdr));
        assert_eq!(ring.ready_count(), 1);

        let out = ring.dequeue_ready().unwrap();
        assert_eq!(out.hdr.base.seqnum, 11);
        assert!(out.transfer.is_none());
    }

    #[test]
    fn test_iso_actual_length_is_summed() {
        let mut ring = PacketRing::default();
        ring.push(pending(5));

        let iso = vec![
            IsoPacketDescriptor {
                offset: 0,
                length: 192,
                actual_length: 188,
                status: 0,
            },
            IsoPacketDescriptor {
                offset: 0,
                length: 192,
                actual_length: 64,
                status: 0,
            },
        ];
        ring.complete_packet(
            5,
            Completion {
                status: TransferStatus::Completed,
                actual_length: 0,
                iso,
            },
        );

        let out = ring.dequeue_ready().unwrap();
        match out.hdr.u {
            UsbIpHeaderUnion::RetSubmit(r) => {
                assert_eq!(r.actual_length, 252);
                assert_eq!(r.number_of_packets, 2);
            }
            _ => panic!("expected RET_SUBMIT"),
        }
        assert_eq!(out.iso_results.len(), 2);
    }

    #[test]
    fn test_error_status_mapping() {
        let mut ring = PacketRing::default();
        ring.push(pending(7));
        ring.complete_packet(7, completed(TransferStatus::Stall, 0));
        let out = ring.dequeue_ready().unwrap();
        match out.hdr.u {
            UsbIpHeaderUnion::RetSubmit(r) => assert_eq!(r.status, -32), // EPIPE
            _ => panic!("expected RET_SUBMIT"),
        }
    }

    #[test]
    fn test_unlink_header_shape() {
        // CMD_UNLINK carries the target in the union, its own seqnum in base
        let hdr = UsbIpHeader {
            base: HeaderBasic {
                command: protocol::CMD_UNLINK,
                seqnum: 11,
                devid: 0,
                direction: 0,
                ep: 0,
            },
            u: UsbIpHeaderUnion::CmdUnlink(CmdUnlink { seqnum: 10 }),
        };
        match hdr.u {
            UsbIpHeaderUnion::CmdUnlink(c) => assert_eq!(c.seqnum, 10),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_wait_ring_wakes_on_completion() {
        use std::sync::Arc;

        let shared = Arc::new(SessionShared::new());
        shared.ring.lock().unwrap().push(pending(1));

        let waiter = {
            let shared = shared.clone();
            tokio::spawn(async move {
                shared.wait_ring(|ring| ring.ready_count() > 0).await;
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        shared.complete(1, completed(TransferStatus::Completed, 4));

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_ring_wakes_on_stop() {
        use std::sync::Arc;

        let shared = Arc::new(SessionShared::new());
        let waiter = {
            let shared = shared.clone();
            tokio::spawn(async move {
                shared.wait_ring(|ring| ring.ready_count() > 0).await;
                shared.is_terminated()
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        shared.request_stop();

        let terminated = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(terminated);
    }
}
