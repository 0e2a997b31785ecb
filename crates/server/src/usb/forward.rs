//! Per-device forwarding session
//!
//! Once an import is accepted the link speaks the 48-byte data-header
//! protocol and this module owns it: an RX worker decodes `CMD_SUBMIT`/
//! `CMD_UNLINK` into asynchronous host transfers, a TX worker serialises
//! completed replies back onto the link, and a monitor supervises both,
//! drains the ring and releases the device when either side fails.
//!
//! The session terminates on RX read failure, TX write failure, device
//! disappearance or an external stop request; the rest of the process is
//! unaffected.

use crate::events::ServerEvent;
use crate::usb::UsbDeviceInfo;
use crate::usb::ring::{PACKET_BUF_SIZE, SessionShared, UsbPacket};
use crate::usb::transfer::{
    AsyncTransfer, ECONNRESET, XFER_TYPE_CONTROL, XFER_TYPE_ISOC,
};
use common::runtime::EventBus;
use common::Link;
use protocol::{
    CMD_SUBMIT, CMD_UNLINK, Direction, IsoPacketDescriptor, RET_SUBMIT, RET_UNLINK, RetUnlink,
    UsbDevice, UsbIpHeader, UsbIpHeaderUnion,
};
use rusb::{Context, DeviceHandle};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, error, trace};

// Standard control requests the session executes locally before forwarding
const REQ_CLEAR_FEATURE: u8 = 0x01;
const REQ_SET_FEATURE: u8 = 0x03;
const REQ_SET_CONFIGURATION: u8 = 0x09;
const REQ_SET_INTERFACE: u8 = 0x0b;
const RECIP_DEVICE: u8 = 0x00;
const RECIP_INTERFACE: u8 = 0x01;
const RECIP_ENDPOINT: u8 = 0x02;
const RT_PORT: u8 = 0x23;
const FEAT_ENDPOINT_HALT: u16 = 0;
const FEAT_PORT_RESET: u16 = 4;

/// Everything the RX/TX/monitor workers share for one exported device
pub struct Session {
    pub shared: Arc<SessionShared>,
    handle: Arc<Mutex<DeviceHandle<Context>>>,
    udev: UsbDevice,
    ep_in_type: [u8; 16],
    ep_out_type: [u8; 16],
}

/// Owner-side handle to a running forwarding session
pub struct ForwardHandle {
    pub shared: Arc<SessionShared>,
    monitor: tokio::task::JoinHandle<()>,
}

impl ForwardHandle {
    /// The monitor has fully torn the session down.
    pub fn finished(&self) -> bool {
        self.monitor.is_finished()
    }

    pub fn terminated(&self) -> bool {
        self.shared.is_terminated()
    }

    pub fn request_stop(&self) {
        self.shared.request_stop();
    }

    /// Block until the monitor has exited.
    pub fn join(self, rt: &tokio::runtime::Handle) {
        let _ = rt.block_on(self.monitor);
    }
}

/// Open, claim and reset the device, then hand the link to a new session.
///
/// The import reply has already been sent; on error the caller closes the
/// link and the device stays unexported.
pub fn start(
    info: &UsbDeviceInfo,
    device: &rusb::Device<Context>,
    link: Link,
    bus: Arc<EventBus<ServerEvent>>,
    rt: &tokio::runtime::Handle,
) -> anyhow::Result<ForwardHandle> {
    if info.udev.b_num_configurations != 1 {
        anyhow::bail!("Only single config devices supported");
    }

    let mut handle = device.open()?;
    claim_device(&mut handle, info.udev.b_num_interfaces)?;
    if let Err(e) = handle.reset() {
        debug!("Device reset after claim failed: {}", e);
    }

    let session = Arc::new(Session {
        shared: Arc::new(SessionShared::new()),
        handle: Arc::new(Mutex::new(handle)),
        udev: info.udev.clone(),
        ep_in_type: info.ep_in_type,
        ep_out_type: info.ep_out_type,
    });

    let shared = session.shared.clone();
    let monitor = rt.spawn(run_monitor(session, link, bus));

    Ok(ForwardHandle { shared, monitor })
}

/// Detach the kernel driver from every interface and claim them all.
fn claim_device(handle: &mut DeviceHandle<Context>, num_interfaces: u8) -> anyhow::Result<()> {
    for i in 0..num_interfaces {
        if handle.kernel_driver_active(i).unwrap_or(false) {
            handle
                .detach_kernel_driver(i)
                .map_err(|e| anyhow::anyhow!("Failed to detach if {i}: {e}"))?;
        }
        handle
            .claim_interface(i)
            .map_err(|e| anyhow::anyhow!("Failed to claim if {i}: {e}"))?;
        debug!("Claimed if {}", i);
    }
    Ok(())
}

/// Release every interface, give it back to the kernel, reset the device.
fn release_device(handle: &Arc<Mutex<DeviceHandle<Context>>>, num_interfaces: u8) {
    let mut handle = handle.lock().unwrap();
    for i in 0..num_interfaces {
        debug!("Checking interface {}", i);
        if !handle.kernel_driver_active(i).unwrap_or(true) {
            if let Err(e) = handle.release_interface(i) {
                debug!("Failed to release if {}: {}", i, e);
            }
            match handle.attach_kernel_driver(i) {
                Ok(()) => debug!("Kernel driver attached to if {}", i),
                Err(e) => debug!("Failed to attach kernel driver to if {}: {}", i, e),
            }
        }
    }
    if let Err(e) = handle.reset() {
        debug!("Device reset failed: {}", e);
    }
}

async fn run_monitor(session: Arc<Session>, link: Link, bus: Arc<EventBus<ServerEvent>>) {
    bus.enqueue(ServerEvent::DeviceExported(session.udev.clone()))
        .await;

    let (rd, wr) = tokio::io::split(link);
    let rx = tokio::spawn(rx_loop(session.clone(), rd));
    let tx = tokio::spawn(tx_loop(session.clone(), wr));
    let _ = rx.await;
    let _ = tx.await;

    drain_ring(&session).await;

    let handle = session.handle.clone();
    let num_interfaces = session.udev.b_num_interfaces;
    let _ = tokio::task::spawn_blocking(move || release_device(&handle, num_interfaces)).await;

    bus.enqueue(ServerEvent::DeviceUnexported(session.udev.clone()))
        .await;
    trace!("Monitor exit");
}

/// Dispose of every packet still in the ring; in-flight transfers are
/// cancelled and polled to completion before their buffers are freed.
async fn drain_ring(session: &Arc<Session>) {
    loop {
        let front = session.shared.ring.lock().unwrap().front_ready();
        match front {
            None => break,
            Some(true) => {
                session.shared.ring.lock().unwrap().pop_front();
            }
            Some(false) => {
                session.shared.ring.lock().unwrap().cancel_front();
                while session.shared.ring.lock().unwrap().front_ready() == Some(false) {
                    debug!("Waiting for completion");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

async fn rx_loop(session: Arc<Session>, mut rd: ReadHalf<Link>) {
    debug!("Fwd RX started");
    let mut stop = session.shared.stop_signal();

    loop {
        // Backpressure: stall while TX has a full window of replies pending
        session
            .shared
            .wait_ring(|ring| ring.ready_count() < PACKET_BUF_SIZE)
            .await;
        if session.shared.is_terminated() {
            break;
        }

        let mut hdr_buf = [0u8; UsbIpHeader::SIZE];
        let read = tokio::select! {
            r = rd.read_exact(&mut hdr_buf) => r,
            _ = stop.wait_for(|s| *s) => break,
        };
        if read.is_err() {
            debug!("Header receive failed");
            break;
        }

        let hdr = match UsbIpHeader::decode(&hdr_buf) {
            Ok(hdr) => hdr,
            Err(e) => {
                error!("Unknown header: {}", e);
                break;
            }
        };

        match hdr.base.command {
            CMD_SUBMIT => {
                trace!("Received SUBMIT packet seqnum {}", hdr.base.seqnum);
                if let Err(e) = handle_submit(&session, &mut rd, hdr).await {
                    error!("Submit failed: {}", e);
                    break;
                }
            }
            CMD_UNLINK => handle_unlink(&session, hdr),
            other => {
                error!("Unexpected command {:#x} in forwarding mode", other);
                break;
            }
        }
    }

    debug!("Fwd RX terminate");
    session.shared.request_stop();
}

async fn handle_submit(
    session: &Arc<Session>,
    rd: &mut ReadHalf<Link>,
    hdr: UsbIpHeader,
) -> anyhow::Result<()> {
    let cmd = *hdr.cmd_submit().expect("checked command");
    let direction = Direction::from_wire(hdr.base.direction)?;
    let ep = hdr.base.ep;
    let bufsize = cmd.transfer_buffer_length.max(0) as usize;

    // The buffer always reserves 8 leading bytes so a control transfer can
    // carry its setup packet in front of the data
    let mut buffer = vec![0u8; bufsize + 8].into_boxed_slice();
    buffer[..8].copy_from_slice(&cmd.setup);
    let offset = if ep == 0 { 8 } else { 0 };

    if direction == Direction::Out && bufsize > 0 {
        rd.read_exact(&mut buffer[offset..offset + bufsize]).await?;
    }

    let transfer_type = transfer_type_for(session, direction, ep);
    let num_iso = if transfer_type == XFER_TYPE_ISOC {
        cmd.number_of_packets.max(0) as usize
    } else {
        0
    };

    let mut iso_lengths = Vec::with_capacity(num_iso);
    if num_iso > 0 {
        let mut iso_buf = vec![0u8; num_iso * IsoPacketDescriptor::SIZE];
        rd.read_exact(&mut iso_buf).await?;
        for chunk in iso_buf.chunks_exact(IsoPacketDescriptor::SIZE) {
            iso_lengths.push(IsoPacketDescriptor::decode(chunk)?.length);
        }
    }

    if ep == 0 {
        intercept_control(session, cmd.setup).await;
    }

    trace!(
        "Submit seq {} ep {:#x} dir {:?} type {} len {} iso {}",
        hdr.base.seqnum, ep, direction, transfer_type, bufsize, num_iso
    );

    let endpoint = endpoint_address(ep, direction);
    let length = bufsize + offset;
    let handle_raw = session.handle.lock().unwrap().as_raw();

    // The ring lock is held across submit and insert so the completion
    // callback always finds the packet
    let mut ring = session.shared.ring.lock().unwrap();
    let transfer = AsyncTransfer::new(
        &session.shared,
        handle_raw,
        hdr.base.seqnum,
        endpoint,
        transfer_type,
        buffer,
        length,
        &iso_lengths,
    )?;
    transfer.submit()?;
    ring.push(UsbPacket::submitted(hdr, transfer));

    Ok(())
}

fn handle_unlink(session: &Arc<Session>, hdr: UsbIpHeader) {
    let unlink_seqnum = hdr.base.seqnum;
    let target = match hdr.u {
        UsbIpHeaderUnion::CmdUnlink(c) => c.seqnum,
        _ => return,
    };
    debug!("Received UNLINK seq {} [for {}]", unlink_seqnum, target);

    let found = session
        .shared
        .ring
        .lock()
        .unwrap()
        .unlink(target, unlink_seqnum);
    if found {
        debug!("Packet {} found and unlinked", target);
        return;
    }

    // The target was already replied to; answer the unlink directly
    debug!("Packet {} was not found for unlinking", target);
    let mut reply = hdr;
    reply.base.command = RET_UNLINK;
    reply.u = UsbIpHeaderUnion::RetUnlink(RetUnlink { status: 0 });
    session
        .shared
        .ring
        .lock()
        .unwrap()
        .push(UsbPacket::synthesised(reply));
    session.shared.ring_changed.notify_waiters();
}

async fn tx_loop(session: Arc<Session>, mut wr: WriteHalf<Link>) {
    debug!("Fwd TX started");

    loop {
        session.shared.wait_ring(|ring| ring.ready_count() > 0).await;
        if session.shared.is_terminated() {
            break;
        }

        let packet = session.shared.ring.lock().unwrap().dequeue_ready();
        let Some(mut packet) = packet else {
            continue;
        };
        // RX may be stalled on the backpressure bound
        session.shared.ring_changed.notify_waiters();

        if packet.unlinked != 0 {
            // Successful unlink status is -ECONNRESET
            packet.hdr.base.command = RET_UNLINK;
            packet.hdr.base.seqnum = packet.unlinked;
            packet.hdr.u = UsbIpHeaderUnion::RetUnlink(RetUnlink {
                status: -ECONNRESET,
            });
        }

        let command = packet.hdr.base.command;
        if command != RET_SUBMIT && command != RET_UNLINK {
            debug!("Unknown command {:#x} in ring", command);
            break;
        }

        if wr.write_all(&packet.hdr.encode()).await.is_err() {
            break;
        }

        if command == RET_SUBMIT {
            let sent = if !packet.iso_results.is_empty() {
                send_iso_data(&mut wr, &packet).await
            } else {
                send_data(&mut wr, &packet).await
            };
            if sent.is_err() {
                break;
            }
        }
        // Packet, transfer and buffer are freed here
    }

    debug!("Fwd TX terminate");
    session.shared.request_stop();
}

async fn send_data(wr: &mut WriteHalf<Link>, packet: &UsbPacket) -> std::io::Result<()> {
    if packet.hdr.base.direction != Direction::In as u32 {
        return Ok(());
    }
    let Some(transfer) = &packet.transfer else {
        return Ok(());
    };
    let actual_length = match packet.hdr.u {
        UsbIpHeaderUnion::RetSubmit(r) => r.actual_length.max(0) as usize,
        _ => 0,
    };

    let offset = if packet.hdr.base.ep == 0 { 8 } else { 0 };
    let buffer = transfer.buffer();
    let end = (offset + actual_length).min(buffer.len());
    wr.write_all(&buffer[offset..end]).await
}

async fn send_iso_data(wr: &mut WriteHalf<Link>, packet: &UsbPacket) -> std::io::Result<()> {
    if packet.hdr.base.direction == Direction::In as u32
        && let Some(transfer) = &packet.transfer
    {
        let buffer = transfer.buffer();
        let mut offset = 0usize;
        let mut sent = 0usize;
        for desc in &packet.iso_results {
            let end = (offset + desc.actual_length as usize).min(buffer.len());
            wr.write_all(&buffer[offset..end]).await?;
            sent += desc.actual_length as usize;
            offset += desc.length as usize;
        }
        debug!("Sent iso data {} (offset {})", sent, offset);
    }

    // Descriptor records always follow, offsets accumulating full lengths
    let mut offset = 0u32;
    for desc in &packet.iso_results {
        let wire = IsoPacketDescriptor {
            offset,
            length: desc.length,
            actual_length: desc.actual_length,
            status: desc.status,
        };
        wr.write_all(&wire.encode()).await?;
        offset += desc.length;
    }
    Ok(())
}

/// Execute local side effects of standard control requests before the
/// packet is forwarded to the device.
async fn intercept_control(session: &Arc<Session>, setup: [u8; 8]) {
    let bm_request_type = setup[0];
    let b_request = setup[1];
    let w_value = u16::from_le_bytes([setup[2], setup[3]]);
    let w_index = u16::from_le_bytes([setup[4], setup[5]]);

    let handle = session.handle.clone();
    let _ = tokio::task::spawn_blocking(move || {
        let mut handle = handle.lock().unwrap();
        match (b_request, bm_request_type) {
            (REQ_CLEAR_FEATURE, RECIP_ENDPOINT) if w_value == FEAT_ENDPOINT_HALT => {
                let ep = (w_index & 0x008f) as u8;
                debug!("Clearing halt from ep {:#x}", ep);
                if let Err(e) = handle.clear_halt(ep) {
                    error!("Clearing halt from ep {:#x} failed: {}", ep, e);
                }
            }
            (REQ_SET_FEATURE, RT_PORT) if w_value == FEAT_PORT_RESET => {
                debug!("Reset command received");
                if let Err(e) = handle.reset() {
                    debug!("Device reset failed: {}", e);
                }
            }
            (REQ_SET_CONFIGURATION, RECIP_DEVICE) => {
                debug!("Config changing not supported (cfg {})", w_value);
            }
            (REQ_SET_INTERFACE, RECIP_INTERFACE) => {
                match handle.set_alternate_setting(w_index as u8, w_value as u8) {
                    Ok(()) => debug!("Set interface {}, altsetting {}", w_index, w_value),
                    Err(_) => debug!("Interface setting failed"),
                }
            }
            _ => {}
        }
    })
    .await;
}

/// Transfer type for the endpoint, from the enumeration-time type tables.
fn transfer_type_for(session: &Session, direction: Direction, ep: u32) -> u8 {
    if ep == 0 {
        return XFER_TYPE_CONTROL;
    }
    let epnum = (ep & 0x0f) as usize;
    match direction {
        Direction::In => session.ep_in_type[epnum],
        Direction::Out => session.ep_out_type[epnum],
    }
}

/// libusb endpoint address: direction bit folded into the number.
fn endpoint_address(ep: u32, direction: Direction) -> u8 {
    if ep == 0 {
        return 0;
    }
    match direction {
        Direction::In => (ep as u8) | 0x80,
        Direction::Out => ep as u8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_address() {
        assert_eq!(endpoint_address(0, Direction::Out), 0);
        assert_eq!(endpoint_address(0, Direction::In), 0);
        assert_eq!(endpoint_address(1, Direction::Out), 0x01);
        assert_eq!(endpoint_address(1, Direction::In), 0x81);
        assert_eq!(endpoint_address(15, Direction::In), 0x8f);
    }

    #[test]
    fn test_setup_parsing_shape() {
        // CLEAR_FEATURE(ENDPOINT_HALT) on ep 0x81
        let setup: [u8; 8] = [0x02, 0x01, 0x00, 0x00, 0x81, 0x00, 0x00, 0x00];
        assert_eq!(setup[0], RECIP_ENDPOINT);
        assert_eq!(setup[1], REQ_CLEAR_FEATURE);
        let w_value = u16::from_le_bytes([setup[2], setup[3]]);
        let w_index = u16::from_le_bytes([setup[4], setup[5]]);
        assert_eq!(w_value, FEAT_ENDPOINT_HALT);
        assert_eq!(w_index & 0x008f, 0x0081);
    }
}
