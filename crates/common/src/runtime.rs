//! Event bus and task mailboxes
//!
//! A process-wide bus fans events out to registered tasks. Each task owns a
//! bounded FIFO mailbox and a bitmask selecting the event types it wants;
//! `enqueue` delivers a clone of the event to every matching mailbox before
//! returning, so fan-out is atomic with respect to other enqueuers.
//!
//! The terminate event (mask bit 0) is special: it matches no mask, flips
//! the bus to stopped, closes every mailbox (which unblocks all dequeuers
//! once they drain), and wakes anyone parked in [`EventBus::wait_terminated`].
//! Further `enqueue` calls return `false`.
//!
//! A mailbox deeper than [`QUEUE_WARN_DEPTH`] logs a warning and the sender
//! blocks until the consumer drains, bounding memory instead of aborting.

use async_channel::{Receiver, Sender, bounded};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

/// Mailbox capacity; enqueue blocks once a task is this far behind.
pub const MAILBOX_CAPACITY: usize = 256;

/// Depth at which a task is reported as stuck.
pub const QUEUE_WARN_DEPTH: usize = 100;

/// An event deliverable through the bus.
///
/// `mask_bit` returns the one-hot bit identifying the event type; the
/// terminate event returns 0 and is the only event allowed to.
pub trait BusEvent: Clone + Send + 'static {
    fn mask_bit(&self) -> u32;

    fn is_terminate(&self) -> bool {
        self.mask_bit() == 0
    }
}

struct TaskSlot<E> {
    name: String,
    mask: u32,
    tx: Sender<E>,
}

/// The receiving end of a task's mailbox.
pub struct Mailbox<E> {
    name: String,
    rx: Receiver<E>,
}

impl<E> Mailbox<E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive the next event; `None` once the bus has terminated and the
    /// mailbox is drained.
    pub async fn recv(&self) -> Option<E> {
        self.rx.recv().await.ok()
    }

    /// Blocking receive for tasks that run on their own thread.
    pub fn recv_blocking(&self) -> Option<E> {
        self.rx.recv_blocking().ok()
    }
}

/// Typed, subscription-filtered event bus.
pub struct EventBus<E> {
    tasks: Mutex<Vec<TaskSlot<E>>>,
    running: AtomicBool,
    terminated: Notify,
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            terminated: Notify::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Register a task and get its mailbox back.
    pub async fn register(&self, name: &str, mask: u32) -> Mailbox<E> {
        let (tx, rx) = bounded(MAILBOX_CAPACITY);
        self.tasks.lock().await.push(TaskSlot {
            name: name.to_string(),
            mask,
            tx,
        });
        trace!("Task [{}] registered", name);
        Mailbox {
            name: name.to_string(),
            rx,
        }
    }

    /// Deliver `event` to every task whose mask matches.
    ///
    /// Returns `false` without delivering once the bus has terminated.
    pub async fn enqueue(&self, event: E) -> bool {
        if !self.is_running() {
            return false;
        }

        let tasks = self.tasks.lock().await;
        let bit = event.mask_bit();
        for slot in tasks.iter() {
            if bit & slot.mask == 0 {
                continue;
            }
            let depth = slot.tx.len();
            if depth > QUEUE_WARN_DEPTH {
                warn!("Task [{}] is {} events behind", slot.name, depth);
            }
            if slot.tx.send(event.clone()).await.is_err() {
                debug!("Task [{}] mailbox closed, event dropped", slot.name);
            }
        }

        if event.is_terminate() {
            debug!("Terminate event handling");
            self.running.store(false, Ordering::Release);
            for slot in tasks.iter() {
                slot.tx.close();
            }
            drop(tasks);
            self.terminated.notify_waiters();
        }

        true
    }

    /// Blocking variant of [`enqueue`](Self::enqueue) for tasks running on
    /// their own thread.
    pub fn enqueue_blocking(&self, event: E) -> bool {
        if !self.is_running() {
            return false;
        }

        let tasks = self.tasks.blocking_lock();
        let bit = event.mask_bit();
        for slot in tasks.iter() {
            if bit & slot.mask == 0 {
                continue;
            }
            let depth = slot.tx.len();
            if depth > QUEUE_WARN_DEPTH {
                warn!("Task [{}] is {} events behind", slot.name, depth);
            }
            if slot.tx.send_blocking(event.clone()).is_err() {
                debug!("Task [{}] mailbox closed, event dropped", slot.name);
            }
        }

        if event.is_terminate() {
            self.running.store(false, Ordering::Release);
            for slot in tasks.iter() {
                slot.tx.close();
            }
            drop(tasks);
            self.terminated.notify_waiters();
        }

        true
    }

    /// Park until the terminate event has been enqueued.
    pub async fn wait_terminated(&self) {
        loop {
            let notified = self.terminated.notified();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }
}
