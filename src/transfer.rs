//! Pool of in-flight bulk transfers against one endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{usb_error_name, Result};
use crate::logger::LogSink;
use crate::usb_proto::TransferStatus;

/// How long `stop` waits before cancelling stragglers again.
const CANCEL_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Bulk,
    Isochronous,
}

/// What happens to a transfer after its completion was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Resubmit,
    Retire,
}

/// Receives transfer completions on the transport's event thread.
///
/// Implementations must not block.
pub trait CompletionSink: Send + Sync {
    fn complete(&self, slot: usize, status: TransferStatus, data: &[u8]) -> Disposition;

    /// The slot will never complete again.
    fn retire(&self, slot: usize);

    fn resubmit_failed(&self, slot: usize, _code: i32) {
        self.retire(slot);
    }
}

/// Runs one completion through `sink` and resubmits or retires the slot.
pub fn finish_completion(
    sink: &dyn CompletionSink,
    slot: usize,
    status: TransferStatus,
    data: &[u8],
    resubmit: impl FnOnce() -> std::result::Result<(), i32>,
) {
    match sink.complete(slot, status, data) {
        Disposition::Retire => sink.retire(slot),
        Disposition::Resubmit => {
            if let Err(code) = resubmit() {
                sink.resubmit_failed(slot, code);
            }
        }
    }
}

/// Transfer submission primitives for one device.
///
/// Completions are reported to the sink given to `allocate`, usually from
/// another thread, and must go through [`finish_completion`].
pub trait BulkEndpoint: Send {
    fn clear_halt(&mut self, endpoint: u8) -> std::result::Result<(), i32>;

    /// Prepares `count` transfers of `size` bytes each, backed by one arena.
    fn allocate(&mut self, endpoint: u8, count: usize, size: usize, sink: Arc<dyn CompletionSink>) -> Result<()>;

    fn submit(&mut self, slot: usize) -> std::result::Result<(), i32>;

    /// Requests cancellation; the slot still reports a completion afterwards.
    fn cancel(&mut self, slot: usize);

    /// Frees everything `allocate` created. Only called with no slot in flight.
    fn release(&mut self);
}

pub type DataHandler = Box<dyn FnMut(&[u8]) + Send>;

#[derive(Debug, Default)]
struct Slots {
    active: Vec<bool>,
    count: usize,
}

struct Shared {
    handler: Mutex<DataHandler>,
    slots: Mutex<Slots>,
    done: Condvar,
    stopping: AtomicBool,
    log: LogSink,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CompletionSink for Shared {
    fn complete(&self, slot: usize, status: TransferStatus, data: &[u8]) -> Disposition {
        let disposition = match status {
            TransferStatus::Completed => {
                let mut handler = self.handler.lock().unwrap_or_else(|e| e.into_inner());
                (*handler)(data);
                Disposition::Resubmit
            }
            status if status.is_transient() => {
                sink_debug!(self.log, "retrying transfer {}: status {:?}", slot, status);
                Disposition::Resubmit
            }
            _ => {
                sink_debug!(self.log, "not retrying transfer {}: status {:?}", slot, status);
                Disposition::Retire
            }
        };
        if self.stopping.load(Ordering::Acquire) {
            return Disposition::Retire;
        }
        disposition
    }

    fn retire(&self, slot: usize) {
        let mut slots = self.lock();
        match slots.active.get_mut(slot) {
            Some(active) if *active => {
                *active = false;
                slots.count -= 1;
            }
            _ => sink_error!(self.log, "transfer {} not found", slot),
        }
        self.done.notify_all();
    }

    fn resubmit_failed(&self, slot: usize, code: i32) {
        sink_error!(self.log, "failed re-submit of transfer {}: {} {}", slot, code, usb_error_name(code));
        self.retire(slot);
    }
}

/// Keeps a fixed number of bulk transfers in flight and feeds every completed
/// buffer to one handler.
pub struct TransferManager<E: BulkEndpoint> {
    endpoint: E,
    shared: Arc<Shared>,
    allocated: bool,
    log: LogSink,
}

impl<E: BulkEndpoint> TransferManager<E> {
    /// `handler` runs on the transport's event thread and must not block.
    pub fn new(endpoint: E, handler: DataHandler, log: LogSink) -> TransferManager<E> {
        let shared = Arc::new(Shared {
            handler: Mutex::new(handler),
            slots: Mutex::new(Slots::default()),
            done: Condvar::new(),
            stopping: AtomicBool::new(false),
            log: log.clone(),
        });
        TransferManager { endpoint, shared, allocated: false, log }
    }

    pub fn active_slots(&self) -> usize {
        self.shared.lock().count
    }

    /// Submits up to `count` transfers. True if at least one is in flight.
    pub fn start(&mut self, endpoint: u8, count: usize, size: usize, kind: TransferKind) -> bool {
        if kind != TransferKind::Bulk {
            sink_error!(self.log, "{:?} transfers are not supported", kind);
            return false;
        }
        if self.allocated {
            sink_warn!(self.log, "transfers already started on {:#04x}", endpoint);
            return self.active_slots() > 0;
        }

        if let Err(code) = self.endpoint.clear_halt(endpoint) {
            sink_debug!(self.log, "clear halt on {:#04x} failed: {}", endpoint, usb_error_name(code));
        }

        self.shared.stopping.store(false, Ordering::Release);
        *self.shared.lock() = Slots { active: vec![false; count], count: 0 };

        let sink: Arc<dyn CompletionSink> = self.shared.clone();
        if let Err(e) = self.endpoint.allocate(endpoint, count, size, sink) {
            sink_error!(self.log, "failed to allocate transfers: {}", e);
            return false;
        }
        self.allocated = true;

        for slot in 0..count {
            {
                let mut slots = self.shared.lock();
                slots.active[slot] = true;
                slots.count += 1;
            }
            if let Err(code) = self.endpoint.submit(slot) {
                // probably out of transfer resources; keep what is running
                sink_warn!(self.log, "failed to submit transfer {}: {} {}", slot, code, usb_error_name(code));
                let mut slots = self.shared.lock();
                slots.active[slot] = false;
                slots.count -= 1;
                break;
            }
        }

        let active = self.active_slots();
        sink_debug!(self.log, "started {} active transfers with {} bytes each on {:#04x}", active, size, endpoint);
        if active == 0 {
            self.endpoint.release();
            self.allocated = false;
        }
        active > 0
    }

    /// Cancels every transfer and blocks until all of them have completed.
    pub fn stop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        if !self.allocated {
            return;
        }

        let mut slots = self.shared.lock();
        while slots.count > 0 {
            let pending: Vec<usize> = slots
                .active
                .iter()
                .enumerate()
                .filter(|(_, active)| **active)
                .map(|(slot, _)| slot)
                .collect();
            drop(slots);

            for slot in pending {
                self.endpoint.cancel(slot);
            }

            slots = self.shared.lock();
            let (guard, _) = self
                .shared
                .done
                .wait_timeout_while(slots, CANCEL_RETRY, |s| s.count > 0)
                .unwrap_or_else(|e| e.into_inner());
            slots = guard;
        }
        drop(slots);

        self.endpoint.release();
        self.allocated = false;
        sink_debug!(self.log, "all transfers stopped");
    }
}

impl<E: BulkEndpoint> Drop for TransferManager<E> {
    fn drop(&mut self) {
        self.stop();
    }
}
