//! libusb-backed transport: context with its event thread, claimed device
//! handles and the bulk transfer pool behind [`BulkEndpoint`].

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use libusb1_sys::constants::*;
use libusb1_sys::*;

use crate::error::{usb_error_name, Error, Result};
use crate::logger::LogSink;
use crate::registers::ControlTransport;
use crate::transfer::{finish_completion, BulkEndpoint, CompletionSink};
use crate::usb_proto::{find_endpoint, DescriptorEndpoint, DescriptorTransferType, DeviceAddress, TransferStatus};

const EVENT_TICK: Duration = Duration::from_millis(25);

struct ContextPtr(*mut libusb_context);

// SAFETY: libusb contexts are thread safe; the pointer is only dereferenced by libusb.
unsafe impl Send for ContextPtr {}
unsafe impl Sync for ContextPtr {}

struct ContextInner {
    ctx: ContextPtr,
    exit_requested: Arc<AtomicBool>,
    event_thread: Option<JoinHandle<()>>,
    log: LogSink,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        sink_debug!(self.log, "shutting down usb context");
        self.exit_requested.store(true, Ordering::Release);
        if let Some(handle) = self.event_thread.take() {
            if handle.join().is_err() {
                sink_error!(self.log, "usb event thread panicked");
            }
        }
        // SAFETY: every device holds an Arc to us, so nothing uses the context anymore.
        unsafe { libusb_exit(self.ctx.0) };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: DeviceAddress,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// libusb context plus the thread that dispatches transfer completions.
#[derive(Clone)]
pub struct UsbContext {
    inner: Arc<ContextInner>,
}

impl UsbContext {
    pub fn new(log: LogSink) -> Result<UsbContext> {
        let mut ctx: *mut libusb_context = ptr::null_mut();
        // SAFETY: ctx is a valid out pointer.
        let ret = unsafe { libusb_init(&mut ctx) };
        if ret != LIBUSB_SUCCESS {
            sink_error!(log, "failed to init libusb context: {} {}", ret, usb_error_name(ret));
            return Err(Error::usb(ret, "failed to init libusb context"));
        }

        let exit_requested = Arc::new(AtomicBool::new(false));
        let thread_ctx = ContextPtr(ctx);
        let thread_exit = exit_requested.clone();
        let thread_log = log.clone();
        let spawned = thread::Builder::new()
            .name("pseye-usb-events".into())
            .spawn(move || run_event_loop(thread_ctx, &thread_exit, &thread_log));
        let event_thread = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                // SAFETY: the context was initialized above and is not shared yet.
                unsafe { libusb_exit(ctx) };
                return Err(Error::usb(LIBUSB_ERROR_OTHER, format!("failed to spawn usb event thread: {}", e)));
            }
        };

        Ok(UsbContext {
            inner: Arc::new(ContextInner {
                ctx: ContextPtr(ctx),
                exit_requested,
                event_thread: Some(event_thread),
                log,
            }),
        })
    }

    /// Calls `f` for every attached device.
    pub fn for_each_device(&self, mut f: impl FnMut(&DeviceInfo)) -> Result<()> {
        self.scan_devices(|_, info| {
            f(info);
            None::<()>
        })?;
        Ok(())
    }

    /// Opens the first device matching `vendor_id`/`product_id`. The
    /// interface is claimed separately with [`UsbDevice::claim`].
    pub fn open_device(&self, vendor_id: u16, product_id: u16, interface: u8) -> Result<UsbDevice> {
        let log = &self.inner.log;
        let opened = self.scan_devices(|dev, info| {
            if info.vendor_id != vendor_id || info.product_id != product_id {
                return None;
            }
            let mut handle: *mut libusb_device_handle = ptr::null_mut();
            // SAFETY: dev comes from the live device list.
            let ret = unsafe { libusb_open(dev, &mut handle) };
            if ret != LIBUSB_SUCCESS {
                sink_error!(log, "failed to open device {}: {} {}", info.address, ret, usb_error_name(ret));
                return Some(Err(Error::usb(ret, "failed to open USB device")));
            }
            Some(Ok((handle, info.address)))
        })?;

        match opened {
            Some(Ok((handle, address))) => {
                sink_debug!(log, "opened device {:04x}:{:04x} at {}", vendor_id, product_id, address);
                Ok(UsbDevice {
                    handle,
                    interface,
                    claimed: false,
                    address,
                    control_timeout: Duration::from_millis(1000),
                    log: log.clone(),
                    _context: self.inner.clone(),
                })
            }
            Some(Err(e)) => Err(e),
            None => Err(Error::usb(
                LIBUSB_ERROR_NOT_FOUND,
                format!("no device {:04x}:{:04x} attached", vendor_id, product_id),
            )),
        }
    }

    fn scan_devices<R>(&self, mut f: impl FnMut(*mut libusb_device, &DeviceInfo) -> Option<R>) -> Result<Option<R>> {
        let mut list: *const *mut libusb_device = ptr::null();
        // SAFETY: list is a valid out pointer; it is freed below.
        let count = unsafe { libusb_get_device_list(self.inner.ctx.0, &mut list) };
        if count < 0 {
            let code = count as i32;
            sink_error!(self.inner.log, "failed to enumerate USB devices: {} {}", code, usb_error_name(code));
            return Err(Error::usb(code, "failed to enumerate USB devices"));
        }

        let mut found = None;
        for i in 0..count as usize {
            // SAFETY: the list holds `count` valid device pointers.
            let dev = unsafe { *list.add(i) };
            let mut desc = std::mem::MaybeUninit::<libusb_device_descriptor>::uninit();
            // SAFETY: desc is written completely on success.
            let ret = unsafe { libusb_get_device_descriptor(dev, desc.as_mut_ptr()) };
            if ret != LIBUSB_SUCCESS {
                continue;
            }
            let desc = unsafe { desc.assume_init() };
            let info = DeviceInfo {
                // SAFETY: dev is valid while the list is alive.
                address: unsafe { DeviceAddress::new(libusb_get_bus_number(dev), libusb_get_device_address(dev)) },
                vendor_id: desc.idVendor,
                product_id: desc.idProduct,
            };
            if let Some(result) = f(dev, &info) {
                found = Some(result);
                break;
            }
        }

        // SAFETY: opened handles keep their own device reference.
        unsafe { libusb_free_device_list(list, 1) };
        Ok(found)
    }
}

fn run_event_loop(ctx: ContextPtr, exit_requested: &AtomicBool, log: &LogSink) {
    sink_debug!(log, "entering usb context event loop");
    let tv = libc::timeval { tv_sec: 0, tv_usec: EVENT_TICK.as_micros() as libc::suseconds_t };
    while !exit_requested.load(Ordering::Acquire) {
        // SAFETY: the context outlives this thread, see ContextInner::drop.
        let ret = unsafe { libusb_handle_events_timeout_completed(ctx.0, &tv, ptr::null_mut()) };
        if ret != LIBUSB_SUCCESS && ret != LIBUSB_ERROR_INTERRUPTED {
            sink_trace!(log, "handle events: {}", usb_error_name(ret));
        }
    }
    sink_debug!(log, "exiting usb context event loop");
}

/// An open device handle paired with the interface it claims.
pub struct UsbDevice {
    handle: *mut libusb_device_handle,
    interface: u8,
    claimed: bool,
    address: DeviceAddress,
    control_timeout: Duration,
    log: LogSink,
    _context: Arc<ContextInner>,
}

// SAFETY: libusb device handles may be used from any thread.
unsafe impl Send for UsbDevice {}
unsafe impl Sync for UsbDevice {}

impl UsbDevice {
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    pub fn set_control_timeout(&mut self, timeout: Duration) {
        self.control_timeout = timeout;
    }

    /// Detaches kernel drivers and claims the interface.
    pub fn claim(&mut self) -> Result<()> {
        if self.claimed {
            return Ok(());
        }
        let iface = self.interface as i32;
        // SAFETY: the handle is open for the lifetime of self.
        let ret = unsafe { libusb_detach_kernel_driver(self.handle, iface) };
        if ret != LIBUSB_SUCCESS && ret != LIBUSB_ERROR_NOT_FOUND && ret != LIBUSB_ERROR_NOT_SUPPORTED {
            sink_error!(self.log, "failed to detach drivers for interface {}: {} {}", iface, ret, usb_error_name(ret));
            return Err(Error::usb(ret, "failed to detach kernel drivers"));
        }

        sink_debug!(self.log, "claiming interface {}", iface);
        let ret = unsafe { libusb_claim_interface(self.handle, iface) };
        if ret != LIBUSB_SUCCESS {
            unsafe { libusb_attach_kernel_driver(self.handle, iface) };
            sink_error!(self.log, "failed to claim interface {}: {} {}", iface, ret, usb_error_name(ret));
            return Err(Error::usb(ret, "failed to claim interface"));
        }
        self.claimed = true;
        Ok(())
    }

    /// Endpoints of the claimed interface in the active configuration.
    pub fn endpoints(&self) -> Result<Vec<DescriptorEndpoint>> {
        let mut config: *const libusb_config_descriptor = ptr::null();
        // SAFETY: the device outlives its open handle; config is freed below.
        let ret = unsafe { libusb_get_active_config_descriptor(libusb_get_device(self.handle), &mut config) };
        if ret != LIBUSB_SUCCESS {
            sink_error!(self.log, "failed to query active config: {} {}", ret, usb_error_name(ret));
            return Err(Error::usb(ret, "failed to query active config"));
        }
        // SAFETY: libusb returned a valid descriptor tree.
        let endpoints = unsafe { interface_endpoints(&*config, self.interface) };
        unsafe { libusb_free_config_descriptor(config) };
        Ok(endpoints)
    }

    pub fn find_endpoint(&self, kind: DescriptorTransferType) -> Result<DescriptorEndpoint> {
        let endpoints = self.endpoints()?;
        let bulk = find_endpoint(&endpoints, DescriptorTransferType::Bulk);
        let iso = find_endpoint(&endpoints, DescriptorTransferType::Isochronous);
        sink_debug!(
            self.log,
            "active endpoints: iso {} bulk {}",
            iso.map_or(-1, |ep| ep.b_endpoint_address as i32),
            bulk.map_or(-1, |ep| ep.b_endpoint_address as i32)
        );
        find_endpoint(&endpoints, kind)
            .ok_or_else(|| Error::usb(LIBUSB_ERROR_NOT_FOUND, format!("failed to find required {:?} endpoint", kind)))
    }
}

impl ControlTransport for UsbDevice {
    fn control_transfer(&self, request_type: u8, request: u8, value: u16, index: u16, data: &mut [u8]) -> std::result::Result<usize, i32> {
        let timeout = self.control_timeout.as_millis().min(u32::MAX as u128) as u32;
        // SAFETY: data is valid for data.len() bytes for the duration of the call.
        let ret = unsafe {
            libusb_control_transfer(
                self.handle,
                request_type,
                request,
                value,
                index,
                data.as_mut_ptr(),
                data.len() as u16,
                timeout,
            )
        };
        if ret < 0 { Err(ret) } else { Ok(ret as usize) }
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        sink_debug!(self.log, "freeing device {} {}", self.address, self.interface);
        let iface = self.interface as i32;
        if self.claimed {
            // SAFETY: the handle is still open.
            let ret = unsafe { libusb_release_interface(self.handle, iface) };
            if ret == LIBUSB_SUCCESS {
                let ret = unsafe { libusb_attach_kernel_driver(self.handle, iface) };
                if ret == LIBUSB_SUCCESS {
                    sink_debug!(self.log, "re-attached kernel driver to interface {}", iface);
                } else if ret != LIBUSB_ERROR_NOT_FOUND && ret != LIBUSB_ERROR_NOT_SUPPORTED {
                    sink_error!(
                        self.log,
                        "failed to re-attach kernel driver to interface {}: {} {}",
                        iface,
                        ret,
                        usb_error_name(ret)
                    );
                }
            } else {
                sink_error!(self.log, "failed to unclaim interface {}: {} {}", iface, ret, usb_error_name(ret));
            }
        }
        unsafe { libusb_close(self.handle) };
    }
}

pub fn endpoint_from_raw(raw: &libusb_endpoint_descriptor) -> DescriptorEndpoint {
    DescriptorEndpoint {
        b_endpoint_address: raw.bEndpointAddress,
        bm_attributes: raw.bmAttributes,
        w_max_packet_size: raw.wMaxPacketSize,
        b_interval: raw.bInterval,
    }
}

/// Collects the endpoints of every alternate setting of `interface`.
///
/// # Safety
/// `config` must be a well-formed descriptor tree as returned by libusb.
pub unsafe fn interface_endpoints(config: &libusb_config_descriptor, interface: u8) -> Vec<DescriptorEndpoint> {
    let mut out = Vec::new();
    for i in 0..config.bNumInterfaces as usize {
        let iface = &*config.interface.add(i);
        for a in 0..iface.num_altsetting.max(0) as usize {
            let alt = &*iface.altsetting.add(a);
            if alt.bInterfaceNumber != interface {
                continue;
            }
            for e in 0..alt.bNumEndpoints as usize {
                out.push(endpoint_from_raw(&*alt.endpoint.add(e)));
            }
        }
    }
    out
}

struct SlotContext {
    sink: Arc<dyn CompletionSink>,
    slot: usize,
    log: LogSink,
}

/// Bulk transfers for one device, all backed by a single arena.
pub struct LibusbBulkEndpoint {
    device: Arc<UsbDevice>,
    transfers: Vec<*mut libusb_transfer>,
    contexts: Vec<Box<SlotContext>>,
    arena: Box<[u8]>,
    log: LogSink,
}

// SAFETY: the raw transfers are only touched through &mut self or by libusb's
// event thread while in flight.
unsafe impl Send for LibusbBulkEndpoint {}

impl LibusbBulkEndpoint {
    pub fn new(device: Arc<UsbDevice>, log: LogSink) -> LibusbBulkEndpoint {
        LibusbBulkEndpoint {
            device,
            transfers: Vec::new(),
            contexts: Vec::new(),
            arena: Box::new([]),
            log,
        }
    }
}

extern "system" fn transfer_callback(transfer: *mut libusb_transfer) {
    // SAFETY: libusb hands back a transfer we allocated and filled; user_data
    // points at its SlotContext and buffer at its arena region, both alive
    // until release(), which only runs once nothing is in flight.
    let (ctx, status, num_iso_packets, data) = unsafe {
        let t = &*transfer;
        let ctx = &*(t.user_data as *const SlotContext);
        let data = std::slice::from_raw_parts(t.buffer, t.actual_length.max(0) as usize);
        (ctx, t.status, t.num_iso_packets, data)
    };

    if num_iso_packets != 0 {
        sink_error!(ctx.log, "completed isochronous transfer with {} bytes", data.len());
        ctx.sink.retire(ctx.slot);
        return;
    }

    finish_completion(ctx.sink.as_ref(), ctx.slot, TransferStatus::from_raw(status), data, || {
        // SAFETY: the transfer is owned by libusb again only after this call succeeds.
        let ret = unsafe { libusb_submit_transfer(transfer) };
        if ret == LIBUSB_SUCCESS { Ok(()) } else { Err(ret) }
    });
}

impl BulkEndpoint for LibusbBulkEndpoint {
    fn clear_halt(&mut self, endpoint: u8) -> std::result::Result<(), i32> {
        // SAFETY: the handle is open.
        let ret = unsafe { libusb_clear_halt(self.device.handle, endpoint) };
        if ret == LIBUSB_SUCCESS { Ok(()) } else { Err(ret) }
    }

    fn allocate(&mut self, endpoint: u8, count: usize, size: usize, sink: Arc<dyn CompletionSink>) -> Result<()> {
        self.release();
        let length = i32::try_from(size).map_err(|_| Error::usb(LIBUSB_ERROR_INVALID_PARAM, "transfer size too large"))?;

        self.arena = vec![0u8; count * size].into_boxed_slice();
        for slot in 0..count {
            // SAFETY: zero iso packets; checked for null below.
            let transfer = unsafe { libusb_alloc_transfer(0) };
            if transfer.is_null() {
                self.release();
                return Err(Error::usb(LIBUSB_ERROR_NO_MEM, "failed to allocate transfer"));
            }
            let context = Box::new(SlotContext { sink: sink.clone(), slot, log: self.log.clone() });
            // SAFETY: freshly allocated transfer, the arena region is `size` bytes.
            unsafe {
                let t = &mut *transfer;
                t.dev_handle = self.device.handle;
                t.endpoint = endpoint;
                t.transfer_type = LIBUSB_TRANSFER_TYPE_BULK;
                t.timeout = 0;
                t.length = length;
                t.callback = transfer_callback;
                t.user_data = &*context as *const SlotContext as *mut c_void;
                t.buffer = self.arena.as_mut_ptr().add(slot * size);
            }
            self.transfers.push(transfer);
            self.contexts.push(context);
        }
        sink_trace!(self.log, "allocated {} transfers of {} bytes on {:#04x}", count, size, endpoint);
        Ok(())
    }

    fn submit(&mut self, slot: usize) -> std::result::Result<(), i32> {
        let transfer = *self.transfers.get(slot).ok_or(LIBUSB_ERROR_NOT_FOUND)?;
        // SAFETY: the transfer was filled by allocate.
        let ret = unsafe { libusb_submit_transfer(transfer) };
        if ret == LIBUSB_SUCCESS { Ok(()) } else { Err(ret) }
    }

    fn cancel(&mut self, slot: usize) {
        if let Some(&transfer) = self.transfers.get(slot) {
            // SAFETY: cancelling an idle or finished transfer only returns an error.
            let ret = unsafe { libusb_cancel_transfer(transfer) };
            if ret != LIBUSB_SUCCESS && ret != LIBUSB_ERROR_NOT_FOUND {
                sink_debug!(self.log, "cancel transfer {}: {}", slot, usb_error_name(ret));
            }
        }
    }

    fn release(&mut self) {
        for transfer in self.transfers.drain(..) {
            // SAFETY: nothing is in flight when release is called.
            unsafe { libusb_free_transfer(transfer) };
        }
        self.contexts.clear();
        self.arena = Box::new([]);
    }
}

impl Drop for LibusbBulkEndpoint {
    fn drop(&mut self) {
        self.release();
    }
}
