//! Glue for host capture frameworks: format mapping, the advertised mode list
//! and a per-sample tick that keeps the camera in step with the host.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context};

use crate::camera::{Camera, PsEyeCamera};
use crate::config::StreamConfig;
use crate::device_state::{DeviceState, SizeMode};
use crate::logger::LogSink;
use crate::pixel_format::{convert, PixelFormat};
use crate::registers::ControlTransport;
use crate::transfer::BulkEndpoint;
use crate::usb_context::{LibusbBulkEndpoint, UsbContext, UsbDevice};

/// Reference time units per second (100 ns ticks).
pub const ONE_SECOND_100NS: u64 = 10_000_000;

pub const VGA_FRAME_RATES: &[u32] = &[75, 60, 50, 40, 30, 15];
pub const QVGA_FRAME_RATES: &[u32] = &[187, 150, 137, 125, 100, 75, 60, 50, 37, 30];

/// Formats offered to the host; the first one is the default.
pub const SUPPORTED_FORMATS: &[HostVideoFormat] = &[HostVideoFormat::Xrgb, HostVideoFormat::Yuy2, HostVideoFormat::Uyvy];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostVideoFormat {
    Any,
    Unknown,
    Argb,
    /// 32 bit RGB, alpha always 255
    Xrgb,
    Rgb24,
    I420,
    Nv12,
    Yv12,
    Y800,
    P010,
    Yvyu,
    Yuy2,
    Uyvy,
    Hdyc,
    Mjpeg,
    H264,
    Hevc,
}

impl HostVideoFormat {
    pub fn pixel_format(&self) -> anyhow::Result<PixelFormat> {
        match self {
            HostVideoFormat::Argb | HostVideoFormat::Xrgb => Ok(PixelFormat::Bgra32),
            HostVideoFormat::Rgb24 => Ok(PixelFormat::Bgr24),
            HostVideoFormat::Yuy2 => Ok(PixelFormat::Yuyv),
            HostVideoFormat::Uyvy => Ok(PixelFormat::Uyvy),
            other => Err(anyhow!("invalid host video format {:?}", other)),
        }
    }
}

/// Output geometry, format and frame interval requested by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostMode {
    pub format: HostVideoFormat,
    pub width: u32,
    pub height: u32,
    /// Frame interval in 100 ns units.
    pub interval: u64,
}

impl HostMode {
    pub fn new(format: HostVideoFormat, width: u32, height: u32, fps: u32) -> HostMode {
        HostMode { format, width, height, interval: ONE_SECOND_100NS / fps.max(1) as u64 }
    }

    pub fn fps(&self) -> u32 {
        ONE_SECOND_100NS
            .checked_div(self.interval)
            .unwrap_or(u64::MAX)
            .min(u32::MAX as u64) as u32
    }

    pub fn size_mode(&self) -> SizeMode {
        SizeMode::from_width(self.width)
    }

    fn geometry(&self) -> (u32, u32, u64) {
        (self.width, self.height, self.interval)
    }
}

/// Every mode the camera advertises, VGA first.
pub fn advertised_modes() -> Vec<HostMode> {
    let vga = VGA_FRAME_RATES.iter().flat_map(|fps| {
        SUPPORTED_FORMATS.iter().map(move |fmt| HostMode::new(*fmt, 640, 480, *fps))
    });
    let qvga = QVGA_FRAME_RATES.iter().flat_map(|fps| {
        SUPPORTED_FORMATS.iter().map(move |fmt| HostMode::new(*fmt, 320, 240, *fps))
    });
    vga.chain(qvga).collect()
}

/// Host RGB buffers are bottom-up, so demosaiced RGB output is written flipped.
pub fn needs_vertical_flip(native: PixelFormat, output: PixelFormat) -> bool {
    output.is_rgb_family() && native == PixelFormat::Bayer8
}

/// Time source for sample timestamps, in 100 ns units.
pub trait ReferenceClock: Send {
    /// `None` when the clock cannot be read right now.
    fn now(&self) -> Option<u64>;
}

pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock::new()
    }
}

impl ReferenceClock for MonotonicClock {
    fn now(&self) -> Option<u64> {
        Some((self.origin.elapsed().as_nanos() / 100) as u64)
    }
}

/// Presentation window of one delivered sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub start: u64,
    pub end: u64,
}

pub type CameraOpener<C, E> = Box<dyn FnMut() -> crate::Result<Camera<C, E>> + Send>;

/// Drives one camera from a host's sample loop.
pub struct CaptureSession<C: ControlTransport, E: BulkEndpoint> {
    opener: CameraOpener<C, E>,
    camera: Option<Camera<C, E>>,
    active: Arc<AtomicBool>,
    was_active: bool,
    current: Option<(u32, u32, u64)>,
    filter_time: u64,
    config: StreamConfig,
    log: LogSink,
}

impl CaptureSession<Arc<UsbDevice>, LibusbBulkEndpoint> {
    /// Session that opens the first attached PlayStation Eye on demand.
    pub fn for_hardware(
        context: UsbContext,
        config: StreamConfig,
        clock: Option<&dyn ReferenceClock>,
        log: LogSink,
    ) -> CaptureSession<Arc<UsbDevice>, LibusbBulkEndpoint> {
        let opener_config = config.clone();
        let opener_log = log.clone();
        let opener: CameraOpener<Arc<UsbDevice>, LibusbBulkEndpoint> = Box::new(move || -> crate::Result<PsEyeCamera> {
            Camera::open(&context, DeviceState::default(), opener_config.clone(), opener_log.clone())
        });
        CaptureSession::new(opener, config, clock, log)
    }
}

impl<C: ControlTransport, E: BulkEndpoint> CaptureSession<C, E> {
    /// Timestamps start at `clock`, or at a fresh monotonic clock when the
    /// host has none or it cannot be read.
    pub fn new(opener: CameraOpener<C, E>, config: StreamConfig, clock: Option<&dyn ReferenceClock>, log: LogSink) -> Self {
        let filter_time = clock
            .and_then(|c| c.now())
            .or_else(|| MonotonicClock::new().now())
            .unwrap_or(0);
        CaptureSession {
            opener,
            camera: None,
            active: Arc::new(AtomicBool::new(false)),
            was_active: false,
            current: None,
            filter_time,
            config,
            log,
        }
    }

    /// Flag the host flips on run and off on pause/stop, from any thread.
    pub fn activity(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn camera(&self) -> Option<&Camera<C, E>> {
        self.camera.as_ref()
    }

    fn ensure_started(&mut self, mode: &HostMode) -> anyhow::Result<()> {
        let camera = match self.camera.take() {
            Some(camera) => camera,
            None => (self.opener)().context("cannot find/create USB device")?,
        };
        let camera = self.camera.insert(camera);

        if !camera.is_streaming() {
            camera
                .start(mode.size_mode(), mode.fps(), PixelFormat::Bayer8)
                .with_context(|| {
                    format!("failed to start camera with: w {} h {} fps {}", mode.width, mode.height, mode.fps())
                })?;
            let state = camera.current_state();
            sink_debug!(self.log, "started camera with: w {} h {} fps {}", state.width(), state.height(), state.rate);
        }
        self.current = Some(mode.geometry());
        Ok(())
    }

    /// Handles one output sample. Follows activity changes and mode changes,
    /// then waits for a frame and converts it into `output`.
    ///
    /// Returns `None` when inactive or when the session was deactivated
    /// before a frame arrived.
    pub fn tick(&mut self, mode: &HostMode, output: &mut [u8]) -> anyhow::Result<Option<Sample>> {
        let start = self.filter_time;
        self.filter_time += mode.interval;

        let active = self.active.load(Ordering::Acquire);
        let was_active = std::mem::replace(&mut self.was_active, active);
        if !was_active && active {
            self.ensure_started(mode)?;
        } else if was_active && !active {
            sink_debug!(self.log, "actually stopping device {}", self.camera.is_some());
            if let Some(camera) = self.camera.as_mut() {
                camera.stop();
            }
            self.current = None;
        }

        if !active {
            return Ok(None);
        }

        // a failed restart leaves the camera idle, so retry even if the mode is unchanged
        let stalled = self.camera.as_ref().map_or(false, |c| !c.is_streaming());
        if stalled || self.current != Some(mode.geometry()) {
            self.current = None;
            if let Some(camera) = self.camera.as_mut() {
                camera.stop();
            }
            self.ensure_started(mode)?;
        }

        let out_fmt = mode.format.pixel_format()?;
        let needed = out_fmt.size_bytes(mode.width as usize, mode.height as usize);
        if output.len() < needed {
            bail!("sample buffer holds {} bytes, {:?} {}x{} needs {}", output.len(), out_fmt, mode.width, mode.height, needed);
        }

        let camera = match self.camera.as_mut() {
            Some(camera) => camera,
            None => return Ok(None),
        };
        let native = camera.current_state().format;
        let flip = needs_vertical_flip(native, out_fmt);

        // wait in slices so a pause is noticed while no frames arrive
        loop {
            if let Some(frame) = camera.wait_frame_for(self.config.frame_wait) {
                let converted = convert(native, out_fmt, frame, &mut output[..needed], mode.width, mode.height, flip);
                camera.release_frame();
                converted.context("failed to convert frame")?;
                return Ok(Some(Sample { start, end: start + mode.interval }));
            }
            if !self.active.load(Ordering::Acquire) || !camera.is_streaming() {
                return Ok(None);
            }
        }
    }

    /// Stops the camera, if one was opened.
    pub fn shutdown(&mut self) {
        if let Some(camera) = self.camera.as_mut() {
            camera.stop();
        }
        self.was_active = false;
        self.current = None;
    }
}

impl<C: ControlTransport, E: BulkEndpoint> Drop for CaptureSession<C, E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
