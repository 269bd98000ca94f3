//! Device orchestration: bring-up, stream start/stop and frame delivery.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::config::StreamConfig;
use crate::device_state::{self, find_valid_frame_rate, set_camera_led_status, DeviceState, SizeMode};
use crate::error::{Error, Result};
use crate::frame_ring::{FrameConsumer, FrameProducer, FrameRing};
use crate::logger::LogSink;
use crate::ov534_proto::{self, *};
use crate::ov7725_proto::{self, *};
use crate::pixel_format::PixelFormat;
use crate::registers::{ControlTransport, Registers};
use crate::transfer::{BulkEndpoint, DataHandler, TransferKind, TransferManager};
use crate::usb_context::{LibusbBulkEndpoint, UsbContext, UsbDevice};
use crate::usb_proto::DescriptorTransferType;
use crate::uvc_proto::{AssemblerStatus, FrameAssembler};
use crate::{PSEYE_INTERFACE, PSEYE_PID, PSEYE_VID};

/// Reassembly state living on the transfer completion path.
struct Pipeline {
    assembler: FrameAssembler,
    producer: FrameProducer,
    payload_size: usize,
    bound: bool,
}

impl Pipeline {
    /// Splits one transfer into payload chunks and feeds them to the assembler.
    fn process(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let n = self.payload_size.min(data.len());
            let payload = &data[..n];
            let frame = if self.bound { Some(self.producer.writable_slot()) } else { None };
            match self.assembler.put(payload, frame) {
                AssemblerStatus::NeedData => data = &data[n..],
                AssemblerStatus::NeedBuffer if self.bound => {
                    // a bound slot that still reads as empty can never take data
                    data = &data[n..];
                }
                AssemblerStatus::NeedBuffer => self.bound = true,
                AssemblerStatus::FrameComplete => {
                    self.producer.finish_writing();
                    self.bound = true;
                    data = &data[n..];
                }
            }
        }
    }
}

type SharedPipeline = Arc<Mutex<Option<Pipeline>>>;

/// A PlayStation Eye over any control/bulk transport.
pub struct Camera<C: ControlTransport, E: BulkEndpoint> {
    regs: Registers<C>,
    bulk_endpoint: u8,
    transfers: TransferManager<E>,
    pipeline: SharedPipeline,
    consumer: Option<FrameConsumer>,
    state: DeviceState,
    config: StreamConfig,
    sensor_id: u16,
    streaming: bool,
    log: LogSink,
}

pub type PsEyeCamera = Camera<Arc<UsbDevice>, LibusbBulkEndpoint>;

impl Camera<Arc<UsbDevice>, LibusbBulkEndpoint> {
    /// Opens and initializes the first attached PlayStation Eye.
    pub fn open(context: &UsbContext, state: DeviceState, config: StreamConfig, log: LogSink) -> Result<PsEyeCamera> {
        let mut device = context.open_device(PSEYE_VID, PSEYE_PID, PSEYE_INTERFACE)?;
        device.set_control_timeout(config.control_timeout);
        device.claim()?;
        let endpoint = device.find_endpoint(DescriptorTransferType::Bulk)?;
        sink_debug!(log, "using {}", endpoint);

        let device = Arc::new(device);
        let bulk = LibusbBulkEndpoint::new(device.clone(), log.clone());
        Camera::new(device, endpoint.b_endpoint_address, bulk, state, config, log)
    }
}

impl<C: ControlTransport, E: BulkEndpoint> Camera<C, E> {
    /// Wraps an already claimed device and runs the bring-up sequence.
    pub fn new(
        control: C,
        bulk_endpoint: u8,
        bulk: E,
        state: DeviceState,
        config: StreamConfig,
        log: LogSink,
    ) -> Result<Camera<C, E>> {
        let pipeline: SharedPipeline = Arc::new(Mutex::new(None));
        let handler_pipeline = pipeline.clone();
        let handler: DataHandler = Box::new(move |data: &[u8]| {
            let mut guard = handler_pipeline.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(pipeline) = guard.as_mut() {
                pipeline.process(data);
            }
        });

        let mut camera = Camera {
            regs: Registers::new(control, &config, log.clone()),
            bulk_endpoint,
            transfers: TransferManager::new(bulk, handler, log.clone()),
            pipeline,
            consumer: None,
            state,
            config,
            sensor_id: 0,
            streaming: false,
            log,
        };
        camera.initialize()?;
        Ok(camera)
    }

    fn settle(&self) {
        if !self.config.settle_delay.is_zero() {
            thread::sleep(self.config.settle_delay);
        }
    }

    fn initialize(&mut self) -> Result<()> {
        // reset camera bridge
        self.regs.write_bridge(BridgeReg::SysCtrl, RESET_SYS_CTRL)?;
        self.regs.write_bridge(BridgeReg::Reset0, RESET0_VFIFO)?;
        self.settle();

        // point the SCCB master at the sensor, then reset it
        self.regs.write_bridge(BridgeReg::MsId, SENSOR_SCCB_ID)?;
        self.regs.write_sensor(SensorReg::Com7, COM7_SCCB_RESET)?;
        self.settle();

        let pid = self.regs.read_sensor(SensorReg::Pid)?;
        let ver = self.regs.read_sensor(SensorReg::Ver)?;
        self.sensor_id = (pid as u16) << 8 | ver as u16;
        sink_info!(self.log, "Sensor ID: OV{:04x}", self.sensor_id);

        self.regs.write_bridge_seq(ov534_proto::INITIALIZATION_DATA)?;
        self.regs.write_sensor_seq(ov7725_proto::INITIALIZATION_DATA)?;
        self.regs.write_bridge(BridgeReg::Reset0, RESET0_CIF | RESET0_VFIFO)
    }

    fn lock_pipeline(&self) -> MutexGuard<'_, Option<Pipeline>> {
        self.pipeline.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Configures the sensor for `mode` and `format` and starts streaming.
    ///
    /// `frame_rate` is resolved to the closest supported rate not above it.
    pub fn start(&mut self, mode: SizeMode, frame_rate: u32, format: PixelFormat) -> Result<()> {
        if self.streaming {
            return Err(Error::Streaming);
        }

        let mut state = self.state;
        state.mode = mode;
        state.rate = find_valid_frame_rate(mode, frame_rate);
        state.format = format;

        let (video_format, dsp_ctrl4) = match format {
            PixelFormat::Bayer8 => (VideoFormat::Raw8, DSP_CTRL4_OUTPUT_RAW8),
            PixelFormat::Bayer10 => (VideoFormat::Raw10, DSP_CTRL4_OUTPUT_RAW10),
            other => return Err(Error::UnsupportedFormat(other)),
        };
        let frame_size = state.frame_size();

        if let Err(e) = self.program_stream(&state, video_format, dsp_ctrl4, frame_size) {
            sink_error!(self.log, "failed to configure stream: {}", e);
            self.quiesce();
            return Err(e);
        }
        self.state = state;

        let (producer, consumer) = FrameRing::new(self.config.ring_frames, frame_size, self.log.clone());
        *self.lock_pipeline() = Some(Pipeline {
            assembler: FrameAssembler::new(self.log.clone()),
            producer,
            payload_size: self.config.payload_size,
            bound: false,
        });
        self.consumer = Some(consumer);

        let started = self.transfers.start(
            self.bulk_endpoint,
            self.config.transfer_count,
            self.config.transfer_size,
            TransferKind::Bulk,
        );
        if !started {
            *self.lock_pipeline() = None;
            self.consumer = None;
            self.quiesce();
            return Err(Error::NoTransfers { endpoint: self.bulk_endpoint });
        }

        self.streaming = true;
        sink_info!(
            self.log,
            "streaming {:?} {}x{} at {} fps",
            format,
            self.state.width(),
            self.state.height(),
            self.state.rate
        );
        Ok(())
    }

    fn program_stream(
        &self,
        state: &DeviceState,
        video_format: VideoFormat,
        dsp_ctrl4: u8,
        frame_size: usize,
    ) -> Result<()> {
        let payload_size = self.config.payload_size;
        let video_cfg = VideoDataConfig::new(
            video_format,
            VideoTransfer::Bulk,
            (payload_size / 4) as u16,
            (frame_size / 4) as u32,
        );
        sink_debug!(self.log, "setting: payload size {} frame size {}", payload_size, frame_size);
        self.regs.write_video_data(&video_cfg.to_bytes(), 0)?;

        let mut com7 = COM7_OFMT_PROCESSED_BAYER;
        match state.mode {
            SizeMode::Vga => {
                self.regs.write_bridge_seq(ov534_proto::START_VGA)?;
                self.regs.write_sensor_seq(ov7725_proto::START_VGA)?;
                com7 |= COM7_RES_VGA;
            }
            SizeMode::Qvga => {
                self.regs.write_bridge_seq(ov534_proto::START_QVGA)?;
                self.regs.write_sensor_seq(ov7725_proto::START_QVGA)?;
                com7 |= COM7_RES_QVGA;
            }
        }
        self.regs.write_sensor(SensorReg::DspCtrl4, dsp_ctrl4)?;
        self.regs.write_sensor(SensorReg::Com7, com7)?;

        device_state::apply_state(&self.regs, state)?;
        set_camera_led_status(&self.regs, true)?;
        self.regs.write_bridge(BridgeReg::Reset0, 0x00)
    }

    /// Best-effort return to the stopped register state.
    fn quiesce(&self) {
        if let Err(e) = self.regs.write_bridge(BridgeReg::Reset0, RESET0_CIF | RESET0_VFIFO) {
            sink_warn!(self.log, "failed to reset bridge: {}", e);
        }
        if let Err(e) = set_camera_led_status(&self.regs, false) {
            sink_warn!(self.log, "failed to turn off LED: {}", e);
        }
    }

    /// Stops streaming and drains every transfer. Does nothing when idle.
    pub fn stop(&mut self) {
        if !self.streaming {
            return;
        }
        self.quiesce();
        self.transfers.stop();
        *self.lock_pipeline() = None;
        self.consumer = None;
        self.streaming = false;
        sink_debug!(self.log, "stream stopped");
    }

    /// Replaces the device state. While streaming the controls are pushed
    /// immediately; resolution and format changes need a stopped stream.
    pub fn apply_state(&mut self, state: DeviceState) -> Result<()> {
        let mut state = state;
        state.rate = find_valid_frame_rate(state.mode, state.rate);
        if self.streaming {
            if self.state.needs_restart(&state) {
                return Err(Error::Streaming);
            }
            device_state::apply_state(&self.regs, &state)?;
        }
        self.state = state;
        Ok(())
    }

    /// Blocks for the next frame. `None` when not streaming.
    pub fn wait_frame(&self) -> Option<&[u8]> {
        if !self.streaming {
            return None;
        }
        self.consumer.as_ref().map(|c| c.readable_slot_wait())
    }

    pub fn wait_frame_for(&self, timeout: Duration) -> Option<&[u8]> {
        if !self.streaming {
            return None;
        }
        self.consumer.as_ref().and_then(|c| c.readable_slot_wait_for(timeout))
    }

    /// Hands the frame returned by the last wait back to the producer.
    pub fn release_frame(&mut self) {
        if let Some(consumer) = self.consumer.as_mut() {
            consumer.finish_reading();
        }
    }

    /// Frames dropped because the consumer fell behind.
    pub fn frames_dropped(&self) -> usize {
        self.consumer.as_ref().map_or(0, |c| c.frames_dropped())
    }

    pub fn frame_size(&self) -> usize {
        self.state.frame_size()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn current_state(&self) -> &DeviceState {
        &self.state
    }

    pub fn sensor_id(&self) -> u16 {
        self.sensor_id
    }

    pub fn registers(&self) -> &Registers<C> {
        &self.regs
    }
}

impl<C: ControlTransport, E: BulkEndpoint> Drop for Camera<C, E> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::setup_logger;
    use crate::testing::{CaptureLog, MockBulk, MockControl};
    use crate::usb_proto::TransferStatus;
    use crate::uvc_proto::UvcPayloadHeader;

    const EP: u8 = 0x81;

    fn setup() -> (Arc<MockControl>, MockBulk, Camera<Arc<MockControl>, MockBulk>) {
        setup_logger();
        let mock = Arc::new(MockControl::new());
        let bulk = MockBulk::new();
        let camera = Camera::new(
            mock.clone(),
            EP,
            bulk.clone(),
            DeviceState::default(),
            StreamConfig::immediate(),
            LogSink::global(),
        )
        .unwrap();
        (mock, bulk, camera)
    }

    /// Wraps `frame` into payload chunks the way the bridge sends them.
    fn chunked(frame: &[u8], payload_size: usize, pts: u32, fid: bool) -> Vec<Vec<u8>> {
        let room = payload_size - UvcPayloadHeader::size();
        let count = frame.chunks(room).count();
        frame
            .chunks(room)
            .enumerate()
            .map(|(i, part)| UvcPayloadHeader::new(i + 1 == count, fid, pts).chunk(part))
            .collect()
    }

    fn test_frame(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn bring_up_identifies_sensor() {
        setup_logger();
        let capture = Arc::new(CaptureLog::default());
        let mock = Arc::new(MockControl::new());
        let camera = Camera::new(
            mock.clone(),
            EP,
            MockBulk::new(),
            DeviceState::default(),
            StreamConfig::immediate(),
            LogSink::new(capture.clone()),
        )
        .unwrap();

        assert_eq!(camera.sensor_id(), 0x7721);
        assert!(capture.contains("Sensor ID: OV7721"));
        assert_eq!(mock.bridge(BridgeReg::MsId), SENSOR_SCCB_ID);
        assert_eq!(mock.bridge(BridgeReg::Reset0), RESET0_CIF | RESET0_VFIFO);
        assert!(!camera.is_streaming());
    }

    #[test]
    fn bring_up_fails_on_dead_bridge() {
        setup_logger();
        let mock = Arc::new(MockControl::new());
        mock.fail_bridge_with(Err(-4));
        let result = Camera::new(
            mock,
            EP,
            MockBulk::new(),
            DeviceState::default(),
            StreamConfig::immediate(),
            LogSink::global(),
        );
        assert_eq!(result.err().and_then(|e| e.usb_code()), Some(-4));
    }

    #[test]
    fn streams_frames_from_bulk_transfers() {
        let (mock, bulk, mut camera) = setup();
        camera.start(SizeMode::Qvga, 35, PixelFormat::Bayer8).unwrap();

        assert!(camera.is_streaming());
        assert_eq!(camera.current_state().rate, 30);
        assert_eq!(camera.frame_size(), 320 * 240);
        assert_eq!(mock.bridge(BridgeReg::Reset0), 0);
        assert_eq!(mock.bridge(BridgeReg::GpioV0), GPIO_LED);
        assert_eq!(mock.sensor(SensorReg::DspCtrl4), DSP_CTRL4_OUTPUT_RAW8);
        assert_eq!(mock.sensor(SensorReg::Com7), COM7_RES_QVGA | COM7_OFMT_PROCESSED_BAYER);
        assert_eq!(bulk.in_flight().len(), 5);

        // one frame split over two transfers
        let frame = test_frame(camera.frame_size());
        let chunks = chunked(&frame, 2048, 1234, true);
        let (first, second) = chunks.split_at(chunks.len() / 2);
        bulk.deliver(0, TransferStatus::Completed, &first.concat());
        assert_eq!(camera.wait_frame_for(Duration::from_millis(1)), None);
        bulk.deliver(1, TransferStatus::Completed, &second.concat());

        assert_eq!(camera.wait_frame_for(Duration::from_secs(1)), Some(&frame[..]));
        camera.release_frame();
        assert_eq!(camera.wait_frame_for(Duration::from_millis(1)), None);

        camera.stop();
        assert!(!camera.is_streaming());
        assert!(bulk.in_flight().is_empty());
        assert_eq!(bulk.releases(), 1);
        assert_eq!(mock.bridge(BridgeReg::Reset0), RESET0_CIF | RESET0_VFIFO);
        assert_eq!(mock.bridge(BridgeReg::GpioV0), 0);
        assert_eq!(camera.wait_frame(), None);
    }

    #[test]
    fn corrupt_frame_is_skipped_and_next_one_delivered() {
        let (_mock, bulk, mut camera) = setup();
        camera.start(SizeMode::Qvga, 60, PixelFormat::Bayer8).unwrap();

        let frame = test_frame(camera.frame_size());
        // EOF arrives ten bytes early
        let short = chunked(&frame[..frame.len() - 10], 2048, 1, false);
        bulk.deliver(0, TransferStatus::Completed, &short.concat());
        assert_eq!(camera.wait_frame_for(Duration::from_millis(1)), None);

        bulk.deliver(1, TransferStatus::Completed, &chunked(&frame, 2048, 2, true).concat());
        assert_eq!(camera.wait_frame_for(Duration::from_secs(1)), Some(&frame[..]));
    }

    #[test]
    fn unsupported_native_format_is_rejected() {
        let (_mock, bulk, mut camera) = setup();
        let err = camera.start(SizeMode::Vga, 60, PixelFormat::Rgb24).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(PixelFormat::Rgb24)));
        assert!(!camera.is_streaming());
        assert_eq!(bulk.submissions(), 0);
    }

    #[test]
    fn failed_submission_leaves_camera_stopped() {
        let (mock, bulk, mut camera) = setup();
        bulk.fail_submit_after(0);
        let err = camera.start(SizeMode::Vga, 60, PixelFormat::Bayer8).unwrap_err();
        assert!(matches!(err, Error::NoTransfers { endpoint: EP }));
        assert!(!camera.is_streaming());
        assert_eq!(mock.bridge(BridgeReg::GpioV0), 0);
        assert_eq!(mock.bridge(BridgeReg::Reset0), RESET0_CIF | RESET0_VFIFO);
        camera.stop();
    }

    #[test]
    fn register_failure_during_start_propagates() {
        let (mock, bulk, mut camera) = setup();
        mock.fail_bridge_after(3, Err(-4));
        let err = camera.start(SizeMode::Vga, 60, PixelFormat::Bayer8).unwrap_err();
        assert_eq!(err.usb_code(), Some(-4));
        assert!(!camera.is_streaming());
        assert_eq!(bulk.submissions(), 0);
        mock.heal();
        camera.start(SizeMode::Vga, 60, PixelFormat::Bayer8).unwrap();
        assert!(camera.is_streaming());
    }

    #[test]
    fn controls_apply_live_but_geometry_needs_restart() {
        let (mock, _bulk, mut camera) = setup();
        camera.start(SizeMode::Vga, 60, PixelFormat::Bayer8).unwrap();
        assert!(matches!(camera.start(SizeMode::Vga, 60, PixelFormat::Bayer8), Err(Error::Streaming)));

        let mut state = *camera.current_state();
        state.gain = 42;
        camera.apply_state(state).unwrap();
        assert_eq!(mock.sensor(SensorReg::Gain), 42);

        state.set_mode(SizeMode::Qvga);
        assert!(matches!(camera.apply_state(state), Err(Error::Streaming)));
        assert_eq!(camera.current_state().mode, SizeMode::Vga);

        camera.stop();
        camera.apply_state(state).unwrap();
        assert_eq!(camera.current_state().mode, SizeMode::Qvga);
    }

    #[test]
    fn stop_when_idle_touches_nothing() {
        let (mock, bulk, mut camera) = setup();
        mock.clear_ops();
        camera.stop();
        assert!(mock.ops().is_empty());
        assert_eq!(bulk.releases(), 0);
    }
}
