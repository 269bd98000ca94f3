// OmniVision OV534-538 USB bridge
use std::io::Write;

use crate::{setting, RegisterSetting, BIT_0, BIT_1, BIT_2, BIT_3, BIT_4, BIT_5, BIT_6, BIT_7};

#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BridgeReg {
    // SCCB & micro controller
    MsSpeed = 0xf0,
    MsId,
    MsAddress,
    MsDataOut,
    MsDataIn,
    MsCtrl,
    MsStatus,
    ReservedF7,
    ReservedF8,
    McBist,
    McAl,
    McAh,
    McD,
    Sample,
    AcBist,

    // system controller
    Reset0 = 0xe0,
    Reset1,
    Clock0,
    Clock1,
    ReservedE4,
    CameraClock,
    User,
    SysCtrl,
    StepLow,
    StepHigh,
    MaxLow,
    MaxHigh,
    IrqM0,
    IrqM1,
    Irq0,
    Irq1,
    Dif = 0x35,
    CifFrame = 0x3b,
    IpuFrame,
    PhyBist0,
    PhyBist1,
    PhyBist2,

    // GPIO
    GpioN0 = 0x20,
    GpioC0,
    GpioI0,
    GpioV0,
    GpioN1,
    GpioC1,
    GpioI1,
    GpioV1,
    SensorS1,
    SensorC1,
    SensorI1,
    SensorV1,
    SensorS0,
    SensorC0,
    SensorI0,
    SensorV0,
    RegulatorC0,
    RegulatorC1,
    SdPga,
    SdC0,
    SdC1,
    GpioS0 = 0x39,
    GpioS1,

    // video data
    VideoDataAddr = 0x1c,
    VideoDataValue,
    Unknown1e,
    Unknown1f,

    // meaning unknown, values taken from USB captures
    Unknown50 = 0x50,
    Unknown76 = 0x76,
    Unknown88 = 0x88,
    Unknown89,
    Unknown8d = 0x8d,
    Unknown8e,
    Unknown90 = 0x90,
    Unknown91,
    Unknown92 = 0x92,
    Unknown93,
    Unknown94,
    Unknown95,
    UnknownIndirectAddr,
    UnknownIndirectValue,
    HorizontalBlocks = 0xc0,
    VerticalBlocks,
    UnknownC2,
    UnknownC3,
}

pub const MS_CTRL_2BYTE_WRITE: u8 = 0x33;
pub const MS_CTRL_3BYTE_WRITE: u8 = 0x37;
pub const MS_CTRL_2BYTE_READ: u8 = 0xf9;

pub const MS_STATUS_COMMAND_BUSY: u8 = BIT_0;
pub const MS_STATUS_CYCLE_COMPLETE: u8 = BIT_1;
pub const MS_STATUS_SLAVE_ACK: u8 = 0 << 2;
pub const MS_STATUS_SLAVE_NAK: u8 = 1 << 2;

pub const SYS_CTRL_CAMERA_POWER_DOWN: u8 = BIT_0;
pub const SYS_CTRL_SUSPEND_ENABLE: u8 = BIT_1;
pub const SYS_CTRL_WAKEUP_ENABLE: u8 = BIT_2;
pub const SYS_CTRL_RESET_3: u8 = BIT_3;
pub const SYS_CTRL_MC_WAKEUP_RESET_ENABLE: u8 = BIT_4;
pub const SYS_CTRL_RESET_5: u8 = BIT_5;
pub const SYS_CTRL_LAUNCH_REGISTER_RESET: u8 = BIT_6;
pub const SYS_CTRL_LAUNCH_SUSPEND: u8 = BIT_7;

/// Camera and ADC interface
pub const RESET0_CIF: u8 = BIT_0;
/// Image signal processing
pub const RESET0_ISP: u8 = BIT_1;
pub const RESET0_COMPRESSION: u8 = BIT_2;
pub const RESET0_VFIFO: u8 = BIT_3;
pub const RESET0_AUDIO: u8 = BIT_4;
pub const RESET0_DIF: u8 = BIT_5;
pub const RESET0_AUDIO_INTERFACE: u8 = BIT_6;
pub const RESET0_SCCB: u8 = BIT_7;

/// SCCB slave id of the OV7725 sensor.
pub const SENSOR_SCCB_ID: u8 = 0x42;

/// Status indicator LED on GPIO 0.
pub const GPIO_LED: u8 = BIT_7;

const INIT_SYS_CTRL: u8 = SYS_CTRL_SUSPEND_ENABLE | SYS_CTRL_WAKEUP_ENABLE | SYS_CTRL_RESET_3 | SYS_CTRL_RESET_5;

/// Written right after power-up, before the sensor is probed.
pub const RESET_SYS_CTRL: u8 =
    SYS_CTRL_SUSPEND_ENABLE | SYS_CTRL_MC_WAKEUP_RESET_ENABLE | SYS_CTRL_RESET_3 | SYS_CTRL_RESET_5;

pub const INITIALIZATION_DATA: &[RegisterSetting<BridgeReg>] = &[
    setting(BridgeReg::Unknown92, 0x01),
    setting(BridgeReg::Unknown93, 0x18),
    setting(BridgeReg::Unknown94, 0x10),
    setting(BridgeReg::Unknown95, 0x10),

    setting(BridgeReg::Clock0, 0x00),
    setting(BridgeReg::SysCtrl, INIT_SYS_CTRL | SYS_CTRL_MC_WAKEUP_RESET_ENABLE),

    setting(BridgeReg::UnknownIndirectAddr, 0x00),
    setting(BridgeReg::UnknownIndirectValue, 0x20),
    setting(BridgeReg::UnknownIndirectValue, 0x20),
    setting(BridgeReg::UnknownIndirectValue, 0x20),
    setting(BridgeReg::UnknownIndirectValue, 0x0a),
    setting(BridgeReg::UnknownIndirectValue, 0x3f),
    setting(BridgeReg::UnknownIndirectValue, 0x4a),
    setting(BridgeReg::UnknownIndirectValue, 0x20),
    setting(BridgeReg::UnknownIndirectValue, 0x15),
    setting(BridgeReg::UnknownIndirectValue, 0x0b),

    setting(BridgeReg::SdC1, 0b101),
    setting(BridgeReg::Clock1, 0b100),
    setting(BridgeReg::SysCtrl, INIT_SYS_CTRL),
    setting(BridgeReg::RegulatorC1, 0xf9),
    setting(BridgeReg::GpioC1, 0x42),
    setting(BridgeReg::GpioC0, 0xf0),
    setting(BridgeReg::CameraClock, 0b100),

    setting(BridgeReg::Unknown1f, 0x81),

    setting(BridgeReg::Unknown50, 0x89),
    setting(BridgeReg::Unknown76, 0x00),
    setting(BridgeReg::Unknown89, 0x00),
    setting(BridgeReg::Unknown8d, 0x00),
    setting(BridgeReg::Unknown8e, 0x00),
];

pub const START_VGA: &[RegisterSetting<BridgeReg>] = &[
    setting(BridgeReg::HorizontalBlocks, (640 / 8) as u8),
    setting(BridgeReg::VerticalBlocks, (480 / 8) as u8),
];

pub const START_QVGA: &[RegisterSetting<BridgeReg>] = &[
    setting(BridgeReg::HorizontalBlocks, (320 / 8) as u8),
    setting(BridgeReg::VerticalBlocks, (240 / 8) as u8),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VideoFormat {
    Raw8 = 0,
    Raw10,
    Raw16,
    Reserved3,
    Yuv422,
    Yuv411YyyyYuyv,
    Yuv411YuyvYyyy,
    Yuv411UyyVyy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VideoTransfer {
    Bulk = 0,
    Iso = 1,
}

/// Block pushed through the indirect video-data registers before streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoDataConfig {
    pub format: u8,
    pub payload_size: u16,
    pub frame_size: u32,
    pub internal_header: u32,
    pub cntl: [u8; 2],
}

impl VideoDataConfig {
    pub const ENABLE_UVC_HEADER_FORMAT: u8 = BIT_3;
    pub const AUTO_FRAME_SIZE: u8 = BIT_3;

    /// `payload_size` and `frame_size` are in units of 4 bytes.
    pub fn new(fmt: VideoFormat, transfer: VideoTransfer, payload_size: u16, frame_size: u32) -> VideoDataConfig {
        VideoDataConfig::with_options(fmt, transfer, payload_size, frame_size, false, false)
    }

    pub fn with_options(
        fmt: VideoFormat,
        transfer: VideoTransfer,
        payload_size: u16,
        frame_size: u32,
        still_image_header: bool,
        even_odd_byte_swap: bool,
    ) -> VideoDataConfig {
        let format = (fmt as u8) << 4
            | (transfer as u8) << 3
            | (still_image_header as u8) << 2
            | (even_odd_byte_swap as u8) << 7;
        VideoDataConfig {
            format,
            payload_size,
            // 24 bits on the wire; ignored by the bridge once auto frame size is on
            frame_size: frame_size & 0x00ff_ffff,
            internal_header: 0xff5a_a500,
            // without auto frame size the bridge sends nothing
            cntl: [Self::ENABLE_UVC_HEADER_FORMAT, BIT_1 | BIT_2 | Self::AUTO_FRAME_SIZE],
        }
    }

    pub fn size() -> usize {
        structure!(">BHBHIBB").size()
    }

    pub fn serialize(&self, mut buffer: impl Write) -> std::io::Result<()> {
        let format = structure!(">BHBHIBB");
        format.pack_into(
            &mut buffer,
            self.format,
            self.payload_size,
            (self.frame_size >> 16) as u8,
            self.frame_size as u16,
            self.internal_header,
            self.cntl[0],
            self.cntl[1],
        )
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::size());
        // writing into a Vec cannot fail
        let _ = self.serialize(&mut out);
        out
    }
}
