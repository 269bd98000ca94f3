//! User-space driver for the PlayStation Eye camera (OV534 bridge + OV7725 sensor).
//!
//! The crate programs the bridge and sensor over vendor control transfers,
//! streams UVC-wrapped bulk data, reassembles it into frames and converts the
//! sensor's GRBG mosaic into consumer pixel formats.

#[macro_use]
extern crate num_derive;
#[macro_use]
extern crate structure;

#[macro_use]
pub mod logger;

pub mod camera;
pub mod config;
pub mod device_state;
pub mod error;
pub mod frame_ring;
pub mod host;
pub mod ov534_proto;
pub mod ov7725_proto;
pub mod pixel_format;
pub mod registers;
pub mod transfer;
pub mod usb_context;
pub mod usb_proto;
pub mod uvc_proto;

#[cfg(test)]
mod testing;

pub use camera::{Camera, PsEyeCamera};
pub use config::StreamConfig;
pub use device_state::{DeviceState, SizeMode};
pub use error::{Error, Result};
pub use logger::LogSink;
pub use pixel_format::{convert, PixelFormat};

pub const PSEYE_VID: u16 = 0x1415;
pub const PSEYE_PID: u16 = 0x2000;
pub const PSEYE_INTERFACE: u8 = 0;

pub const BIT_0: u8 = 0x01;
pub const BIT_1: u8 = 0x02;
pub const BIT_2: u8 = 0x04;
pub const BIT_3: u8 = 0x08;
pub const BIT_4: u8 = 0x10;
pub const BIT_5: u8 = 0x20;
pub const BIT_6: u8 = 0x40;
pub const BIT_7: u8 = 0x80;

/// One entry of a register batch: write `value` to `reg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSetting<R> {
    pub reg: R,
    pub value: u8,
}

pub const fn setting<R>(reg: R, value: u8) -> RegisterSetting<R> {
    RegisterSetting { reg, value }
}
