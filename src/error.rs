use std::ffi::CStr;
use std::fmt;

use thiserror::Error;

use crate::pixel_format::PixelFormat;

/// Direction of a single bridge register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
        }
    }
}

/// Why a sensor bus (SCCB) command did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorBusFailure {
    /// The sensor refused the command.
    Nak { status: u8, attempt: u32 },
    /// The status never settled within the poll budget.
    Exhausted { attempts: u32, last_status: u8 },
}

impl fmt::Display for SensorBusFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorBusFailure::Nak { status, attempt } => {
                write!(f, "NAK in status {:#010b} on poll {}", status, attempt)
            }
            SensorBusFailure::Exhausted { attempts, last_status } => {
                write!(f, "no ACK after {} polls, last status {:#010b}", attempts, last_status)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{context}: {} ({code})", usb_error_name(*code))]
    Usb { code: i32, context: String },

    #[error("bridge register {register:#04x} {access} failed: {}", transfer_result(*result))]
    Bridge { register: u8, access: Access, result: i32 },

    #[error("sensor register {register:#04x} {operation} failed: {failure}")]
    SensorBus {
        register: u8,
        operation: &'static str,
        failure: SensorBusFailure,
    },

    #[error("conversion from {from:?} to {to:?} is not implemented")]
    UnimplementedConversion { from: PixelFormat, to: PixelFormat },

    #[error("{0:?} is not a supported sensor output format")]
    UnsupportedFormat(PixelFormat),

    #[error("invalid frame geometry {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },

    #[error("buffer too small: need {needed} bytes, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    #[error("operation not allowed while streaming")]
    Streaming,

    #[error("no bulk transfer could be submitted on endpoint {endpoint:#04x}")]
    NoTransfers { endpoint: u8 },
}

impl Error {
    pub fn usb(code: i32, context: impl Into<String>) -> Error {
        Error::Usb { code, context: context.into() }
    }

    /// Native libusb code carried by transport-level failures.
    pub fn usb_code(&self) -> Option<i32> {
        match self {
            Error::Usb { code, .. } => Some(*code),
            Error::Bridge { result, .. } if *result < 0 => Some(*result),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub fn usb_error_name(code: i32) -> String {
    // SAFETY: libusb_error_name returns a pointer to a static, NUL-terminated
    // string for every input value, including unknown codes.
    let name = unsafe { libusb1_sys::libusb_error_name(code) };
    if name.is_null() {
        return format!("LIBUSB_ERROR_{}", code);
    }
    unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
}

fn transfer_result(result: i32) -> String {
    if result < 0 {
        usb_error_name(result)
    } else {
        format!("transferred {} bytes", result)
    }
}
