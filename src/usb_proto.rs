// derived from /usr/include/linux/usb/ch9.h and libusb.h
use std::fmt::{Display, Formatter};

use libusb1_sys::constants::*;
use num_traits::FromPrimitive;

use crate::error::{Error, Result};

// 9.3 USB Device Requests
#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum XferDir {
    ToDev = 0x00,
    ToHost = 0x80,
}

#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum XferType {
    Std = 0x00,
    Class = 0x20,
    Vendor = 0x40,
    Reserved = 0x60,
}

#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum Recip {
    Dev = 0x00,
    Iface = 0x01,
    Ep = 0x02,
    Other = 0x03,
}

/// `bmRequestType` of a setup packet.
pub fn request_type(dir: XferDir, xfer: XferType, recip: Recip) -> u8 {
    dir as u8 | xfer as u8 | recip as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorTransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
    Invalid,
}

/// Completion status of an asynchronous transfer, as reported by libusb.
#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq, Eq)]
#[repr(i32)]
pub enum TransferStatus {
    Completed = 0,
    Error = 1,
    TimedOut = 2,
    Cancelled = 3,
    Stall = 4,
    NoDevice = 5,
    Overflow = 6,
}

impl TransferStatus {
    /// Unknown codes are treated as hard errors.
    pub fn from_raw(status: i32) -> TransferStatus {
        TransferStatus::from_i32(status).unwrap_or(TransferStatus::Error)
    }

    /// Statuses after which the transfer is simply resubmitted.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransferStatus::TimedOut | TransferStatus::Stall | TransferStatus::Overflow)
    }
}

#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub struct DeviceAddress {
    pub bus: u8,
    pub num: u8,
}

impl DeviceAddress {
    pub fn new(bus: u8, num: u8) -> DeviceAddress {
        DeviceAddress { bus, num }
    }
}

impl Display for DeviceAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.bus, self.num)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorEndpoint {
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}

impl DescriptorEndpoint {
    /// Parses a raw endpoint descriptor, including its length/type prefix.
    pub fn deserialize(mut buffer: &mut &[u8]) -> Result<DescriptorEndpoint> {
        let format = structure!("<BBBBHB");
        let (_b_length, _b_descriptor_type, b_endpoint_address, bm_attributes, w_max_packet_size, b_interval) =
            format.unpack_from(&mut buffer).map_err(|_| Error::usb(LIBUSB_ERROR_IO, "truncated endpoint descriptor"))?;
        return Ok(DescriptorEndpoint { b_endpoint_address, bm_attributes, w_max_packet_size, b_interval });
    }

    pub fn ep(&self) -> u8 {
        self.b_endpoint_address & LIBUSB_ENDPOINT_ADDRESS_MASK
    }
    pub fn is_in(&self) -> bool {
        self.b_endpoint_address & LIBUSB_ENDPOINT_DIR_MASK == LIBUSB_ENDPOINT_IN
    }
    pub fn transfer_type(&self) -> DescriptorTransferType {
        match self.bm_attributes & LIBUSB_TRANSFER_TYPE_MASK {
            LIBUSB_TRANSFER_TYPE_CONTROL => DescriptorTransferType::Control,
            LIBUSB_TRANSFER_TYPE_ISOCHRONOUS => DescriptorTransferType::Isochronous,
            LIBUSB_TRANSFER_TYPE_BULK => DescriptorTransferType::Bulk,
            LIBUSB_TRANSFER_TYPE_INTERRUPT => DescriptorTransferType::Interrupt,
            _ => DescriptorTransferType::Invalid,
        }
    }
}

impl Display for DescriptorEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let dname = if self.is_in() { "IN" } else { "OUT" };
        write!(f, "ep {} dir {} {:?} max packet {}", self.ep(), dname, self.transfer_type(), self.w_max_packet_size)
    }
}

/// First endpoint of `kind` that can actually move data.
pub fn find_endpoint(endpoints: &[DescriptorEndpoint], kind: DescriptorTransferType) -> Option<DescriptorEndpoint> {
    endpoints
        .iter()
        .find(|ep| ep.transfer_type() == kind && ep.w_max_packet_size != 0)
        .copied()
}
