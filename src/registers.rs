use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::StreamConfig;
use crate::error::{Access, Error, Result, SensorBusFailure};
use crate::logger::LogSink;
use crate::ov534_proto::*;
use crate::ov7725_proto::SensorReg;
use crate::usb_proto::{request_type, Recip, XferDir, XferType};
use crate::RegisterSetting;

const BRIDGE_REQUEST: u8 = 0x01;

/// Synchronous control endpoint of a device.
///
/// Returns the number of bytes transferred or the native libusb error code.
pub trait ControlTransport {
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
    ) -> std::result::Result<usize, i32>;
}

impl<T: ControlTransport + ?Sized> ControlTransport for Arc<T> {
    fn control_transfer(&self, request_type: u8, request: u8, value: u16, index: u16, data: &mut [u8]) -> std::result::Result<usize, i32> {
        (**self).control_transfer(request_type, request, value, index, data)
    }
}

impl<T: ControlTransport + ?Sized> ControlTransport for &T {
    fn control_transfer(&self, request_type: u8, request: u8, value: u16, index: u16, data: &mut [u8]) -> std::result::Result<usize, i32> {
        (**self).control_transfer(request_type, request, value, index, data)
    }
}

/// Bridge register access and, through the bridge's SCCB master, sensor
/// register access.
///
/// Not reentrant: callers serialize all configuration through one path.
pub struct Registers<T> {
    transport: T,
    log: LogSink,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl<T: ControlTransport> Registers<T> {
    pub fn new(transport: T, config: &StreamConfig, log: LogSink) -> Registers<T> {
        Registers {
            transport,
            log,
            poll_attempts: config.sensor_poll_attempts,
            poll_interval: config.sensor_poll_interval,
        }
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    pub fn read_bridge(&self, reg: BridgeReg) -> Result<u8> {
        let mut buf = [0u8; 1];
        let rt = request_type(XferDir::ToHost, XferType::Vendor, Recip::Dev);
        let ret = self.transport.control_transfer(rt, BRIDGE_REQUEST, 0x0000, reg as u16, &mut buf);
        match ret {
            Ok(1) => {}
            Ok(n) => return Err(Error::Bridge { register: reg as u8, access: Access::Read, result: n as i32 }),
            Err(code) => return Err(Error::Bridge { register: reg as u8, access: Access::Read, result: code }),
        }
        sink_debug!(self.log, "GET 01 0000 {:04x} {:02x}", reg as u16, buf[0]);
        return Ok(buf[0]);
    }

    pub fn write_bridge(&self, reg: BridgeReg, value: u8) -> Result<()> {
        sink_debug!(self.log, "SET 01 0000 {:04x} {:02x}", reg as u16, value);
        let mut buf = [value];
        let rt = request_type(XferDir::ToDev, XferType::Vendor, Recip::Dev);
        let ret = self.transport.control_transfer(rt, BRIDGE_REQUEST, 0x0000, reg as u16, &mut buf);
        match ret {
            Ok(1) => Ok(()),
            Ok(n) => Err(Error::Bridge { register: reg as u8, access: Access::Write, result: n as i32 }),
            Err(code) => Err(Error::Bridge { register: reg as u8, access: Access::Write, result: code }),
        }
    }

    /// Writes the batch in order; the first failure aborts the rest.
    pub fn write_bridge_seq(&self, settings: &[RegisterSetting<BridgeReg>]) -> Result<()> {
        for s in settings {
            self.write_bridge(s.reg, s.value)?;
        }
        Ok(())
    }

    pub fn read_sensor(&self, reg: SensorReg) -> Result<u8> {
        // select the register to read
        self.write_bridge(BridgeReg::MsAddress, reg as u8)?;
        self.write_bridge(BridgeReg::MsCtrl, MS_CTRL_2BYTE_WRITE)?;
        if let Err(failure) = self.poll_sensor_status()? {
            sink_error!(self.log, "setup SCCB register read target failed: reg {:#x}", reg as u8);
            return Err(Error::SensorBus { register: reg as u8, operation: "read setup", failure });
        }

        // then actually read it
        self.write_bridge(BridgeReg::MsCtrl, MS_CTRL_2BYTE_READ)?;
        if let Err(failure) = self.poll_sensor_status()? {
            sink_error!(self.log, "submit SCCB register read failed: reg {:#x}", reg as u8);
            return Err(Error::SensorBus { register: reg as u8, operation: "read", failure });
        }

        self.read_bridge(BridgeReg::MsDataIn)
    }

    pub fn write_sensor(&self, reg: SensorReg, value: u8) -> Result<()> {
        self.write_bridge(BridgeReg::MsAddress, reg as u8)?;
        self.write_bridge(BridgeReg::MsDataOut, value)?;
        self.write_bridge(BridgeReg::MsCtrl, MS_CTRL_3BYTE_WRITE)?;
        if let Err(failure) = self.poll_sensor_status()? {
            sink_error!(self.log, "SCCB register write failed: reg {:#x} value {:#x}", reg as u8, value);
            return Err(Error::SensorBus { register: reg as u8, operation: "write", failure });
        }
        Ok(())
    }

    pub fn write_sensor_seq(&self, settings: &[RegisterSetting<SensorReg>]) -> Result<()> {
        for s in settings {
            self.write_sensor(s.reg, s.value)?;
        }
        Ok(())
    }

    /// Polls the SCCB status register until the command is acknowledged.
    ///
    /// The outer `Result` carries bridge transfer failures, the inner one the
    /// bus outcome.
    pub fn poll_sensor_status(&self) -> Result<std::result::Result<(), SensorBusFailure>> {
        let mut last_status = 0;
        for attempt in 1..=self.poll_attempts {
            let status = self.read_bridge(BridgeReg::MsStatus)?;
            last_status = status;

            if status & MS_STATUS_SLAVE_NAK != 0 {
                sink_error!(self.log, "NAK in status {:#010b} for SCCB command on poll {}", status, attempt);
                return Ok(Err(SensorBusFailure::Nak { status, attempt }));
            }

            if status == MS_STATUS_SLAVE_ACK {
                return Ok(Ok(()));
            }

            if attempt < self.poll_attempts && !self.poll_interval.is_zero() {
                thread::sleep(self.poll_interval);
            }

            if status & (MS_STATUS_COMMAND_BUSY | MS_STATUS_CYCLE_COMPLETE) != 0 {
                continue;
            }

            sink_info!(self.log, "unexpected SCCB status {:#010b} on poll {}", status, attempt);
        }
        Ok(Err(SensorBusFailure::Exhausted { attempts: self.poll_attempts, last_status }))
    }

    /// Streams `data` into the indirect video-data register space at `offset`.
    pub fn write_video_data(&self, data: &[u8], offset: u8) -> Result<()> {
        self.write_bridge(BridgeReg::VideoDataAddr, offset)?;
        for b in data {
            self.write_bridge(BridgeReg::VideoDataValue, *b)?;
        }
        Ok(())
    }
}
