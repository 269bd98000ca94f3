//! Simulated hardware for unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{Level, Log, Metadata, Record};

use crate::error::Result;
use crate::ov534_proto::*;
use crate::ov7725_proto::SensorReg;
use crate::registers::ControlTransport;
use crate::transfer::{finish_completion, BulkEndpoint, CompletionSink};
use crate::usb_proto::TransferStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    BridgeRead(u8),
    BridgeWrite(u8, u8),
}

struct ControlState {
    bridge: [u8; 256],
    sensor: [u8; 256],
    ops: Vec<Op>,
    status_script: VecDeque<u8>,
    status_reads: usize,
    transfers: usize,
    fail_after: Option<(usize, std::result::Result<usize, i32>)>,
}

/// OV534 bridge with an OV7725 behind its SCCB master.
pub struct MockControl {
    state: Mutex<ControlState>,
}

impl MockControl {
    pub fn new() -> MockControl {
        let mut sensor = [0u8; 256];
        sensor[SensorReg::Pid as usize] = 0x77;
        sensor[SensorReg::Ver as usize] = 0x21;
        MockControl {
            state: Mutex::new(ControlState {
                bridge: [0u8; 256],
                sensor,
                ops: Vec::new(),
                status_script: VecDeque::new(),
                status_reads: 0,
                transfers: 0,
                fail_after: None,
            }),
        }
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().unwrap().ops.clear();
    }

    /// Bridge writes only, in order.
    pub fn writes(&self) -> Vec<(u8, u8)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::BridgeWrite(r, v) => Some((r, v)),
                Op::BridgeRead(_) => None,
            })
            .collect()
    }

    /// Sensor writes reconstructed from the SCCB command sequence.
    pub fn sensor_writes(&self) -> Vec<(u8, u8)> {
        let mut address = 0;
        let mut data = 0;
        let mut out = Vec::new();
        for (reg, value) in self.writes() {
            if reg == BridgeReg::MsAddress as u8 {
                address = value;
            } else if reg == BridgeReg::MsDataOut as u8 {
                data = value;
            } else if reg == BridgeReg::MsCtrl as u8 && value == MS_CTRL_3BYTE_WRITE {
                out.push((address, data));
            }
        }
        out
    }

    pub fn bridge(&self, reg: BridgeReg) -> u8 {
        self.state.lock().unwrap().bridge[reg as usize]
    }

    pub fn sensor(&self, reg: SensorReg) -> u8 {
        self.state.lock().unwrap().sensor[reg as usize]
    }

    pub fn set_sensor(&self, reg: SensorReg, value: u8) {
        self.state.lock().unwrap().sensor[reg as usize] = value;
    }

    /// Values returned by the next status reads; afterwards status reads are 0.
    pub fn script_status(&self, statuses: &[u8]) {
        self.state.lock().unwrap().status_script.extend(statuses.iter().copied());
    }

    pub fn status_reads(&self) -> usize {
        self.state.lock().unwrap().status_reads
    }

    pub fn fail_bridge_with(&self, result: std::result::Result<usize, i32>) {
        self.fail_bridge_after(0, result);
    }

    /// Transfers after the first `count` from now on return `result`.
    pub fn fail_bridge_after(&self, count: usize, result: std::result::Result<usize, i32>) {
        let mut s = self.state.lock().unwrap();
        s.fail_after = Some((s.transfers + count, result));
    }

    pub fn heal(&self) {
        self.state.lock().unwrap().fail_after = None;
    }
}

impl ControlTransport for MockControl {
    fn control_transfer(&self, request_type: u8, request: u8, _value: u16, index: u16, data: &mut [u8]) -> std::result::Result<usize, i32> {
        assert_eq!(request, 0x01);
        assert_eq!(data.len(), 1);
        let mut s = self.state.lock().unwrap();
        let n = s.transfers;
        s.transfers += 1;
        if let Some((after, result)) = s.fail_after {
            if n >= after {
                return result;
            }
        }

        let reg = index as u8;
        if request_type == 0xc0 {
            s.ops.push(Op::BridgeRead(reg));
            data[0] = if reg == BridgeReg::MsStatus as u8 {
                s.status_reads += 1;
                s.status_script.pop_front().unwrap_or(MS_STATUS_SLAVE_ACK)
            } else {
                s.bridge[reg as usize]
            };
        } else {
            assert_eq!(request_type, 0x40);
            let value = data[0];
            s.ops.push(Op::BridgeWrite(reg, value));
            s.bridge[reg as usize] = value;
            if reg == BridgeReg::MsCtrl as u8 {
                let address = s.bridge[BridgeReg::MsAddress as usize] as usize;
                match value {
                    MS_CTRL_3BYTE_WRITE => s.sensor[address] = s.bridge[BridgeReg::MsDataOut as usize],
                    MS_CTRL_2BYTE_READ => s.bridge[BridgeReg::MsDataIn as usize] = s.sensor[address],
                    _ => {}
                }
            }
        }
        Ok(1)
    }
}

#[derive(Default)]
struct BulkState {
    sink: Option<Arc<dyn CompletionSink>>,
    in_flight: HashSet<usize>,
    submissions: usize,
    fail_submit_after: Option<usize>,
    fail_resubmit: bool,
    halts_cleared: Vec<u8>,
    releases: usize,
    cancel_delay: Duration,
    allocation: Option<(u8, usize, usize)>,
}

/// Bulk endpoint whose completions are driven by the test.
#[derive(Clone, Default)]
pub struct MockBulk {
    state: Arc<Mutex<BulkState>>,
}

impl MockBulk {
    pub fn new() -> MockBulk {
        MockBulk::default()
    }

    pub fn fail_submit_after(&self, count: usize) {
        self.state.lock().unwrap().fail_submit_after = Some(count);
    }

    pub fn fail_resubmit(&self, fail: bool) {
        self.state.lock().unwrap().fail_resubmit = fail;
    }

    pub fn set_cancel_delay(&self, delay: Duration) {
        self.state.lock().unwrap().cancel_delay = delay;
    }

    pub fn in_flight(&self) -> Vec<usize> {
        let mut slots: Vec<usize> = self.state.lock().unwrap().in_flight.iter().copied().collect();
        slots.sort_unstable();
        slots
    }

    pub fn submissions(&self) -> usize {
        self.state.lock().unwrap().submissions
    }

    pub fn halts_cleared(&self) -> Vec<u8> {
        self.state.lock().unwrap().halts_cleared.clone()
    }

    pub fn releases(&self) -> usize {
        self.state.lock().unwrap().releases
    }

    /// (endpoint, count, size) of the current allocation.
    pub fn allocation(&self) -> Option<(u8, usize, usize)> {
        self.state.lock().unwrap().allocation
    }

    /// Completes an in-flight transfer with `status` and `data`.
    pub fn deliver(&self, slot: usize, status: TransferStatus, data: &[u8]) {
        let sink = {
            let mut s = self.state.lock().unwrap();
            if !s.in_flight.remove(&slot) {
                return;
            }
            match &s.sink {
                Some(sink) => sink.clone(),
                None => return,
            }
        };
        let state = self.state.clone();
        finish_completion(sink.as_ref(), slot, status, data, move || {
            let mut s = state.lock().unwrap();
            if s.fail_resubmit {
                return Err(-1);
            }
            s.submissions += 1;
            s.in_flight.insert(slot);
            Ok(())
        });
    }

    /// Completes every in-flight transfer with the same data.
    pub fn deliver_all(&self, data: &[u8]) {
        for slot in self.in_flight() {
            self.deliver(slot, TransferStatus::Completed, data);
        }
    }
}

impl BulkEndpoint for MockBulk {
    fn clear_halt(&mut self, endpoint: u8) -> std::result::Result<(), i32> {
        self.state.lock().unwrap().halts_cleared.push(endpoint);
        Ok(())
    }

    fn allocate(&mut self, endpoint: u8, count: usize, size: usize, sink: Arc<dyn CompletionSink>) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.sink = Some(sink);
        s.allocation = Some((endpoint, count, size));
        Ok(())
    }

    fn submit(&mut self, slot: usize) -> std::result::Result<(), i32> {
        let mut s = self.state.lock().unwrap();
        if let Some(limit) = s.fail_submit_after {
            if s.submissions >= limit {
                return Err(-6);
            }
        }
        s.submissions += 1;
        s.in_flight.insert(slot);
        Ok(())
    }

    fn cancel(&mut self, slot: usize) {
        let delay = self.state.lock().unwrap().cancel_delay;
        let this = self.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            this.deliver(slot, TransferStatus::Cancelled, &[]);
        });
    }

    fn release(&mut self) {
        let mut s = self.state.lock().unwrap();
        s.sink = None;
        s.allocation = None;
        s.releases += 1;
    }
}

/// Keeps every record it sees; handy for asserting on diagnostics.
#[derive(Default)]
pub struct CaptureLog {
    records: Mutex<Vec<(Level, String)>>,
}

impl CaptureLog {
    pub fn messages(&self, level: Level) -> Vec<String> {
        self.records
            .lock()
            .map(|r| r.iter().filter(|(l, _)| *l == level).map(|(_, m)| m.clone()).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.records
            .lock()
            .map(|r| r.iter().any(|(_, m)| m.contains(needle)))
            .unwrap_or(false)
    }
}

impl Log for CaptureLog {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        if let Ok(mut records) = self.records.lock() {
            records.push((record.level(), record.args().to_string()));
        }
    }

    fn flush(&self) {}
}
