//! Firmware simulator for station microcontrollers.
//!
//! `SimulatedStation` behaves like a scale/relay board on the other end of a
//! serial cable: it answers the identification probe, requests its calibration
//! factor after the host confirms the id, walks through the calibration
//! exchange and reports weight events pushed through its `SimHandle`.
//! Time is not modeled; every response is queued as soon as the triggering
//! byte is written.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use filler_traits::{BoxError, PortOpener, SerialEndpoint};

use crate::error::HwError;

/// Device-side view of the opcodes the firmware reacts to or emits.
mod fw {
    pub const REQUEST_TARGET_WEIGHT: u8 = 0x01;
    pub const REQUEST_CALIBRATION: u8 = 0x02;
    pub const CURRENT_WEIGHT: u8 = 0x04;
    pub const RESET_CALIBRATION: u8 = 0x05;
    pub const TARGET_WEIGHT_REPLY: u8 = 0x08;
    pub const TARE: u8 = 0x09;
    pub const BEGIN_AUTO: u8 = 0x10;
    pub const FINAL_WEIGHT: u8 = 0x11;
    pub const CALIBRATION_STEP_DONE: u8 = 0x12;
    pub const CALIBRATION_CONTINUE: u8 = 0x13;
    pub const CALIBRATION_WEIGHT: u8 = 0x14;
    pub const FILL_TIME: u8 = 0x15;
    pub const SET_MANUAL: u8 = 0x16;
    pub const BEGIN_SMART: u8 = 0x17;
    pub const GET_ID: u8 = 0xA0;
    pub const CONFIRM_ID: u8 = 0xA1;
    pub const RESET_HANDSHAKE: u8 = 0xB0;
    pub const RELAY_DEACTIVATED: u8 = 0xFA;
    pub const STOP: u8 = 0xFD;
}

/// How the device announces itself after the identification probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityStyle {
    /// `<SERIAL:SCL1001>`
    Tagged,
    /// A free-form banner containing the bare serial id.
    Bare,
    /// Never answers.
    Silent,
}

/// Injected misbehavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Cable is pulled right after the reference weight is received.
    UnplugAfterReferenceWeight,
    /// The first computed-factor payload is garbled; a valid one follows.
    GarbledFactorOnce,
}

/// Static personality of a simulated station.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub serial_id: String,
    pub identity: IdentityStyle,
    pub probe: Vec<u8>,
    /// Bytes emitted after the id is confirmed, before the calibration request.
    pub stray_before_calibration: Vec<u8>,
    pub requests_calibration: bool,
    /// Factor reported at the end of a calibration exchange.
    pub computed_factor: f32,
    pub fault: Option<Fault>,
    /// Run every started fill to completion on its own.
    pub completes_fills: bool,
}

impl DeviceProfile {
    pub fn new(serial_id: impl Into<String>) -> Self {
        Self {
            serial_id: serial_id.into(),
            identity: IdentityStyle::Tagged,
            probe: b"PMID".to_vec(),
            stray_before_calibration: Vec::new(),
            requests_calibration: true,
            computed_factor: 1.0,
            fault: None,
            completes_fills: false,
        }
    }

    pub fn identity(mut self, style: IdentityStyle) -> Self {
        self.identity = style;
        self
    }

    pub fn stray(mut self, bytes: &[u8]) -> Self {
        self.stray_before_calibration = bytes.to_vec();
        self
    }

    pub fn without_calibration_request(mut self) -> Self {
        self.requests_calibration = false;
        self
    }

    pub fn computed_factor(mut self, factor: f32) -> Self {
        self.computed_factor = factor;
        self
    }

    pub fn fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    /// AUTO/SMART fills ask for the target and report it reached; MANUAL
    /// fills end immediately at the current load.
    pub fn completes_fills(mut self) -> Self {
        self.completes_fills = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxMode {
    Command,
    CalibrationFactorLine,
    ReferenceWeightLine,
    TargetLine,
    DiscardLine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CalPhase {
    Idle,
    Started,
    AwaitWeight,
    WeightReceived,
}

#[derive(Debug)]
struct SimState {
    profile: DeviceProfile,
    outbox: VecDeque<u8>,
    written: Vec<u8>,
    mode: RxMode,
    awaiting_probe: bool,
    probe_buf: Vec<u8>,
    line_buf: Vec<u8>,
    calibration_line: Option<String>,
    cal_phase: CalPhase,
    reference_weight: Option<f32>,
    garbled_sent: bool,
    weight: f32,
    tare: f32,
    filling: Option<u8>,
    unplugged: bool,
}

impl SimState {
    fn new(profile: DeviceProfile) -> Self {
        Self {
            profile,
            outbox: VecDeque::new(),
            written: Vec::new(),
            mode: RxMode::Command,
            awaiting_probe: false,
            probe_buf: Vec::new(),
            line_buf: Vec::new(),
            calibration_line: None,
            cal_phase: CalPhase::Idle,
            reference_weight: None,
            garbled_sent: false,
            weight: 0.0,
            tare: 0.0,
            filling: None,
            unplugged: false,
        }
    }

    fn emit(&mut self, bytes: &[u8]) {
        self.outbox.extend(bytes.iter().copied());
    }

    fn emit_value(&mut self, opcode: u8, value: f32) {
        self.outbox.push_back(opcode);
        self.emit(format!("{value}\n").as_bytes());
    }

    fn take_line(&mut self, byte: u8) -> Option<String> {
        if byte == b'\n' {
            let line = String::from_utf8_lossy(&self.line_buf).trim().to_string();
            self.line_buf.clear();
            Some(line)
        } else {
            self.line_buf.push(byte);
            None
        }
    }

    fn feed(&mut self, byte: u8) {
        match self.mode {
            RxMode::CalibrationFactorLine => {
                if let Some(line) = self.take_line(byte) {
                    tracing::trace!(serial_id = %self.profile.serial_id, %line, "sim received calibration");
                    self.calibration_line = Some(line);
                    self.mode = RxMode::Command;
                }
            }
            RxMode::ReferenceWeightLine => {
                if let Some(line) = self.take_line(byte) {
                    self.reference_weight = line.parse().ok();
                    self.mode = RxMode::Command;
                    self.cal_phase = CalPhase::WeightReceived;
                    self.outbox.push_back(fw::CALIBRATION_STEP_DONE);
                    if self.profile.fault == Some(Fault::UnplugAfterReferenceWeight) {
                        self.unplugged = true;
                    }
                }
            }
            RxMode::TargetLine => {
                if let Some(line) = self.take_line(byte) {
                    self.mode = RxMode::Command;
                    match line.parse::<f32>() {
                        Ok(target) => self.complete_fill(target),
                        Err(_) => tracing::warn!(serial_id = %self.profile.serial_id, %line, "sim got bad target"),
                    }
                }
            }
            RxMode::DiscardLine => {
                if self.take_line(byte).is_some() {
                    self.mode = RxMode::Command;
                }
            }
            RxMode::Command => self.command(byte),
        }
    }

    fn command(&mut self, byte: u8) {
        match byte {
            fw::RESET_HANDSHAKE => {
                self.awaiting_probe = true;
                self.probe_buf.clear();
            }
            fw::GET_ID => {
                if self.profile.identity != IdentityStyle::Silent {
                    let id = self.profile.serial_id.clone();
                    self.outbox.push_back(fw::GET_ID);
                    self.emit(format!("{id}\n").as_bytes());
                }
            }
            fw::CONFIRM_ID => {
                let stray = self.profile.stray_before_calibration.clone();
                self.emit(&stray);
                if self.profile.requests_calibration {
                    self.outbox.push_back(fw::REQUEST_CALIBRATION);
                    self.mode = RxMode::CalibrationFactorLine;
                }
            }
            fw::RESET_CALIBRATION => self.cal_phase = CalPhase::Started,
            fw::CALIBRATION_CONTINUE => match self.cal_phase {
                CalPhase::Started => {
                    self.outbox.push_back(fw::CALIBRATION_STEP_DONE);
                    self.cal_phase = CalPhase::AwaitWeight;
                }
                CalPhase::WeightReceived => {
                    if self.profile.fault == Some(Fault::GarbledFactorOnce) && !self.garbled_sent {
                        self.garbled_sent = true;
                        self.outbox.push_back(fw::CALIBRATION_WEIGHT);
                        self.emit(b"1.2.3\n");
                    }
                    let factor = self.profile.computed_factor;
                    self.emit_value(fw::CALIBRATION_WEIGHT, factor);
                    self.cal_phase = CalPhase::Idle;
                }
                CalPhase::Idle | CalPhase::AwaitWeight => {}
            },
            fw::CALIBRATION_WEIGHT if self.cal_phase == CalPhase::AwaitWeight => {
                self.mode = RxMode::ReferenceWeightLine;
            }
            fw::TARGET_WEIGHT_REPLY if self.profile.completes_fills && self.filling.is_some() => {
                self.mode = RxMode::TargetLine;
            }
            fw::TARGET_WEIGHT_REPLY | fw::CALIBRATION_WEIGHT => self.mode = RxMode::DiscardLine,
            fw::TARE => {
                self.tare = self.weight;
                self.emit_value(fw::CURRENT_WEIGHT, 0.0);
            }
            fw::BEGIN_AUTO | fw::BEGIN_SMART => {
                self.filling = Some(byte);
                if self.profile.completes_fills {
                    self.outbox.push_back(fw::REQUEST_TARGET_WEIGHT);
                }
            }
            fw::SET_MANUAL => {
                self.filling = Some(byte);
                if self.profile.completes_fills {
                    let net = self.weight - self.tare;
                    self.complete_fill(net);
                }
            }
            fw::STOP => {
                self.filling = None;
                self.outbox.push_back(fw::RELAY_DEACTIVATED);
            }
            b if self.awaiting_probe && b.is_ascii_graphic() => {
                self.probe_buf.push(b);
                if self.probe_buf.ends_with(&self.profile.probe) {
                    self.awaiting_probe = false;
                    self.announce();
                }
            }
            _ => {}
        }
    }

    fn complete_fill(&mut self, net_grams: f32) {
        self.weight = self.tare + net_grams;
        self.emit_value(fw::CURRENT_WEIGHT, net_grams);
        self.emit_value(fw::FINAL_WEIGHT, net_grams);
        self.emit_value(fw::FILL_TIME, 1500.0);
        self.filling = None;
    }

    fn announce(&mut self) {
        let id = self.profile.serial_id.clone();
        match self.profile.identity {
            IdentityStyle::Tagged => self.emit(format!("<SERIAL:{id}>\n").as_bytes()),
            IdentityStyle::Bare => self.emit(format!("scale ready id {id} fw 2.1\n").as_bytes()),
            IdentityStyle::Silent => {}
        }
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Test-side handle onto a simulated station's shared state.
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    pub fn new(profile: DeviceProfile) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(profile))),
        }
    }

    pub fn serial_id(&self) -> String {
        lock(&self.state).profile.serial_id.clone()
    }

    /// Open a new endpoint onto this device, as if the port were reopened.
    pub fn endpoint(&self, port: &str) -> SimulatedStation {
        {
            let mut s = lock(&self.state);
            s.mode = RxMode::Command;
            s.outbox.clear();
            s.line_buf.clear();
        }
        SimulatedStation {
            name: port.to_string(),
            state: self.state.clone(),
        }
    }

    /// Place a load on the scale; the device reports it as a weight event.
    pub fn set_weight(&self, grams: f32) {
        let mut s = lock(&self.state);
        s.weight = grams;
        let reported = grams - s.tare;
        s.emit_value(fw::CURRENT_WEIGHT, reported);
    }

    /// Report the end of a fill cycle.
    pub fn finish_fill(&self, final_grams: f32) {
        let mut s = lock(&self.state);
        s.filling = None;
        s.emit_value(fw::FINAL_WEIGHT, final_grams);
    }

    /// Push raw device bytes onto the wire.
    pub fn push_raw(&self, bytes: &[u8]) {
        lock(&self.state).emit(bytes);
    }

    pub fn unplug(&self) {
        lock(&self.state).unplugged = true;
    }

    /// Every byte the host has written so far.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    /// The exact calibration line delivered during the handshake, if any.
    pub fn calibration_line(&self) -> Option<String> {
        lock(&self.state).calibration_line.clone()
    }

    pub fn reference_weight(&self) -> Option<f32> {
        lock(&self.state).reference_weight
    }

    /// Fill opcode currently latched, if a fill was started and not stopped.
    pub fn filling(&self) -> Option<u8> {
        lock(&self.state).filling
    }

    pub fn tare_offset(&self) -> f32 {
        lock(&self.state).tare
    }
}

/// Serial endpoint onto a simulated station.
#[derive(Debug)]
pub struct SimulatedStation {
    name: String,
    state: Arc<Mutex<SimState>>,
}

impl SerialEndpoint for SimulatedStation {
    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_available(&mut self) -> Result<usize, BoxError> {
        let s = lock(&self.state);
        if s.unplugged {
            return Err(Box::new(HwError::Disconnected));
        }
        Ok(s.outbox.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BoxError> {
        let mut s = lock(&self.state);
        if s.unplugged {
            return Err(Box::new(HwError::Disconnected));
        }
        let n = buf.len().min(s.outbox.len());
        for slot in buf.iter_mut().take(n) {
            if let Some(b) = s.outbox.pop_front() {
                *slot = b;
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), BoxError> {
        let mut s = lock(&self.state);
        if s.unplugged {
            return Err(Box::new(HwError::Disconnected));
        }
        for &b in bytes {
            s.written.push(b);
            s.feed(b);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), BoxError> {
        if lock(&self.state).unplugged {
            return Err(Box::new(HwError::Disconnected));
        }
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), BoxError> {
        lock(&self.state).outbox.clear();
        Ok(())
    }
}

/// Port opener over a fixed map of simulated devices.
#[derive(Debug, Default, Clone)]
pub struct SimulatedOpener {
    devices: HashMap<String, SimHandle>,
}

impl SimulatedOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device to `port`; returns the handle for inspection.
    pub fn with_device(mut self, port: &str, profile: DeviceProfile) -> Self {
        self.devices.insert(port.to_string(), SimHandle::new(profile));
        self
    }

    pub fn handle(&self, port: &str) -> Option<SimHandle> {
        self.devices.get(port).cloned()
    }

    /// Port names in deterministic order.
    pub fn ports(&self) -> Vec<String> {
        let mut v: Vec<String> = self.devices.keys().cloned().collect();
        v.sort_by_key(|p| crate::util::port_sort_key(p));
        v
    }
}

impl PortOpener for SimulatedOpener {
    fn open(&self, port: &str, _baud: u32) -> Result<Box<dyn SerialEndpoint>, BoxError> {
        match self.devices.get(port) {
            Some(h) => Ok(Box::new(h.endpoint(port))),
            None => Err(Box::new(HwError::Serial(format!("no such port: {port}")))),
        }
    }
}
