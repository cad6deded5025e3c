//! Station wire protocol.
//!
//! Every frame starts with a single opcode byte. Payload-bearing opcodes are
//! followed by one ASCII decimal line terminated by `\n`. Opcodes never fall
//! in the printable ASCII band, so a payload byte can never be mistaken for
//! the start of the next frame.

use std::fmt;

use crate::error::{FillerError, LinkResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    RequestTargetWeight = 0x01,
    RequestCalibration = 0x02,
    RequestTimeLimit = 0x03,
    CurrentWeight = 0x04,
    ResetCalibration = 0x05,
    TargetWeightReply = 0x08,
    Tare = 0x09,
    BeginAutoFill = 0x10,
    FinalWeight = 0x11,
    CalibrationStepDone = 0x12,
    CalibrationContinue = 0x13,
    CalibrationWeight = 0x14,
    FillTime = 0x15,
    SetManualFill = 0x16,
    BeginSmartFill = 0x17,
    GetId = 0xA0,
    ConfirmId = 0xA1,
    ResetHandshake = 0xB0,
    ButtonError = 0xE0,
    MaxWeightWarning = 0xE1,
    MaxWeightEnd = 0xE2,
    EStopActivated = 0xEE,
    RelayDeactivated = 0xFA,
    Stop = 0xFD,
    VerboseDebug = 0xFE,
}

/// Every opcode, in byte order.
pub const ALL_OPCODES: [Opcode; 25] = [
    Opcode::RequestTargetWeight,
    Opcode::RequestCalibration,
    Opcode::RequestTimeLimit,
    Opcode::CurrentWeight,
    Opcode::ResetCalibration,
    Opcode::TargetWeightReply,
    Opcode::Tare,
    Opcode::BeginAutoFill,
    Opcode::FinalWeight,
    Opcode::CalibrationStepDone,
    Opcode::CalibrationContinue,
    Opcode::CalibrationWeight,
    Opcode::FillTime,
    Opcode::SetManualFill,
    Opcode::BeginSmartFill,
    Opcode::GetId,
    Opcode::ConfirmId,
    Opcode::ResetHandshake,
    Opcode::ButtonError,
    Opcode::MaxWeightWarning,
    Opcode::MaxWeightEnd,
    Opcode::EStopActivated,
    Opcode::RelayDeactivated,
    Opcode::Stop,
    Opcode::VerboseDebug,
];

/// Shape of the ASCII payload following an inbound opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    None,
    Float,
    Int,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
    Both,
}

impl Opcode {
    pub fn from_byte(b: u8) -> Option<Self> {
        ALL_OPCODES.iter().copied().find(|op| op.byte() == b)
    }

    #[inline]
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Payload carried when this opcode arrives from a device.
    pub fn payload_kind(self) -> PayloadKind {
        match self {
            Opcode::CurrentWeight
            | Opcode::TargetWeightReply
            | Opcode::FinalWeight
            | Opcode::CalibrationWeight
            | Opcode::FillTime => PayloadKind::Float,
            Opcode::GetId => PayloadKind::Int,
            _ => PayloadKind::None,
        }
    }

    pub fn direction(self) -> Direction {
        use Opcode::*;
        match self {
            RequestTargetWeight | RequestCalibration | RequestTimeLimit | CurrentWeight
            | FinalWeight | FillTime | CalibrationStepDone | ButtonError | MaxWeightWarning
            | MaxWeightEnd | EStopActivated | RelayDeactivated => Direction::DeviceToHost,
            CalibrationWeight | GetId => Direction::Both,
            ResetCalibration | TargetWeightReply | Tare | BeginAutoFill | CalibrationContinue
            | SetManualFill | BeginSmartFill | ConfirmId | ResetHandshake | Stop
            | VerboseDebug => Direction::HostToDevice,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = FillerError;
    fn try_from(b: u8) -> Result<Self, Self::Error> {
        Opcode::from_byte(b).ok_or(FillerError::UnknownOpcode(b))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({:#04x})", self.byte())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    Float(f32),
    Int(i64),
}

/// Canonical ASCII rendering of a numeric payload (shortest round-trip form).
pub fn format_payload(value: f32) -> String {
    format!("{value}")
}

/// Parse the payload line that followed `opcode`.
pub fn parse_payload(opcode: Opcode, line: &str) -> LinkResult<Option<Payload>> {
    let text = line.trim();
    let malformed = || FillerError::MalformedPayload {
        opcode: opcode.byte(),
        text: text.to_string(),
    };
    match opcode.payload_kind() {
        PayloadKind::None => Ok(None),
        PayloadKind::Float => {
            let v: f32 = text.parse().map_err(|_| malformed())?;
            if v.is_finite() {
                Ok(Some(Payload::Float(v)))
            } else {
                Err(malformed())
            }
        }
        PayloadKind::Int => text
            .parse::<i64>()
            .map(|v| Some(Payload::Int(v)))
            .map_err(|_| malformed()),
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Option<Payload>,
}

impl Frame {
    pub fn bare(opcode: Opcode) -> Self {
        Self {
            opcode,
            payload: None,
        }
    }

    pub fn value(&self) -> Option<f32> {
        match self.payload {
            Some(Payload::Float(v)) => Some(v),
            Some(Payload::Int(v)) => Some(v as f32),
            None => None,
        }
    }

    pub fn into_event(self) -> StationEvent {
        let v = self.value().unwrap_or(0.0);
        match self.opcode {
            Opcode::RequestTargetWeight => StationEvent::Query(Query::TargetWeight),
            Opcode::RequestCalibration => StationEvent::Query(Query::Calibration),
            Opcode::RequestTimeLimit => StationEvent::Query(Query::TimeLimit),
            Opcode::CurrentWeight => StationEvent::Weight(v),
            Opcode::FinalWeight => StationEvent::FinalWeight(v),
            Opcode::FillTime => StationEvent::FillTime(v),
            Opcode::CalibrationStepDone => StationEvent::CalibrationStepDone,
            Opcode::CalibrationWeight => StationEvent::CalibrationWeight(v),
            Opcode::GetId => match self.payload {
                Some(Payload::Int(id)) => StationEvent::Identity(id),
                _ => StationEvent::Unexpected(self.opcode),
            },
            Opcode::ButtonError => StationEvent::ButtonError,
            Opcode::MaxWeightWarning => StationEvent::MaxWeightWarning,
            Opcode::MaxWeightEnd => StationEvent::MaxWeightEnd,
            Opcode::EStopActivated => StationEvent::EStop,
            Opcode::RelayDeactivated => StationEvent::RelayDeactivated,
            Opcode::VerboseDebug => StationEvent::Debug,
            other => StationEvent::Unexpected(other),
        }
    }
}

/// Values a device may ask the host for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    TargetWeight,
    Calibration,
    TimeLimit,
}

/// Device-originated happenings, as seen by the registry and the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum StationEvent {
    Weight(f32),
    FinalWeight(f32),
    /// Fill duration reported by the device, in milliseconds.
    FillTime(f32),
    Query(Query),
    CalibrationStepDone,
    CalibrationWeight(f32),
    Identity(i64),
    ButtonError,
    MaxWeightWarning,
    MaxWeightEnd,
    EStop,
    RelayDeactivated,
    Debug,
    /// A host-to-device opcode echoed back, or an id frame without an id.
    Unexpected(Opcode),
    /// The link died; carries the I/O reason.
    LinkLost(String),
}

/// Host-originated frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outgoing {
    /// Single opcode byte.
    Command(Opcode),
    /// Opcode followed by an ASCII payload line.
    Value(Opcode, f32),
    /// Bare payload line answering a device request.
    Payload(f32),
    /// Bare integer payload line; exact for values past `f32` precision.
    Count(u64),
}

impl Outgoing {
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Outgoing::Command(op) => vec![op.byte()],
            Outgoing::Value(op, v) => {
                let mut out = vec![op.byte()];
                out.extend_from_slice(format_payload(v).as_bytes());
                out.push(b'\n');
                out
            }
            Outgoing::Payload(v) => {
                let mut out = format_payload(v).into_bytes();
                out.push(b'\n');
                out
            }
            Outgoing::Count(n) => format!("{n}\n").into_bytes(),
        }
    }
}
