//! Device discovery: turn candidate ports into attached registry stations.
//!
//! Per port: open, identify, confirm, match the serial id against the
//! configured slots, then answer the device's calibration request with the
//! slot's factor. A port that fails any of these is skipped; the manager
//! never retries on its own.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use filler_traits::PortOpener;
use regex::Regex;

use crate::error::{FillerError, LinkResult};
use crate::hw_error::from_boxed;
use crate::link::StationLink;
use crate::protocol::{Opcode, Outgoing, Payload, parse_payload};
use crate::registry::{SessionState, StationRegistry};
use crate::sched::Ticker;
use crate::util::{DEFAULT_POLL, PAYLOAD_LINE_TIMEOUT, window};

static TAGGED_SERIAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<SERIAL:\s*([A-Za-z0-9_-]+)\s*>").unwrap_or_else(|e| unreachable!("{e}"))
});
static BARE_SERIAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Za-z]+[0-9]{3,4})\b").unwrap_or_else(|e| unreachable!("{e}"))
});

/// Serial id from an identification reply; the tagged form wins over a bare match.
pub fn extract_serial_id(line: &str) -> Option<String> {
    TAGGED_SERIAL
        .captures(line)
        .or_else(|| BARE_SERIAL.captures(line))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// How a device is asked for its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeProfile {
    /// Reset-handshake, paced probe bytes, serial id extracted from the reply line.
    #[default]
    SerialTag,
    /// Legacy: one GET_ID opcode answered by GET_ID plus an integer line.
    GetId,
}

#[derive(Debug, Clone)]
pub struct HandshakeCfg {
    pub profile: HandshakeProfile,
    pub baud: u32,
    pub probe: Vec<u8>,
    pub probe_gap: Duration,
    pub poll: Duration,
    pub id_poll_attempts: u32,
    pub calibration_poll_attempts: u32,
}

impl Default for HandshakeCfg {
    fn default() -> Self {
        Self {
            profile: HandshakeProfile::SerialTag,
            baud: 9600,
            probe: b"PMID".to_vec(),
            probe_gap: Duration::from_millis(50),
            poll: DEFAULT_POLL,
            id_poll_attempts: 60,
            calibration_poll_attempts: 40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Port already owned by a connected station.
    AlreadyAttached,
    OpenFailed(String),
    /// No recognizable identity within the id window.
    NoIdentity,
    /// Identity not in the configured serial table.
    UnknownSerial(String),
    /// The slot for this serial id is already connected on another port.
    DuplicateSerial(String),
    /// Device never asked for its calibration factor.
    NoCalibrationRequest,
    Link(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::AlreadyAttached => f.write_str("already attached"),
            SkipReason::OpenFailed(e) => write!(f, "open failed: {e}"),
            SkipReason::NoIdentity => f.write_str("no identity reply"),
            SkipReason::UnknownSerial(s) => write!(f, "unknown serial id {s}"),
            SkipReason::DuplicateSerial(s) => write!(f, "serial id {s} already connected"),
            SkipReason::NoCalibrationRequest => f.write_str("no calibration request"),
            SkipReason::Link(e) => write!(f, "link failure: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attached {
    pub index: usize,
    pub port: String,
    pub serial_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub port: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub attached: Vec<Attached>,
    pub skipped: Vec<Skipped>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortOutcome {
    Attached(Attached),
    Skipped(SkipReason),
}

/// Internal step failure: either skip the port or stop the whole scan.
enum Abandon {
    Skip(SkipReason),
    Fatal(FillerError),
}

impl From<FillerError> for Abandon {
    fn from(e: FillerError) -> Self {
        match e {
            FillerError::Cancelled => Abandon::Fatal(e),
            FillerError::LinkFailure(m) => Abandon::Skip(SkipReason::Link(m)),
            other => Abandon::Skip(SkipReason::Link(other.to_string())),
        }
    }
}

pub struct HandshakeManager {
    opener: Arc<dyn PortOpener>,
    cfg: HandshakeCfg,
}

impl HandshakeManager {
    pub fn new(opener: Arc<dyn PortOpener>, cfg: HandshakeCfg) -> Self {
        Self { opener, cfg }
    }

    pub fn cfg(&self) -> &HandshakeCfg {
        &self.cfg
    }

    /// One pass over `ports`. Only cancellation aborts the pass.
    pub fn scan(
        &self,
        ports: &[String],
        registry: &mut StationRegistry,
        ticker: &mut Ticker,
    ) -> LinkResult<ScanReport> {
        let mut report = ScanReport::default();
        for port in ports {
            match self.handshake_port(port, registry, ticker)? {
                PortOutcome::Attached(a) => report.attached.push(a),
                PortOutcome::Skipped(reason) => {
                    tracing::info!(%port, %reason, "port skipped");
                    report.skipped.push(Skipped {
                        port: port.clone(),
                        reason,
                    });
                }
            }
        }
        tracing::info!(
            attached = report.attached.len(),
            skipped = report.skipped.len(),
            "handshake pass complete"
        );
        Ok(report)
    }

    /// Full handshake on one port; attaches the station on success.
    pub fn handshake_port(
        &self,
        port: &str,
        registry: &mut StationRegistry,
        ticker: &mut Ticker,
    ) -> LinkResult<PortOutcome> {
        if registry.attached_ports().iter().any(|p| p == port) {
            return Ok(PortOutcome::Skipped(SkipReason::AlreadyAttached));
        }
        let endpoint = match self.opener.open(port, self.cfg.baud) {
            Ok(ep) => ep,
            Err(e) => {
                let reason = from_boxed(e);
                return Ok(PortOutcome::Skipped(SkipReason::OpenFailed(reason.to_string())));
            }
        };
        let mut link = StationLink::new(endpoint).with_poll(self.cfg.poll);
        tracing::debug!(%port, profile = ?self.cfg.profile, "handshake start");

        match self.exchange(&mut link, registry, None, ticker) {
            Ok(index) => {
                let serial_id = registry
                    .get(index)
                    .map(|s| s.serial_id().to_string())
                    .unwrap_or_default();
                registry.attach(index, link)?;
                Ok(PortOutcome::Attached(Attached {
                    index,
                    port: port.to_string(),
                    serial_id,
                }))
            }
            Err(Abandon::Skip(reason)) => {
                link.close();
                Ok(PortOutcome::Skipped(reason))
            }
            Err(Abandon::Fatal(e)) => {
                link.close();
                Err(e)
            }
        }
    }

    /// Re-identify an attached station on its existing link and re-deliver
    /// its calibration. Returns `false` if the station was demoted.
    pub fn reverify(
        &self,
        index: usize,
        registry: &mut StationRegistry,
        ticker: &mut Ticker,
    ) -> LinkResult<bool> {
        let st = registry
            .get_mut(index)
            .ok_or_else(|| FillerError::State(format!("no station slot {index}")))?;
        let Some(mut link) = st.take_link() else {
            return Err(FillerError::State(format!("station {index} has no link to reverify")));
        };
        st.set_state(SessionState::Handshaking)?;

        match self.exchange(&mut link, registry, Some(index), ticker) {
            Ok(_) => {
                if let Some(st) = registry.get_mut(index) {
                    st.put_link(link)?;
                    st.set_state(SessionState::Idle)?;
                }
                tracing::info!(station = index, "station reverified");
                Ok(true)
            }
            Err(Abandon::Skip(reason)) => {
                link.close();
                registry.demote(index, &format!("reverify failed: {reason}"));
                Ok(false)
            }
            Err(Abandon::Fatal(e)) => {
                if let Some(st) = registry.get_mut(index) {
                    st.put_link(link)?;
                    st.set_state(SessionState::Idle)?;
                }
                Err(e)
            }
        }
    }

    /// Identify, confirm, match and deliver calibration. `expect` pins the slot
    /// for a reverification; otherwise the slot must be free.
    fn exchange(
        &self,
        link: &mut StationLink,
        registry: &StationRegistry,
        expect: Option<usize>,
        ticker: &mut Ticker,
    ) -> Result<usize, Abandon> {
        let serial = self.identify(link, ticker)?;
        tracing::debug!(port = %link.port(), serial_id = %serial, "identity received");
        link.send(Outgoing::Command(Opcode::ConfirmId))?;

        let index = registry
            .index_of_serial(&serial)
            .ok_or_else(|| Abandon::Skip(SkipReason::UnknownSerial(serial.clone())))?;
        match expect {
            Some(want) if want != index => {
                return Err(Abandon::Skip(SkipReason::UnknownSerial(serial)));
            }
            None if registry.get(index).is_some_and(|s| s.is_connected()) => {
                return Err(Abandon::Skip(SkipReason::DuplicateSerial(serial)));
            }
            _ => {}
        }

        self.await_calibration_request(link, ticker)?;
        let factor = registry
            .get(index)
            .map_or(filler_config::settings::DEFAULT_CALIBRATION, |s| s.calibration_factor());
        link.send(Outgoing::Payload(factor))?;
        tracing::debug!(station = index, factor, "calibration delivered");
        Ok(index)
    }

    fn identify(&self, link: &mut StationLink, ticker: &mut Ticker) -> Result<String, Abandon> {
        match self.cfg.profile {
            HandshakeProfile::SerialTag => {
                link.discard_input()?;
                link.send(Outgoing::Command(Opcode::ResetHandshake))?;
                link.send_paced(&self.cfg.probe, self.cfg.probe_gap, ticker)?;
                for _ in 0..self.cfg.id_poll_attempts {
                    while let Some(line) = link.try_read_line()? {
                        if let Some(id) = extract_serial_id(&line) {
                            return Ok(id);
                        }
                        tracing::trace!(port = %link.port(), %line, "ignoring non-identity line");
                    }
                    ticker.wait(self.cfg.poll)?;
                }
                tracing::debug!(
                    port = %link.port(),
                    window_ms = window(self.cfg.poll, self.cfg.id_poll_attempts).as_millis() as u64,
                    "no identity line"
                );
                Err(Abandon::Skip(SkipReason::NoIdentity))
            }
            HandshakeProfile::GetId => {
                link.discard_input()?;
                link.send(Outgoing::Command(Opcode::GetId))?;
                for _ in 0..self.cfg.id_poll_attempts {
                    while let Some(b) = link.try_read_byte()? {
                        if b != Opcode::GetId.byte() {
                            continue;
                        }
                        let line = link.read_line(Some(PAYLOAD_LINE_TIMEOUT), ticker)?;
                        match parse_payload(Opcode::GetId, &line) {
                            Ok(Some(Payload::Int(id))) => return Ok(id.to_string()),
                            Ok(_) => {}
                            Err(e) => tracing::warn!(port = %link.port(), error = %e, "bad id payload"),
                        }
                    }
                    ticker.wait(self.cfg.poll)?;
                }
                Err(Abandon::Skip(SkipReason::NoIdentity))
            }
        }
    }

    /// Poll for REQUEST_CALIBRATION, discarding anything else that arrives first.
    fn await_calibration_request(&self, link: &mut StationLink, ticker: &mut Ticker) -> Result<(), Abandon> {
        for _ in 0..self.cfg.calibration_poll_attempts {
            while let Some(b) = link.try_read_byte()? {
                if b == Opcode::RequestCalibration.byte() {
                    return Ok(());
                }
                tracing::debug!(port = %link.port(), byte = b, "discarding stray byte");
            }
            ticker.wait(self.cfg.poll)?;
        }
        tracing::debug!(
            port = %link.port(),
            window_ms = window(self.cfg.poll, self.cfg.calibration_poll_attempts).as_millis() as u64,
            "no calibration request"
        );
        Err(Abandon::Skip(SkipReason::NoCalibrationRequest))
    }
}
