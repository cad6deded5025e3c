//! One serial connection to a station.
//!
//! Reads never block in the OS: every wait polls `bytes_available` in
//! `poll` increments through the [`Ticker`], so the caller's UI keeps running
//! and cancellation is honored at the top of each poll.

use std::time::Duration;

use filler_traits::SerialEndpoint;

use crate::error::{FillerError, LinkResult};
use crate::hw_error::from_boxed;
use crate::protocol::{Frame, Opcode, Outgoing, PayloadKind, parse_payload};
use crate::sched::Ticker;
use crate::util::{DEFAULT_POLL, MAX_LINE_LEN, PAYLOAD_LINE_TIMEOUT};

pub struct StationLink {
    endpoint: Box<dyn SerialEndpoint>,
    port: String,
    poll: Duration,
    /// Partial line carried across timed-out reads.
    line_buf: Vec<u8>,
    /// Input up to the next `\n` is dropped before anything else is decoded.
    resync: bool,
}

impl std::fmt::Debug for StationLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StationLink")
            .field("port", &self.port)
            .field("poll", &self.poll)
            .finish()
    }
}

impl StationLink {
    pub fn new(endpoint: Box<dyn SerialEndpoint>) -> Self {
        let port = endpoint.name().to_string();
        Self {
            endpoint,
            port,
            poll: DEFAULT_POLL,
            line_buf: Vec::new(),
            resync: false,
        }
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll
    }

    pub fn bytes_available(&mut self) -> LinkResult<usize> {
        self.endpoint.bytes_available().map_err(from_boxed)
    }

    /// Next buffered byte, if any. Never waits.
    pub fn try_read_byte(&mut self) -> LinkResult<Option<u8>> {
        if self.bytes_available()? == 0 {
            return Ok(None);
        }
        let mut b = [0u8; 1];
        match self.endpoint.read(&mut b).map_err(from_boxed)? {
            0 => Ok(None),
            _ => Ok(Some(b[0])),
        }
    }

    pub fn read_exact(&mut self, n: usize, timeout: Duration, ticker: &mut Ticker) -> LinkResult<Vec<u8>> {
        let deadline = ticker.deadline(Some(timeout));
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if let Some(b) = self.try_read_byte()? {
                out.push(b);
                continue;
            }
            if ticker.expired(deadline) {
                return Err(FillerError::Timeout);
            }
            ticker.wait(self.poll)?;
        }
        Ok(out)
    }

    /// Drop input up to and including the next `\n` while a resync is pending.
    /// Returns `false` if the terminator has not arrived yet.
    fn skip_to_newline(&mut self) -> LinkResult<bool> {
        while self.resync {
            match self.try_read_byte()? {
                Some(b'\n') => self.resync = false,
                Some(_) => {}
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Complete line already buffered on the wire, without the terminator.
    ///
    /// Lines longer than [`MAX_LINE_LEN`] are dropped whole.
    pub fn try_read_line(&mut self) -> LinkResult<Option<String>> {
        if !self.skip_to_newline()? {
            return Ok(None);
        }
        while let Some(b) = self.try_read_byte()? {
            if b == b'\n' {
                let line = String::from_utf8_lossy(&self.line_buf)
                    .trim_end_matches('\r')
                    .to_string();
                self.line_buf.clear();
                return Ok(Some(line));
            }
            if self.line_buf.len() >= MAX_LINE_LEN {
                tracing::warn!(port = %self.port, limit = MAX_LINE_LEN, "line too long; dropped");
                self.line_buf.clear();
                self.resync = true;
                if !self.skip_to_newline()? {
                    return Ok(None);
                }
                continue;
            }
            self.line_buf.push(b);
        }
        Ok(None)
    }

    /// Wait for one `\n`-terminated line. `None` waits indefinitely.
    pub fn read_line(&mut self, timeout: Option<Duration>, ticker: &mut Ticker) -> LinkResult<String> {
        let deadline = ticker.deadline(timeout);
        loop {
            if let Some(line) = self.try_read_line()? {
                return Ok(line);
            }
            if ticker.expired(deadline) {
                return Err(FillerError::Timeout);
            }
            ticker.wait(self.poll)?;
        }
    }

    /// Blocking write; returns once the bytes are flushed to the OS.
    pub fn write(&mut self, bytes: &[u8]) -> LinkResult<()> {
        self.endpoint.write_all(bytes).map_err(from_boxed)?;
        self.endpoint.flush().map_err(from_boxed)
    }

    pub fn send(&mut self, out: Outgoing) -> LinkResult<()> {
        tracing::trace!(port = %self.port, frame = ?out, "send");
        self.write(&out.encode())
    }

    /// Write one byte at a time with `gap` between bytes.
    pub fn send_paced(&mut self, bytes: &[u8], gap: Duration, ticker: &mut Ticker) -> LinkResult<()> {
        for (i, b) in bytes.iter().enumerate() {
            if i > 0 && !gap.is_zero() {
                ticker.wait(gap)?;
            }
            self.write(std::slice::from_ref(b))?;
        }
        Ok(())
    }

    /// Drop everything buffered on the input side; returns how many bytes were pending.
    pub fn discard_input(&mut self) -> LinkResult<usize> {
        let pending = self.bytes_available()? + self.line_buf.len();
        self.line_buf.clear();
        self.resync = false;
        self.endpoint.clear_input().map_err(from_boxed)?;
        if pending > 0 {
            tracing::debug!(port = %self.port, pending, "discarded stray input");
        }
        Ok(pending)
    }

    /// Decode one frame if an opcode byte is already buffered.
    ///
    /// The payload line of a payload-bearing opcode is awaited for at most
    /// [`PAYLOAD_LINE_TIMEOUT`]. If it does not complete, whatever arrives up
    /// to the next `\n` is discarded so a late payload is never read as opcodes.
    pub fn try_read_frame(&mut self, ticker: &mut Ticker) -> LinkResult<Option<Frame>> {
        if !self.skip_to_newline()? {
            return Ok(None);
        }
        let Some(b) = self.try_read_byte()? else {
            return Ok(None);
        };
        let opcode = Opcode::try_from(b)?;
        if opcode.payload_kind() == PayloadKind::None {
            return Ok(Some(Frame::bare(opcode)));
        }
        let line = match self.read_line(Some(PAYLOAD_LINE_TIMEOUT), ticker) {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!(port = %self.port, ?opcode, error = %e, "payload line incomplete; resyncing");
                self.line_buf.clear();
                self.resync = true;
                return Err(e);
            }
        };
        let payload = parse_payload(opcode, &line)?;
        Ok(Some(Frame { opcode, payload }))
    }

    /// Wait for the next frame. `None` waits indefinitely.
    pub fn read_frame(&mut self, timeout: Option<Duration>, ticker: &mut Ticker) -> LinkResult<Frame> {
        let deadline = ticker.deadline(timeout);
        loop {
            if let Some(frame) = self.try_read_frame(ticker)? {
                return Ok(frame);
            }
            if ticker.expired(deadline) {
                return Err(FillerError::Timeout);
            }
            ticker.wait(self.poll)?;
        }
    }

    pub fn close(mut self) {
        if let Err(e) = self.endpoint.flush() {
            tracing::debug!(port = %self.port, error = %e, "flush on close failed");
        }
        tracing::debug!(port = %self.port, "link closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::ScriptedEndpoint;
    use crate::protocol::Payload;
    use filler_traits::clock::test_clock::TestClock;
    use std::sync::Arc;

    fn ticker(clock: &TestClock) -> Ticker {
        Ticker::new(Arc::new(clock.clone()))
    }

    #[test]
    fn read_line_times_out_in_poll_increments() {
        let clock = TestClock::new();
        let mut t = ticker(&clock);
        let (ep, _h) = ScriptedEndpoint::new("/dev/ttyACM0");
        let mut link = StationLink::new(Box::new(ep));
        let err = link.read_line(Some(Duration::from_millis(450)), &mut t).unwrap_err();
        assert_eq!(err, FillerError::Timeout);
        assert_eq!(clock.elapsed(), Duration::from_millis(500));
    }

    #[test]
    fn frame_with_payload_is_decoded() {
        let clock = TestClock::new();
        let mut t = ticker(&clock);
        let (ep, h) = ScriptedEndpoint::new("p");
        h.push(b"\x04123.5\r\n\x12");
        let mut link = StationLink::new(Box::new(ep));
        let f = link.read_frame(None, &mut t).unwrap();
        assert_eq!(f.opcode, Opcode::CurrentWeight);
        assert_eq!(f.payload, Some(Payload::Float(123.5)));
        assert_eq!(link.read_frame(None, &mut t).unwrap(), Frame::bare(Opcode::CalibrationStepDone));
    }

    #[test]
    fn late_payload_after_timeout_does_not_corrupt_the_next_frame() {
        let clock = TestClock::new();
        let mut t = ticker(&clock);
        let (ep, h) = ScriptedEndpoint::new("p");
        let mut link = StationLink::new(Box::new(ep));
        h.push(b"\x04");
        h.push(b"12");
        assert_eq!(link.try_read_frame(&mut t).unwrap_err(), FillerError::Timeout);

        // Tail of the timed-out line, then a good reading.
        h.push(b"5\n\x043.0\n");
        let f = link.read_frame(None, &mut t).unwrap();
        assert_eq!(f.opcode, Opcode::CurrentWeight);
        assert_eq!(f.payload, Some(Payload::Float(3.0)));
    }

    #[test]
    fn malformed_payload_leaves_the_next_frame_intact() {
        let clock = TestClock::new();
        let mut t = ticker(&clock);
        let (ep, h) = ScriptedEndpoint::new("p");
        h.push(b"\x04abc\n\x047.5\n");
        let mut link = StationLink::new(Box::new(ep));
        assert!(matches!(
            link.try_read_frame(&mut t).unwrap_err(),
            FillerError::MalformedPayload { .. }
        ));
        assert_eq!(
            link.read_frame(None, &mut t).unwrap().payload,
            Some(Payload::Float(7.5))
        );
    }

    #[test]
    fn overlong_line_is_dropped_and_reading_continues() {
        let clock = TestClock::new();
        let mut t = ticker(&clock);
        let (ep, h) = ScriptedEndpoint::new("p");
        h.push(&vec![b'x'; MAX_LINE_LEN * 4]);
        let mut link = StationLink::new(Box::new(ep));
        assert_eq!(link.try_read_line().unwrap(), None);
        assert!(link.line_buf.len() <= MAX_LINE_LEN);

        h.push(b"tail\nSCL1001\n");
        assert_eq!(link.read_line(Some(Duration::from_secs(1)), &mut t).unwrap(), "SCL1001");
    }

    #[test]
    fn io_error_surfaces_as_link_failure() {
        let (ep, h) = ScriptedEndpoint::new("p");
        h.fail_io();
        let mut link = StationLink::new(Box::new(ep));
        assert!(link.write(&[0x09]).unwrap_err().is_link_failure());
    }

    #[test]
    fn paced_probe_waits_between_bytes() {
        let clock = TestClock::new();
        let mut t = ticker(&clock);
        let (ep, h) = ScriptedEndpoint::new("p");
        let mut link = StationLink::new(Box::new(ep));
        link.send_paced(b"PMID", Duration::from_millis(50), &mut t).unwrap();
        assert_eq!(h.written(), b"PMID".to_vec());
        assert_eq!(clock.elapsed(), Duration::from_millis(150));
    }
}
