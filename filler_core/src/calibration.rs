//! Interactive calibration exchange for one connected station.
//!
//! The session takes exclusive ownership of the station's link for its whole
//! duration and hands it back at the end. The new factor is persisted only
//! after the device reports it; a link failure at any step demotes the station
//! and leaves the previous factor untouched.

use std::time::Duration;

use crate::error::{FillerError, LinkResult};
use crate::link::StationLink;
use crate::protocol::{Frame, Opcode, Outgoing, StationEvent};
use crate::registry::{SessionState, StationRegistry};
use crate::sched::Ticker;
use crate::store::SettingsStore;

/// Operator side of the two human steps.
pub trait CalibrationOperator {
    /// Ask the operator to empty the scale; `false` aborts the session.
    fn confirm_scale_empty(&mut self, station: usize) -> bool;
    /// Reference weight placed on the scale; `None` aborts the session.
    fn reference_weight(&mut self, station: usize, default_g: f32) -> Option<f32>;
}

#[derive(Debug, Clone)]
pub struct CalibrationSession {
    index: usize,
    default_reference_g: f32,
    /// Per-step device wait; `None` waits indefinitely.
    step_timeout: Option<Duration>,
}

impl CalibrationSession {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            default_reference_g: 500.0,
            step_timeout: None,
        }
    }

    pub fn default_reference(mut self, grams: f32) -> Self {
        self.default_reference_g = grams;
        self
    }

    pub fn step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Run all steps and return the persisted factor.
    pub fn run(
        &self,
        registry: &mut StationRegistry,
        operator: &mut dyn CalibrationOperator,
        settings: &mut dyn SettingsStore,
        ticker: &mut Ticker,
    ) -> LinkResult<f32> {
        let index = self.index;
        let st = registry
            .get_mut(index)
            .ok_or_else(|| FillerError::State(format!("no station slot {index}")))?;
        if !st.is_connected() {
            return Err(FillerError::State(format!("station {index} is not connected")));
        }
        let Some(mut link) = st.take_link() else {
            return Err(FillerError::State(format!("station {index} link is in use")));
        };
        let previous = st.calibration_factor();
        st.set_state(SessionState::Calibrating)?;
        tracing::info!(station = index, previous, "calibration started");

        let res = self.exchange(&mut link, registry, operator, ticker);
        match res {
            Ok(factor) => {
                if let Some(st) = registry.get_mut(index) {
                    st.put_link(link)?;
                    st.set_state(SessionState::Idle)?;
                }
                settings
                    .set_calibration(index, factor)
                    .map_err(|e| FillerError::Config(format!("{e:#}")))?;
                if let Some(st) = registry.get_mut(index) {
                    st.set_calibration_factor(factor);
                }
                tracing::info!(station = index, previous, factor, "calibration persisted");
                Ok(factor)
            }
            Err(e) if e.is_link_failure() => {
                drop(link);
                registry.demote(index, &e.to_string());
                Err(e)
            }
            Err(e) => {
                tracing::warn!(station = index, error = %e, "calibration abandoned");
                if let Some(st) = registry.get_mut(index) {
                    st.put_link(link)?;
                    st.set_state(SessionState::Idle)?;
                }
                Err(e)
            }
        }
    }

    fn exchange(
        &self,
        link: &mut StationLink,
        registry: &StationRegistry,
        operator: &mut dyn CalibrationOperator,
        ticker: &mut Ticker,
    ) -> LinkResult<f32> {
        let index = self.index;
        link.send(Outgoing::Command(Opcode::ResetCalibration))?;

        if !operator.confirm_scale_empty(index) {
            return Err(FillerError::Cancelled);
        }
        link.discard_input()?;
        link.send(Outgoing::Command(Opcode::CalibrationContinue))?;
        self.wait_for(link, registry, ticker, |f| {
            (f.opcode == Opcode::CalibrationStepDone).then_some(())
        })?;

        let reference = operator
            .reference_weight(index, self.default_reference_g)
            .ok_or(FillerError::Cancelled)?;
        if !(reference.is_finite() && reference > 0.0) {
            return Err(FillerError::State(format!(
                "reference weight must be > 0, got {reference}"
            )));
        }
        link.send(Outgoing::Value(Opcode::CalibrationWeight, reference))?;
        self.wait_for(link, registry, ticker, |f| {
            (f.opcode == Opcode::CalibrationStepDone).then_some(())
        })?;

        link.send(Outgoing::Command(Opcode::CalibrationContinue))?;
        self.wait_for(link, registry, ticker, |f| match f.into_event() {
            StationEvent::CalibrationWeight(v) => Some(v),
            _ => None,
        })
    }

    /// Read frames until `pick` accepts one. Malformed or unknown frames are
    /// logged and skipped; weight events keep the live reading current.
    fn wait_for<T>(
        &self,
        link: &mut StationLink,
        registry: &StationRegistry,
        ticker: &mut Ticker,
        pick: impl Fn(Frame) -> Option<T>,
    ) -> LinkResult<T> {
        let deadline = ticker.deadline(self.step_timeout);
        loop {
            match link.try_read_frame(ticker) {
                Ok(Some(frame)) => {
                    if let Some(v) = pick(frame) {
                        return Ok(v);
                    }
                    if let StationEvent::Weight(w) = frame.into_event()
                        && let Some(cell) = registry.weight_cell(self.index)
                    {
                        cell.store(w);
                    }
                    tracing::trace!(station = self.index, opcode = %frame.opcode, "ignored during calibration");
                    continue;
                }
                Ok(None) => {}
                Err(e @ (FillerError::MalformedPayload { .. } | FillerError::UnknownOpcode(_))) => {
                    tracing::warn!(station = self.index, error = %e, "bad frame during calibration");
                    continue;
                }
                Err(FillerError::Timeout) => {
                    tracing::warn!(station = self.index, "payload line timed out during calibration");
                }
                Err(e) => return Err(e),
            }
            if ticker.expired(deadline) {
                return Err(FillerError::Timeout);
            }
            ticker.wait(link.poll_interval())?;
        }
    }
}
