//! Authoritative in-memory table of stations, keyed by slot index.
//!
//! Invariant: a station that is not connected has no link and is in
//! [`SessionState::Disconnected`]. Every mutation goes through methods that
//! keep this true; a connected station may have its link lent to the
//! background poller, in which case `link` is temporarily `None`.

use std::fmt;

use crate::atomic::WeightCell;
use crate::error::{FillerError, LinkResult, Result};
use crate::link::StationLink;
use crate::protocol::StationEvent;
use crate::store::SettingsStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Idle,
    Taring,
    Calibrating,
    FillingAuto,
    FillingManual,
    FillingSmart,
    Error,
}

impl SessionState {
    pub fn is_filling(self) -> bool {
        matches!(
            self,
            SessionState::FillingAuto | SessionState::FillingManual | SessionState::FillingSmart
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Static description of one configured slot.
#[derive(Debug, Clone, PartialEq)]
pub struct StationSpec {
    pub serial_id: String,
    pub calibration_factor: f32,
    pub enabled: bool,
}

impl StationSpec {
    pub fn new(serial_id: impl Into<String>) -> Self {
        Self {
            serial_id: serial_id.into(),
            calibration_factor: filler_config::settings::DEFAULT_CALIBRATION,
            enabled: true,
        }
    }
}

#[derive(Debug)]
pub struct Station {
    index: usize,
    serial_id: String,
    port: Option<String>,
    link: Option<StationLink>,
    connected: bool,
    enabled: bool,
    calibration_factor: f32,
    weight: WeightCell,
    state: SessionState,
}

impl Station {
    fn new(index: usize, spec: StationSpec) -> Self {
        Self {
            index,
            serial_id: spec.serial_id,
            port: None,
            link: None,
            connected: false,
            enabled: spec.enabled,
            calibration_factor: spec.calibration_factor,
            weight: WeightCell::default(),
            state: SessionState::Disconnected,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }
    pub fn serial_id(&self) -> &str {
        &self.serial_id
    }
    /// Port the device was last attached on (informational).
    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }
    pub fn is_connected(&self) -> bool {
        self.connected
    }
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
    pub fn is_active(&self) -> bool {
        self.connected && self.enabled
    }
    pub fn calibration_factor(&self) -> f32 {
        self.calibration_factor
    }
    pub fn set_calibration_factor(&mut self, factor: f32) {
        self.calibration_factor = factor;
    }
    pub fn current_weight(&self) -> f32 {
        self.weight.load()
    }
    pub fn state(&self) -> SessionState {
        self.state
    }
    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }

    pub fn link_mut(&mut self) -> Option<&mut StationLink> {
        self.link.as_mut()
    }

    /// Move the link out for an exclusive owner (calibration, poller).
    pub fn take_link(&mut self) -> Option<StationLink> {
        self.link.take()
    }

    /// Hand a previously taken link back.
    pub fn put_link(&mut self, link: StationLink) -> LinkResult<()> {
        if !self.connected {
            return Err(FillerError::State(format!(
                "station {} is disconnected; cannot take back a link",
                self.index
            )));
        }
        self.link = Some(link);
        Ok(())
    }

    /// Move to `state`; only `Disconnected` is legal while not connected.
    pub fn set_state(&mut self, state: SessionState) -> LinkResult<()> {
        if !self.connected && state != SessionState::Disconnected {
            return Err(FillerError::State(format!(
                "station {} is disconnected; cannot enter {state}",
                self.index
            )));
        }
        if self.connected && state == SessionState::Disconnected {
            return Err(FillerError::State(format!(
                "station {}: use demote to disconnect",
                self.index
            )));
        }
        self.state = state;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct StationRegistry {
    stations: Vec<Station>,
}

impl StationRegistry {
    pub fn new(specs: Vec<StationSpec>) -> Self {
        Self {
            stations: specs
                .into_iter()
                .enumerate()
                .map(|(i, s)| Station::new(i, s))
                .collect(),
        }
    }

    /// Slots for `serials`, with calibration and enablement from `store`.
    pub fn from_settings(serials: &[String], store: &dyn SettingsStore) -> Result<Self> {
        let mut specs = Vec::with_capacity(serials.len());
        for (i, serial) in serials.iter().enumerate() {
            let mut spec = StationSpec::new(serial.clone());
            if let Some(f) = store.calibration(i)? {
                spec.calibration_factor = f;
            }
            if let Some(e) = store.enabled(i)? {
                spec.enabled = e;
            }
            specs.push(spec);
        }
        Ok(Self::new(specs))
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Station> {
        self.stations.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Station> {
        self.stations.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Station> {
        self.stations.get_mut(index)
    }

    fn slot(&mut self, index: usize) -> LinkResult<&mut Station> {
        self.stations
            .get_mut(index)
            .ok_or_else(|| FillerError::State(format!("no station slot {index}")))
    }

    pub fn set_enabled(&mut self, index: usize, enabled: bool) -> LinkResult<()> {
        let st = self.slot(index)?;
        if st.enabled != enabled {
            tracing::info!(station = index, enabled, "station enablement changed");
        }
        st.enabled = enabled;
        Ok(())
    }

    /// Slot whose configured serial id is `serial_id`.
    pub fn index_of_serial(&self, serial_id: &str) -> Option<usize> {
        self.stations.iter().position(|s| s.serial_id == serial_id)
    }

    /// Record a completed handshake: the station owns `link` from here on.
    pub fn attach(&mut self, index: usize, link: StationLink) -> LinkResult<()> {
        let st = self.slot(index)?;
        if st.connected {
            return Err(FillerError::State(format!("station {index} is already connected")));
        }
        tracing::info!(station = index, serial_id = %st.serial_id, port = %link.port(), "station attached");
        st.port = Some(link.port().to_string());
        st.link = Some(link);
        st.connected = true;
        st.state = SessionState::Idle;
        Ok(())
    }

    /// Drop the link and return the station to `Disconnected`.
    pub fn demote(&mut self, index: usize, reason: &str) {
        let Some(st) = self.stations.get_mut(index) else {
            return;
        };
        if st.connected {
            tracing::warn!(station = index, serial_id = %st.serial_id, reason, "station disconnected");
        }
        if let Some(link) = st.link.take() {
            link.close();
        }
        st.connected = false;
        st.port = None;
        st.state = SessionState::Disconnected;
    }

    /// Apply one device event with its bounding state transition.
    ///
    /// Any weight reading ends `Taring`; callers drain queued events before
    /// sending TARE so a reading taken earlier cannot acknowledge it.
    pub fn apply(&mut self, index: usize, event: &StationEvent) {
        let Some(st) = self.stations.get_mut(index) else {
            tracing::warn!(station = index, ?event, "event for unknown slot");
            return;
        };
        match event {
            StationEvent::Weight(w) => {
                st.weight.store(*w);
                if st.state == SessionState::Taring {
                    st.state = SessionState::Idle;
                }
            }
            StationEvent::FinalWeight(w) => {
                st.weight.store(*w);
                if st.state.is_filling() {
                    st.state = SessionState::Idle;
                }
                tracing::info!(station = index, grams = *w, "fill finished");
            }
            StationEvent::RelayDeactivated => {
                if st.state.is_filling() {
                    st.state = SessionState::Idle;
                }
            }
            StationEvent::EStop => {
                tracing::error!(station = index, "e-stop activated");
                if st.connected {
                    st.state = SessionState::Error;
                }
            }
            StationEvent::ButtonError | StationEvent::MaxWeightWarning => {
                tracing::warn!(station = index, ?event, "device warning");
            }
            StationEvent::LinkLost(reason) => self.demote(index, reason),
            other => tracing::trace!(station = index, event = ?other, "device event"),
        }
    }

    /// Live weights of every enabled and connected station, in slot order.
    pub fn snapshot_weights(&self) -> Vec<f32> {
        self.stations
            .iter()
            .filter(|s| s.is_active())
            .map(Station::current_weight)
            .collect()
    }

    pub fn active_indices(&self) -> Vec<usize> {
        self.stations
            .iter()
            .filter(|s| s.is_active())
            .map(Station::index)
            .collect()
    }

    pub fn connected_flags(&self) -> Vec<bool> {
        self.stations.iter().map(|s| s.connected).collect()
    }

    pub fn enabled_flags(&self) -> Vec<bool> {
        self.stations.iter().map(|s| s.enabled).collect()
    }

    /// Ports currently owned by connected stations.
    pub fn attached_ports(&self) -> Vec<String> {
        self.stations
            .iter()
            .filter(|s| s.connected)
            .filter_map(|s| s.port.clone())
            .collect()
    }

    pub fn weight_cell(&self, index: usize) -> Option<WeightCell> {
        self.stations.get(index).map(|s| s.weight.clone())
    }

    /// Move every attached link out, paired with its slot and weight cell.
    pub fn lend_links(&mut self) -> Vec<(usize, StationLink, WeightCell)> {
        self.stations
            .iter_mut()
            .filter_map(|s| s.link.take().map(|l| (s.index, l, s.weight.clone())))
            .collect()
    }

    /// Take links back from the poller. Links for stations demoted meanwhile are closed.
    pub fn return_links(&mut self, links: Vec<(usize, StationLink)>) {
        for (index, link) in links {
            match self.stations.get_mut(index) {
                Some(st) if st.connected && st.link.is_none() => st.link = Some(link),
                _ => {
                    tracing::debug!(station = index, "dropping returned link");
                    link.close();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::ScriptedEndpoint;

    fn link(port: &str) -> StationLink {
        StationLink::new(Box::new(ScriptedEndpoint::new(port).0))
    }

    fn registry(n: usize) -> StationRegistry {
        StationRegistry::new((0..n).map(|i| StationSpec::new(format!("SCL{}", 1000 + i))).collect())
    }

    #[test]
    fn snapshot_follows_slot_order_and_skips_inactive() {
        let mut r = registry(3);
        r.attach(2, link("b")).unwrap();
        r.attach(0, link("a")).unwrap();
        r.apply(0, &StationEvent::Weight(1.0));
        r.apply(2, &StationEvent::Weight(3.0));
        assert_eq!(r.snapshot_weights(), vec![1.0, 3.0]);
        r.set_enabled(0, false).unwrap();
        assert_eq!(r.snapshot_weights(), vec![3.0]);
    }

    #[test]
    fn disconnected_station_rejects_live_states() {
        let mut r = registry(1);
        let err = r.get_mut(0).unwrap().set_state(SessionState::Idle).unwrap_err();
        assert!(matches!(err, FillerError::State(_)));
    }

    #[test]
    fn link_lost_demotes() {
        let mut r = registry(1);
        r.attach(0, link("a")).unwrap();
        r.apply(0, &StationEvent::LinkLost("unplugged".into()));
        let st = r.get(0).unwrap();
        assert!(!st.is_connected());
        assert!(!st.has_link());
        assert_eq!(st.state(), SessionState::Disconnected);
    }

    #[test]
    fn returned_link_for_demoted_station_is_dropped() {
        let mut r = registry(2);
        r.attach(0, link("a")).unwrap();
        r.attach(1, link("b")).unwrap();
        let lent: Vec<_> = r.lend_links().into_iter().map(|(i, l, _)| (i, l)).collect();
        assert!(r.get(0).unwrap().is_connected());
        r.demote(1, "test");
        r.return_links(lent);
        assert!(r.get(0).unwrap().has_link());
        assert!(!r.get(1).unwrap().has_link());
    }
}
