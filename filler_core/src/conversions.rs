//! `From` implementations bridging `filler_config` types to `filler_core` types,
//! and the `SettingsStore` implementation over the persisted settings file.

use std::time::Duration;

use filler_config::{BottleRecord, Settings};

use crate::error::Result;
use crate::handshake::{HandshakeCfg, HandshakeProfile};
use crate::startup::StartupCfg;
use crate::store::{BottleProfile, SettingsStore, WeightRange};

// ── Handshake ────────────────────────────────────────────────────────────────

impl From<filler_config::HandshakeProfile> for HandshakeProfile {
    fn from(p: filler_config::HandshakeProfile) -> Self {
        match p {
            filler_config::HandshakeProfile::SerialTag => Self::SerialTag,
            filler_config::HandshakeProfile::GetId => Self::GetId,
        }
    }
}

impl From<&filler_config::Config> for HandshakeCfg {
    fn from(c: &filler_config::Config) -> Self {
        let h = &c.handshake;
        Self {
            profile: h.profile.into(),
            baud: c.serial.baud,
            probe: h.probe.as_bytes().to_vec(),
            probe_gap: Duration::from_millis(h.probe_gap_ms),
            poll: Duration::from_millis(h.poll_ms),
            id_poll_attempts: h.id_poll_attempts,
            calibration_poll_attempts: h.calibration_poll_attempts,
        }
    }
}

// ── Startup ──────────────────────────────────────────────────────────────────

impl From<&filler_config::StartupCfg> for StartupCfg {
    fn from(c: &filler_config::StartupCfg) -> Self {
        Self {
            clear_threshold_g: c.clear_threshold_g,
            full_tolerance_g: c.full_tolerance_g,
            ui_poll: Duration::from_millis(c.ui_poll_ms),
            ..Self::default()
        }
    }
}

/// Per-step calibration wait; `0` in the config means unbounded.
pub fn calibration_step_timeout(c: &filler_config::CalibrationCfg) -> Option<Duration> {
    (c.step_timeout_ms > 0).then(|| Duration::from_millis(c.step_timeout_ms))
}

// ── Bottle profiles ──────────────────────────────────────────────────────────

impl BottleProfile {
    pub fn from_record(r: &BottleRecord, full_tolerance_g: f32) -> Self {
        let (full_min, full_max) = r.full_range(full_tolerance_g);
        Self {
            id: r.id.clone(),
            full: WeightRange::new(full_min, full_max),
            empty: WeightRange::new(r.empty_min_g, r.empty_max_g),
            target_g: r.target_g,
            time_limit_ms: r.time_limit_ms,
        }
    }
}

// ── Settings file ────────────────────────────────────────────────────────────

/// Writes persist immediately.
impl SettingsStore for Settings {
    fn calibration(&self, index: usize) -> Result<Option<f32>> {
        self.station_calibration(index)
    }

    fn set_calibration(&mut self, index: usize, factor: f32) -> Result<()> {
        self.set_station_calibration(index, factor);
        self.save()
    }

    fn enabled(&self, index: usize) -> Result<Option<bool>> {
        self.station_enabled(index)
    }

    fn set_enabled(&mut self, index: usize, enabled: bool) -> Result<()> {
        self.set_station_enabled(index, enabled);
        self.save()
    }

    fn bottle_profiles(&self, full_tolerance_g: f32) -> Result<Vec<BottleProfile>> {
        Ok(self
            .bottles()?
            .iter()
            .map(|r| BottleProfile::from_record(r, full_tolerance_g))
            .collect())
    }
}
