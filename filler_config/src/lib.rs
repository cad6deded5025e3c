#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas and persisted settings for the filling machine.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - `Settings` is the key=value store for per-station calibration,
//!   enablement and bottle profiles.
use serde::Deserialize;

pub mod atomic;
pub mod settings;

pub use settings::{BottleRecord, Settings};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SerialCfg {
    /// Fixed baud rate of the station device class.
    pub baud: u32,
    /// Candidate ports to scan. Empty means enumerate the system's ports.
    pub ports: Vec<String>,
}

impl Default for SerialCfg {
    fn default() -> Self {
        Self {
            baud: 9600,
            ports: Vec::new(),
        }
    }
}

/// One physical fill slot. The slot index is the position in `[[stations]]`.
#[derive(Debug, Deserialize, Clone)]
pub struct StationCfg {
    /// Manufacturer serial id the device reports during the handshake.
    pub serial_id: String,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeProfile {
    /// Reset, paced `PMID` probe, serial id extracted from the reply line.
    #[default]
    SerialTag,
    /// Legacy tooling: a single GET_ID opcode answered with an integer.
    GetId,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HandshakeCfg {
    pub profile: HandshakeProfile,
    /// Identification probe, written one byte at a time.
    pub probe: String,
    /// Delay between probe bytes for devices with slow input buffers.
    pub probe_gap_ms: u64,
    /// Poll increment for every handshake wait.
    pub poll_ms: u64,
    /// Polls allowed for the identity line (60 x 100 ms by default).
    pub id_poll_attempts: u32,
    /// Polls allowed for the calibration request (40 x 100 ms by default).
    pub calibration_poll_attempts: u32,
}

impl Default for HandshakeCfg {
    fn default() -> Self {
        Self {
            profile: HandshakeProfile::SerialTag,
            probe: "PMID".to_string(),
            probe_gap_ms: 50,
            poll_ms: 100,
            id_poll_attempts: 60,
            calibration_poll_attempts: 40,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StartupCfg {
    /// Any active scale above this reading asks the operator to confirm before tare.
    pub clear_threshold_g: f32,
    /// Tolerance used to derive a bottle's full range when none is stored.
    pub full_tolerance_g: f32,
    /// Poll interval while waiting for the operator.
    pub ui_poll_ms: u64,
}

impl Default for StartupCfg {
    fn default() -> Self {
        Self {
            clear_threshold_g: 20.0,
            full_tolerance_g: 15.0,
            ui_poll_ms: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CalibrationCfg {
    /// Reference weight offered to the operator as the default.
    pub default_reference_g: f32,
    /// Per-step device wait; 0 waits indefinitely.
    pub step_timeout_ms: u64,
}

impl Default for CalibrationCfg {
    fn default() -> Self {
        Self {
            default_reference_g: 500.0,
            step_timeout_ms: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SettingsCfg {
    /// Path of the persisted key=value settings file.
    pub path: String,
}

impl Default for SettingsCfg {
    fn default() -> Self {
        Self {
            path: "etc/filler_settings.txt".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Orchestrator and serial polling share the caller's thread.
    #[default]
    Cooperative,
    /// A background thread owns the links and ships snapshots over a channel.
    Worker,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RunnerCfg {
    pub mode: RunMode,
    /// Poll period of the background station thread.
    pub worker_poll_ms: u64,
}

impl Default for RunnerCfg {
    fn default() -> Self {
        Self {
            mode: RunMode::Cooperative,
            worker_poll_ms: 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialCfg,
    pub stations: Vec<StationCfg>,
    #[serde(default)]
    pub handshake: HandshakeCfg,
    #[serde(default)]
    pub startup: StartupCfg,
    #[serde(default)]
    pub calibration: CalibrationCfg,
    #[serde(default)]
    pub settings: SettingsCfg,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub runner: RunnerCfg,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Stations
        if self.stations.is_empty() {
            eyre::bail!("stations must list at least one station");
        }
        for (i, st) in self.stations.iter().enumerate() {
            if st.serial_id.trim().is_empty() {
                eyre::bail!("stations[{i}].serial_id must not be empty");
            }
            if self.stations[..i].iter().any(|o| o.serial_id == st.serial_id) {
                eyre::bail!("stations[{i}].serial_id '{}' is duplicated", st.serial_id);
            }
        }

        // Serial
        if self.serial.baud == 0 {
            eyre::bail!("serial.baud must be > 0");
        }

        // Handshake
        if self.handshake.probe.is_empty() {
            eyre::bail!("handshake.probe must not be empty");
        }
        // Probe bytes must stay outside the device opcode bands.
        if !self.handshake.probe.bytes().all(|b| b.is_ascii_graphic()) {
            eyre::bail!("handshake.probe must be printable ASCII");
        }
        if self.handshake.poll_ms == 0 {
            eyre::bail!("handshake.poll_ms must be >= 1");
        }
        if self.handshake.id_poll_attempts == 0 {
            eyre::bail!("handshake.id_poll_attempts must be >= 1");
        }
        if self.handshake.calibration_poll_attempts == 0 {
            eyre::bail!("handshake.calibration_poll_attempts must be >= 1");
        }
        if self.handshake.probe_gap_ms > 5_000 {
            eyre::bail!("handshake.probe_gap_ms is unreasonably large (>5s)");
        }

        // Startup
        if !(self.startup.clear_threshold_g.is_finite() && self.startup.clear_threshold_g >= 0.0) {
            eyre::bail!("startup.clear_threshold_g must be >= 0");
        }
        if !(self.startup.full_tolerance_g.is_finite() && self.startup.full_tolerance_g >= 0.0) {
            eyre::bail!("startup.full_tolerance_g must be >= 0");
        }
        if self.startup.ui_poll_ms == 0 {
            eyre::bail!("startup.ui_poll_ms must be >= 1");
        }

        // Calibration
        if !(self.calibration.default_reference_g.is_finite()
            && self.calibration.default_reference_g > 0.0)
        {
            eyre::bail!("calibration.default_reference_g must be > 0");
        }

        // Settings
        if self.settings.path.trim().is_empty() {
            eyre::bail!("settings.path must not be empty");
        }

        // Runner
        if self.runner.worker_poll_ms == 0 {
            eyre::bail!("runner.worker_poll_ms must be >= 1");
        }

        // Logging
        if let Some(rot) = self.logging.rotation.as_deref()
            && !matches!(rot, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never|daily|hourly");
        }

        Ok(())
    }

    /// Serial ids in slot order.
    pub fn station_serials(&self) -> Vec<String> {
        self.stations.iter().map(|s| s.serial_id.clone()).collect()
    }
}
