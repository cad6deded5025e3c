//! Persisted machine settings as seen by the core.
//!
//! The core never touches files: calibration factors, enabled flags and bottle
//! profiles are read and written through [`SettingsStore`].

use crate::error::Result;

/// Inclusive weight band in grams.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightRange {
    pub min: f32,
    pub max: f32,
}

impl WeightRange {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn contains(&self, grams: f32) -> bool {
        grams >= self.min && grams <= self.max
    }

    /// True when every weight lies in the band. An empty list never matches.
    pub fn contains_all(&self, weights: &[f32]) -> bool {
        !weights.is_empty() && weights.iter().all(|w| self.contains(*w))
    }
}

impl std::fmt::Display for WeightRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={} g", self.min, self.max)
    }
}

/// Bottle profile, immutable once selected for a startup run.
#[derive(Debug, Clone, PartialEq)]
pub struct BottleProfile {
    pub id: String,
    pub full: WeightRange,
    pub empty: WeightRange,
    pub target_g: f32,
    pub time_limit_ms: u64,
}

pub trait SettingsStore {
    /// Persisted calibration factor for a slot, if any.
    fn calibration(&self, index: usize) -> Result<Option<f32>>;
    fn set_calibration(&mut self, index: usize, factor: f32) -> Result<()>;
    fn enabled(&self, index: usize) -> Result<Option<bool>>;
    fn set_enabled(&mut self, index: usize, enabled: bool) -> Result<()>;
    /// Profiles in config order; `full_tolerance_g` derives missing full ranges.
    fn bottle_profiles(&self, full_tolerance_g: f32) -> Result<Vec<BottleProfile>>;
}
