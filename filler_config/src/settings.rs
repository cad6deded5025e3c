//! Persisted key=value settings.
//!
//! ```text
//! # comment
//! station0_calibration=412.5
//! station0_enabled=true
//! bottle_500ml=500:180-220:30000
//! bottle_1l=1000:300-340:45000:1280-1360
//! ```
//!
//! Line order is preserved on load and save; bottle profiles are reported in
//! file order, which is the tie-break order during full-bottle matching.

use std::path::{Path, PathBuf};

use eyre::WrapErr;

use crate::atomic::write_atomic;

const BOTTLE_PREFIX: &str = "bottle_";

/// Calibration factor assumed for a slot with nothing persisted.
pub const DEFAULT_CALIBRATION: f32 = 1.0;

/// One `bottle_<id>` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct BottleRecord {
    pub id: String,
    pub target_g: f32,
    pub empty_min_g: f32,
    pub empty_max_g: f32,
    pub time_limit_ms: u64,
    /// Explicit full range; derived from target and tolerance when absent.
    pub full: Option<(f32, f32)>,
}

fn parse_range(s: &str, what: &str) -> eyre::Result<(f32, f32)> {
    let (lo, hi) = s
        .split_once('-')
        .ok_or_else(|| eyre::eyre!("{what} range '{s}' must be <min>-<max>"))?;
    let lo: f32 = lo
        .trim()
        .parse()
        .wrap_err_with(|| format!("{what} range minimum '{lo}'"))?;
    let hi: f32 = hi
        .trim()
        .parse()
        .wrap_err_with(|| format!("{what} range maximum '{hi}'"))?;
    if !(lo.is_finite() && hi.is_finite()) || lo > hi {
        eyre::bail!("{what} range '{s}' is empty or not finite");
    }
    Ok((lo, hi))
}

impl BottleRecord {
    /// Parse the value half of `bottle_<id>=<target>:<empty>:<time_limit>[:<full>]`.
    pub fn parse(id: &str, value: &str) -> eyre::Result<Self> {
        let parts: Vec<&str> = value.split(':').map(str::trim).collect();
        if !(3..=4).contains(&parts.len()) {
            eyre::bail!(
                "bottle_{id}: expected <target>:<empty_min>-<empty_max>:<time_limit_ms>[:<full_min>-<full_max>], got '{value}'"
            );
        }
        let target_g: f32 = parts[0]
            .parse()
            .wrap_err_with(|| format!("bottle_{id}: target weight '{}'", parts[0]))?;
        if !(target_g.is_finite() && target_g > 0.0) {
            eyre::bail!("bottle_{id}: target weight must be > 0");
        }
        let (empty_min_g, empty_max_g) =
            parse_range(parts[1], "empty").wrap_err_with(|| format!("bottle_{id}"))?;
        let time_limit_ms: u64 = parts[2]
            .parse()
            .wrap_err_with(|| format!("bottle_{id}: time limit '{}'", parts[2]))?;
        let full = match parts.get(3) {
            Some(s) => Some(parse_range(s, "full").wrap_err_with(|| format!("bottle_{id}"))?),
            None => None,
        };
        Ok(Self {
            id: id.to_string(),
            target_g,
            empty_min_g,
            empty_max_g,
            time_limit_ms,
            full,
        })
    }

    /// Full range, derived as empty range + target +/- tolerance when not stored.
    pub fn full_range(&self, tolerance_g: f32) -> (f32, f32) {
        self.full.unwrap_or((
            self.empty_min_g + self.target_g - tolerance_g,
            self.empty_max_g + self.target_g + tolerance_g,
        ))
    }

    fn encode(&self) -> String {
        let mut v = format!(
            "{}:{}-{}:{}",
            self.target_g, self.empty_min_g, self.empty_max_g, self.time_limit_ms
        );
        if let Some((lo, hi)) = self.full {
            v.push_str(&format!(":{lo}-{hi}"));
        }
        v
    }
}

/// One line of the settings file.
#[derive(Debug, Clone, PartialEq)]
enum Line {
    /// `#` comment, kept verbatim.
    Comment(String),
    Entry(String, String),
}

/// Ordered key=value store, optionally bound to a file.
///
/// Comment lines survive a load/save cycle in place; blank lines do not.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    lines: Vec<Line>,
    path: Option<PathBuf>,
}

impl Settings {
    /// In-memory settings with no backing file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse key=value text. Blank lines are skipped.
    pub fn parse(text: &str) -> eyre::Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b'=')
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .quoting(false)
            .from_reader(text.as_bytes());

        let mut settings = Self::new();
        for (idx, rec) in rdr.records().enumerate() {
            let rec = rec.map_err(|e| eyre::eyre!("invalid settings line {}: {}", idx + 1, e))?;
            let Some(key) = rec.get(0).filter(|k| !k.is_empty()) else {
                continue;
            };
            if key.starts_with('#') {
                let line = rec
                    .position()
                    .and_then(|p| text.get(p.byte() as usize..))
                    .and_then(|rest| rest.lines().map(str::trim).find(|l| !l.is_empty()))
                    .map_or_else(|| rec.iter().collect::<Vec<_>>().join("="), str::to_string);
                settings.lines.push(Line::Comment(line));
                continue;
            }
            if rec.len() < 2 {
                eyre::bail!("settings key '{key}' has no value");
            }
            let value = rec.iter().skip(1).collect::<Vec<_>>().join("=");
            settings.set(key, value);
        }
        Ok(settings)
    }

    /// Load settings from `path`; a missing file yields empty settings bound to it.
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let mut settings = if path.exists() {
            let text = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("read settings {}", path.display()))?;
            Self::parse(&text).wrap_err_with(|| format!("parse settings {}", path.display()))?
        } else {
            tracing::info!(path = %path.display(), "settings file not found; starting empty");
            Self::new()
        };
        settings.path = Some(path.to_path_buf());
        Ok(settings)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write back to the bound file (no-op for in-memory settings).
    pub fn save(&self) -> eyre::Result<()> {
        if let Some(path) = &self.path {
            write_atomic(path, self.render().as_bytes())
                .wrap_err_with(|| format!("write settings {}", path.display()))?;
            tracing::debug!(path = %path.display(), entries = self.entries().count(), "settings saved");
        }
        Ok(())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Comment(text) => out.push_str(text),
                Line::Entry(k, v) => {
                    out.push_str(k);
                    out.push('=');
                    out.push_str(v);
                }
            }
            out.push('\n');
        }
        out
    }

    fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().filter_map(|l| match l {
            Line::Entry(k, v) => Some((k.as_str(), v.as_str())),
            Line::Comment(_) => None,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Insert or replace; existing keys keep their position.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let existing = self.lines.iter_mut().find_map(|l| match l {
            Line::Entry(k, v) if k.as_str() == key => Some(v),
            _ => None,
        });
        match existing {
            Some(v) => *v = value,
            None => self.lines.push(Line::Entry(key.to_string(), value)),
        }
    }

    pub fn station_calibration(&self, index: usize) -> eyre::Result<Option<f32>> {
        let key = format!("station{index}_calibration");
        match self.get(&key) {
            None => Ok(None),
            Some(v) => {
                let f: f32 = v.parse().wrap_err_with(|| format!("{key}='{v}'"))?;
                if !f.is_finite() {
                    eyre::bail!("{key} must be finite");
                }
                Ok(Some(f))
            }
        }
    }

    pub fn set_station_calibration(&mut self, index: usize, factor: f32) {
        self.set(&format!("station{index}_calibration"), factor.to_string());
    }

    pub fn station_enabled(&self, index: usize) -> eyre::Result<Option<bool>> {
        let key = format!("station{index}_enabled");
        match self.get(&key) {
            None => Ok(None),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Some(true)),
                "false" | "0" | "no" => Ok(Some(false)),
                _ => eyre::bail!("{key} must be true or false, got '{v}'"),
            },
        }
    }

    pub fn set_station_enabled(&mut self, index: usize, enabled: bool) {
        self.set(&format!("station{index}_enabled"), enabled.to_string());
    }

    /// All bottle records in file order.
    pub fn bottles(&self) -> eyre::Result<Vec<BottleRecord>> {
        self.entries()
            .filter_map(|(k, v)| k.strip_prefix(BOTTLE_PREFIX).map(|id| (id, v)))
            .map(|(id, v)| BottleRecord::parse(id, v))
            .collect()
    }

    pub fn set_bottle(&mut self, record: &BottleRecord) {
        self.set(&format!("{BOTTLE_PREFIX}{}", record.id), record.encode());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_duplicate_key_replaces_value_in_place() {
        let s = Settings::parse("a=1\nb=2\na=3\n").unwrap();
        assert_eq!(s.get("a"), Some("3"));
        assert_eq!(s.render(), "a=3\nb=2\n");
    }

    #[test]
    fn comments_keep_their_place_across_updates() {
        let mut s = Settings::parse("# calibrated 2026-03-01\nstation0_calibration=412.5\n\n  # bottles\nbottle_a=500:180-220:30000\n").unwrap();
        s.set_station_calibration(0, 415.0);
        s.set_station_enabled(1, false);
        assert_eq!(
            s.render(),
            "# calibrated 2026-03-01\nstation0_calibration=415\n# bottles\nbottle_a=500:180-220:30000\nstation1_enabled=false\n"
        );
        assert_eq!(s.bottles().unwrap().len(), 1);
        assert_eq!(s.get("# bottles"), None);
    }

    #[test]
    fn derived_full_range_adds_target_and_tolerance() {
        let b = BottleRecord::parse("500ml", "500:180-220:30000").unwrap();
        assert_eq!(b.full_range(10.0), (670.0, 730.0));
    }

    #[test]
    fn stored_full_range_wins() {
        let b = BottleRecord::parse("1l", "1000:300-340:45000:1280-1360").unwrap();
        assert_eq!(b.full_range(10.0), (1280.0, 1360.0));
    }
}
