//! Step identities and results for the startup sequence.

use std::fmt;

/// Named steps of the startup sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepName {
    StationVerification,
    ClearAllScales,
    FillingModeSelection,
    FullBottleCheck,
    EmptyBottleCheck,
}

impl StepName {
    pub fn as_str(self) -> &'static str {
        match self {
            StepName::StationVerification => "station_verification",
            StepName::ClearAllScales => "clear_all_scales",
            StepName::FillingModeSelection => "filling_mode_selection",
            StepName::FullBottleCheck => "full_bottle_check",
            StepName::EmptyBottleCheck => "empty_bottle_check",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of running one step against the startup context.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    /// Advance to the next step.
    Completed,
    /// Return to the previous step.
    Backup,
    /// Operator chose manual filling; remaining steps are skipped.
    ManualSelected,
    /// Abort the whole sequence.
    Error(String),
}

/// How the orchestrator left the step list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupOutcome {
    /// Every step completed.
    Completed,
    /// Manual mode chosen; hand off without bottle checks.
    Manual,
}
