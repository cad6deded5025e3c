//! Startup orchestration: an ordered list of steps over one shared context.
//!
//! The driver advances on `Completed`, steps back exactly one on `Backup`,
//! stops early on `ManualSelected`, and aborts on `Error`. Steps wait for the
//! operator by draining a `UiSignal` channel on the scheduler tick; stale
//! signals are discarded before every prompt.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};

use crate::bus::StationBus;
use crate::error::{FillerError, LinkResult};
use crate::registry::StationRegistry;
use crate::sched::Ticker;
use crate::status::{StartupOutcome, StepName, StepResult};
use crate::steps::{
    ClearAllScales, EmptyBottleCheck, FillingModeSelection, FullBottleCheck, StationVerification,
};
use crate::store::{BottleProfile, SettingsStore, WeightRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FillMode {
    Auto,
    Manual,
    Smart,
}

impl fmt::Display for FillMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FillMode::Auto => "auto",
            FillMode::Manual => "manual",
            FillMode::Smart => "smart",
        })
    }
}

impl FromStr for FillMode {
    type Err = FillerError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(FillMode::Auto),
            "manual" => Ok(FillMode::Manual),
            "smart" => Ok(FillMode::Smart),
            other => Err(FillerError::Config(format!("unknown filling mode '{other}'"))),
        }
    }
}

/// Shared record threaded through every step.
#[derive(Debug)]
pub struct StartupContext {
    pub registry: StationRegistry,
    pub bottles: Vec<BottleProfile>,
    pub selected_bottle: Option<String>,
    pub filling_mode: Option<FillMode>,
    pub target_weight: Option<f32>,
    pub time_limit_ms: Option<u64>,
}

impl StartupContext {
    pub fn new(registry: StationRegistry, bottles: Vec<BottleProfile>) -> Self {
        Self {
            registry,
            bottles,
            selected_bottle: None,
            filling_mode: None,
            target_weight: None,
            time_limit_ms: None,
        }
    }

    pub fn connected(&self) -> Vec<bool> {
        self.registry.connected_flags()
    }

    pub fn enabled(&self) -> Vec<bool> {
        self.registry.enabled_flags()
    }

    pub fn selected_profile(&self) -> Option<&BottleProfile> {
        let id = self.selected_bottle.as_deref()?;
        self.bottles.iter().find(|b| b.id == id)
    }

    pub(crate) fn select(&mut self, profile: &BottleProfile) {
        self.selected_bottle = Some(profile.id.clone());
        self.target_weight = Some(profile.target_g);
        self.time_limit_ms = Some(profile.time_limit_ms);
    }
}

/// First profile, in config order, whose full range holds every weight.
pub fn first_full_match<'a>(profiles: &'a [BottleProfile], weights: &[f32]) -> Option<&'a BottleProfile> {
    profiles.iter().find(|p| p.full.contains_all(weights))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    Next,
    Back,
    /// Flip the enabled flag of one slot.
    Toggle(usize),
    SelectMode(FillMode),
    Rescan,
    Abort,
}

/// "Step completed" notification from the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UiSignal {
    pub step: StepName,
    pub action: UserAction,
}

/// What a step asks the operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    StationVerification { connected: Vec<bool>, enabled: Vec<bool> },
    ClearScales { weights: Vec<f32> },
    ConfirmScalesClear { weights: Vec<f32>, threshold_g: f32 },
    SelectFillMode,
    PlaceFullBottles { weights: Vec<f32> },
    EmptyBottle { bottle: String, range: WeightRange, weights: Vec<f32> },
}

/// Host UI collaborator. `show` must not block; the answer arrives as a
/// [`UiSignal`] on the step's signal channel.
pub trait StartupUi {
    fn show(&mut self, step: StepName, prompt: &Prompt);
    /// User-facing validation failure; the step re-prompts afterwards.
    fn notify(&mut self, _step: StepName, _error: &FillerError) {}
}

#[derive(Debug, Clone)]
pub struct StartupCfg {
    pub clear_threshold_g: f32,
    pub full_tolerance_g: f32,
    pub ui_poll: Duration,
    /// Polls allowed for tare acknowledgements before moving on.
    pub tare_settle_polls: u32,
}

impl Default for StartupCfg {
    fn default() -> Self {
        Self {
            clear_threshold_g: 20.0,
            full_tolerance_g: 15.0,
            ui_poll: Duration::from_millis(10),
            tare_settle_polls: 50,
        }
    }
}

/// Collaborators available to every step.
pub struct StepEnv<'a> {
    pub ui: &'a mut dyn StartupUi,
    pub signals: &'a Receiver<UiSignal>,
    pub ticker: &'a mut Ticker,
    pub bus: &'a mut dyn StationBus,
    pub settings: &'a mut dyn SettingsStore,
    pub cfg: StartupCfg,
}

impl StepEnv<'_> {
    /// Pull pending device events into the registry.
    pub fn refresh(&mut self, registry: &mut StationRegistry) -> LinkResult<()> {
        self.bus.refresh(registry, self.ticker).map(|_| ())
    }

    /// Show `prompt` and wait for this step's signal, keeping stations polled.
    pub fn prompt(
        &mut self,
        registry: &mut StationRegistry,
        step: StepName,
        prompt: Prompt,
    ) -> LinkResult<UserAction> {
        let stale = self.signals.try_iter().count();
        if stale > 0 {
            tracing::debug!(%step, stale, "discarded stale ui signals");
        }
        self.ui.show(step, &prompt);
        loop {
            self.refresh(registry)?;
            match self.signals.try_recv() {
                Ok(sig) if sig.step == step => {
                    tracing::debug!(%step, action = ?sig.action, "operator action");
                    return Ok(sig.action);
                }
                Ok(sig) => tracing::debug!(%step, other = %sig.step, "ignoring signal for another step"),
                Err(TryRecvError::Empty) => self.ticker.wait(self.cfg.ui_poll)?,
                Err(TryRecvError::Disconnected) => return Err(FillerError::Cancelled),
            }
        }
    }
}

pub trait StartupStep {
    fn name(&self) -> StepName;
    /// `Err` is an unrecoverable failure inside the step.
    fn run(&mut self, ctx: &mut StartupContext, env: &mut StepEnv<'_>) -> LinkResult<StepResult>;
}

pub struct StartupOrchestrator {
    steps: Vec<Box<dyn StartupStep>>,
    trace: Vec<StepName>,
}

impl StartupOrchestrator {
    pub fn new(steps: Vec<Box<dyn StartupStep>>) -> Self {
        Self {
            steps,
            trace: Vec::new(),
        }
    }

    /// station-verification → clear-all-scales → filling-mode-selection →
    /// full-bottle-check → empty-bottle-check.
    pub fn canonical() -> Self {
        Self::new(vec![
            Box::new(StationVerification),
            Box::new(ClearAllScales),
            Box::new(FillingModeSelection),
            Box::new(FullBottleCheck),
            Box::new(EmptyBottleCheck),
        ])
    }

    /// Names of the steps executed so far, in execution order.
    pub fn trace(&self) -> &[StepName] {
        &self.trace
    }

    pub fn run(&mut self, ctx: &mut StartupContext, env: &mut StepEnv<'_>) -> LinkResult<StartupOutcome> {
        self.trace.clear();
        let mut index = 0usize;
        while index < self.steps.len() {
            let step = &mut self.steps[index];
            let name = step.name();
            self.trace.push(name);
            let _span = tracing::info_span!("startup_step", step = %name).entered();

            let result = match step.run(ctx, env) {
                Ok(r) => r,
                Err(FillerError::Cancelled) => return Err(FillerError::Cancelled),
                Err(e) => StepResult::Error(e.to_string()),
            };
            tracing::info!(step = %name, ?result, "step finished");
            match result {
                StepResult::Completed => index += 1,
                StepResult::Backup => {
                    if index == 0 {
                        return Err(FillerError::State(format!("{name} requested backup from the first step")));
                    }
                    index -= 1;
                }
                StepResult::ManualSelected => return Ok(StartupOutcome::Manual),
                StepResult::Error(message) => {
                    tracing::error!(step = %name, %message, "startup aborted");
                    return Err(FillerError::StepFailed { step: name, message });
                }
            }
        }
        Ok(StartupOutcome::Completed)
    }
}
