//! Test and helper mocks for filler_core

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::Sender;
use filler_traits::{BoxError, SerialEndpoint};

use crate::calibration::CalibrationOperator;
use crate::error::{FillerError, LinkResult};
use crate::startup::{Prompt, StartupContext, StartupStep, StartupUi, StepEnv, UiSignal, UserAction};
use crate::status::{StepName, StepResult};
use crate::store::{BottleProfile, SettingsStore};

#[derive(Debug, Default)]
struct Wire {
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    broken: bool,
}

fn lock(w: &Mutex<Wire>) -> MutexGuard<'_, Wire> {
    w.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Endpoint fed from a byte script; records everything written to it.
#[derive(Debug)]
pub struct ScriptedEndpoint {
    name: String,
    wire: Arc<Mutex<Wire>>,
}

/// Test-side control of a [`ScriptedEndpoint`].
#[derive(Debug, Clone)]
pub struct ScriptedHandle {
    wire: Arc<Mutex<Wire>>,
}

impl ScriptedEndpoint {
    pub fn new(name: &str) -> (Self, ScriptedHandle) {
        let wire = Arc::new(Mutex::new(Wire::default()));
        (
            Self {
                name: name.to_string(),
                wire: wire.clone(),
            },
            ScriptedHandle { wire },
        )
    }
}

impl ScriptedHandle {
    /// Queue device bytes for the host to read.
    pub fn push(&self, bytes: &[u8]) {
        lock(&self.wire).inbound.extend(bytes.iter().copied());
    }

    /// Make every subsequent operation fail like an unplugged cable.
    pub fn fail_io(&self) {
        lock(&self.wire).broken = true;
    }

    pub fn written(&self) -> Vec<u8> {
        lock(&self.wire).written.clone()
    }

    pub fn pending(&self) -> usize {
        lock(&self.wire).inbound.len()
    }
}

fn broken() -> BoxError {
    Box::new(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "scripted endpoint unplugged"))
}

impl SerialEndpoint for ScriptedEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_available(&mut self) -> Result<usize, BoxError> {
        let w = lock(&self.wire);
        if w.broken {
            return Err(broken());
        }
        Ok(w.inbound.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BoxError> {
        let mut w = lock(&self.wire);
        if w.broken {
            return Err(broken());
        }
        let mut n = 0;
        while n < buf.len() {
            match w.inbound.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), BoxError> {
        let mut w = lock(&self.wire);
        if w.broken {
            return Err(broken());
        }
        w.written.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), BoxError> {
        if lock(&self.wire).broken {
            return Err(broken());
        }
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), BoxError> {
        lock(&self.wire).inbound.clear();
        Ok(())
    }
}

/// In-memory settings store.
#[derive(Debug, Default, Clone)]
pub struct MemorySettings {
    pub calibration: HashMap<usize, f32>,
    pub enabled: HashMap<usize, bool>,
    pub bottles: Vec<BottleProfile>,
    /// Number of `set_calibration` calls.
    pub calibration_writes: usize,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_calibration(mut self, index: usize, factor: f32) -> Self {
        self.calibration.insert(index, factor);
        self
    }

    pub fn with_enabled(mut self, index: usize, enabled: bool) -> Self {
        self.enabled.insert(index, enabled);
        self
    }

    pub fn with_bottle(mut self, profile: BottleProfile) -> Self {
        self.bottles.push(profile);
        self
    }
}

impl SettingsStore for MemorySettings {
    fn calibration(&self, index: usize) -> eyre::Result<Option<f32>> {
        Ok(self.calibration.get(&index).copied())
    }

    fn set_calibration(&mut self, index: usize, factor: f32) -> eyre::Result<()> {
        self.calibration_writes += 1;
        self.calibration.insert(index, factor);
        Ok(())
    }

    fn enabled(&self, index: usize) -> eyre::Result<Option<bool>> {
        Ok(self.enabled.get(&index).copied())
    }

    fn set_enabled(&mut self, index: usize, enabled: bool) -> eyre::Result<()> {
        self.enabled.insert(index, enabled);
        Ok(())
    }

    fn bottle_profiles(&self, _full_tolerance_g: f32) -> eyre::Result<Vec<BottleProfile>> {
        Ok(self.bottles.clone())
    }
}

type ShowHook = Box<dyn FnMut(StepName, &Prompt)>;

/// UI that answers each prompt with the next scripted action.
///
/// Once the script runs dry every prompt is answered with `Abort`.
pub struct ScriptedUi {
    tx: Sender<UiSignal>,
    script: VecDeque<UserAction>,
    hook: Option<ShowHook>,
    pub shown: Vec<(StepName, Prompt)>,
    pub notices: Vec<(StepName, FillerError)>,
}

impl ScriptedUi {
    pub fn new(tx: Sender<UiSignal>, script: impl IntoIterator<Item = UserAction>) -> Self {
        Self {
            tx,
            script: script.into_iter().collect(),
            hook: None,
            shown: Vec::new(),
            notices: Vec::new(),
        }
    }

    /// Run `hook` on every prompt before it is answered.
    pub fn on_show(mut self, hook: impl FnMut(StepName, &Prompt) + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl StartupUi for ScriptedUi {
    fn show(&mut self, step: StepName, prompt: &Prompt) {
        if let Some(h) = self.hook.as_mut() {
            h(step, prompt);
        }
        self.shown.push((step, prompt.clone()));
        let action = self.script.pop_front().unwrap_or(UserAction::Abort);
        let _ = self.tx.send(UiSignal { step, action });
    }

    fn notify(&mut self, step: StepName, error: &FillerError) {
        self.notices.push((step, error.clone()));
    }
}

/// Operator with fixed answers.
#[derive(Debug, Clone)]
pub struct ScriptedOperator {
    pub confirm_empty: bool,
    /// `None` accepts the offered default.
    pub reference_g: Option<f32>,
    pub decline_reference: bool,
}

impl Default for ScriptedOperator {
    fn default() -> Self {
        Self {
            confirm_empty: true,
            reference_g: None,
            decline_reference: false,
        }
    }
}

impl CalibrationOperator for ScriptedOperator {
    fn confirm_scale_empty(&mut self, _station: usize) -> bool {
        self.confirm_empty
    }

    fn reference_weight(&mut self, _station: usize, default_g: f32) -> Option<f32> {
        if self.decline_reference {
            return None;
        }
        Some(self.reference_g.unwrap_or(default_g))
    }
}

/// Step returning scripted results and counting its invocations.
pub struct ScriptedStep {
    name: StepName,
    results: VecDeque<StepResult>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedStep {
    /// After the script runs dry the step keeps returning `Completed`.
    pub fn new(name: StepName, results: impl IntoIterator<Item = StepResult>) -> Self {
        Self {
            name,
            results: results.into_iter().collect(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl StartupStep for ScriptedStep {
    fn name(&self) -> StepName {
        self.name
    }

    fn run(&mut self, _ctx: &mut StartupContext, _env: &mut StepEnv<'_>) -> LinkResult<StepResult> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.results.pop_front().unwrap_or(StepResult::Completed))
    }
}
