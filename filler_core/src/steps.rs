//! The canonical startup steps.

use crate::error::{FillerError, LinkResult};
use crate::protocol::{Opcode, Outgoing};
use crate::registry::{SessionState, StationRegistry};
use crate::startup::{FillMode, Prompt, StartupContext, StartupStep, StepEnv, UserAction, first_full_match};
use crate::status::{StepName, StepResult};

const ABORTED: &str = "aborted by operator";

/// Operator enables/disables stations; at least one must be enabled and connected.
pub struct StationVerification;

impl StartupStep for StationVerification {
    fn name(&self) -> StepName {
        StepName::StationVerification
    }

    fn run(&mut self, ctx: &mut StartupContext, env: &mut StepEnv<'_>) -> LinkResult<StepResult> {
        let step = self.name();
        loop {
            env.refresh(&mut ctx.registry)?;
            let prompt = Prompt::StationVerification {
                connected: ctx.connected(),
                enabled: ctx.enabled(),
            };
            match env.prompt(&mut ctx.registry, step, prompt)? {
                UserAction::Toggle(i) => match ctx.registry.get(i).map(|s| s.is_enabled()) {
                    Some(was) => ctx.registry.set_enabled(i, !was)?,
                    None => tracing::warn!(station = i, "toggle for unknown slot ignored"),
                },
                UserAction::Rescan => match env.bus.rescan(&mut ctx.registry, env.ticker)? {
                    Some(report) => tracing::info!(attached = report.attached.len(), "rescan complete"),
                    None => tracing::info!("rescan not available on this bus"),
                },
                UserAction::Next => {
                    if ctx.registry.active_indices().is_empty() {
                        env.ui.notify(step, &FillerError::NoStationsEnabled);
                        continue;
                    }
                    for (i, enabled) in ctx.enabled().into_iter().enumerate() {
                        env.settings
                            .set_enabled(i, enabled)
                            .map_err(|e| FillerError::Config(format!("{e:#}")))?;
                    }
                    return Ok(StepResult::Completed);
                }
                UserAction::Abort => return Ok(StepResult::Error(ABORTED.into())),
                other => tracing::debug!(?other, "action not offered here"),
            }
        }
    }
}

/// Operator clears every scale; heavy readings need an explicit confirmation
/// before the scales are tared.
pub struct ClearAllScales;

impl ClearAllScales {
    /// Any reading still queued is applied before TARE goes out, so only a
    /// reading that follows the tare can end the settle wait.
    fn tare(registry: &mut StationRegistry, env: &mut StepEnv<'_>) -> LinkResult<()> {
        env.refresh(registry)?;
        for i in registry.active_indices() {
            if let Some(st) = registry.get_mut(i) {
                st.set_state(SessionState::Taring)?;
            }
            match env.bus.send(registry, i, Outgoing::Command(Opcode::Tare)) {
                Ok(()) => {}
                Err(e) if e.is_link_failure() => continue,
                Err(e) => return Err(e),
            }
        }
        for _ in 0..env.cfg.tare_settle_polls {
            env.refresh(registry)?;
            if !registry.iter().any(|s| s.state() == SessionState::Taring) {
                return Ok(());
            }
            env.ticker.wait(env.cfg.ui_poll)?;
        }
        for i in registry.active_indices() {
            if let Some(st) = registry.get_mut(i)
                && st.state() == SessionState::Taring
            {
                tracing::warn!(station = i, "no tare acknowledgement");
                st.set_state(SessionState::Idle)?;
            }
        }
        Ok(())
    }
}

impl StartupStep for ClearAllScales {
    fn name(&self) -> StepName {
        StepName::ClearAllScales
    }

    fn run(&mut self, ctx: &mut StartupContext, env: &mut StepEnv<'_>) -> LinkResult<StepResult> {
        let step = self.name();
        loop {
            env.refresh(&mut ctx.registry)?;
            let weights = ctx.registry.snapshot_weights();
            match env.prompt(&mut ctx.registry, step, Prompt::ClearScales { weights })? {
                UserAction::Back => return Ok(StepResult::Backup),
                UserAction::Abort => return Ok(StepResult::Error(ABORTED.into())),
                UserAction::Next => {}
                other => {
                    tracing::debug!(?other, "action not offered here");
                    continue;
                }
            }

            let weights = ctx.registry.snapshot_weights();
            let threshold_g = env.cfg.clear_threshold_g;
            if weights.iter().any(|w| *w > threshold_g) {
                let prompt = Prompt::ConfirmScalesClear { weights, threshold_g };
                match env.prompt(&mut ctx.registry, step, prompt)? {
                    UserAction::Next => {}
                    UserAction::Back => return Ok(StepResult::Backup),
                    UserAction::Abort => return Ok(StepResult::Error(ABORTED.into())),
                    _ => continue,
                }
            }
            Self::tare(&mut ctx.registry, env)?;
            return Ok(StepResult::Completed);
        }
    }
}

/// AUTO, MANUAL or SMART; MANUAL ends the sequence.
pub struct FillingModeSelection;

impl StartupStep for FillingModeSelection {
    fn name(&self) -> StepName {
        StepName::FillingModeSelection
    }

    fn run(&mut self, ctx: &mut StartupContext, env: &mut StepEnv<'_>) -> LinkResult<StepResult> {
        let step = self.name();
        loop {
            match env.prompt(&mut ctx.registry, step, Prompt::SelectFillMode)? {
                UserAction::SelectMode(mode) => {
                    ctx.filling_mode = Some(mode);
                    tracing::info!(%mode, "filling mode selected");
                    return Ok(match mode {
                        FillMode::Manual => StepResult::ManualSelected,
                        FillMode::Auto | FillMode::Smart => StepResult::Completed,
                    });
                }
                UserAction::Back => return Ok(StepResult::Backup),
                UserAction::Abort => return Ok(StepResult::Error(ABORTED.into())),
                other => tracing::debug!(?other, "action not offered here"),
            }
        }
    }
}

/// Every active station must hold a full bottle of one and the same profile.
pub struct FullBottleCheck;

impl StartupStep for FullBottleCheck {
    fn name(&self) -> StepName {
        StepName::FullBottleCheck
    }

    fn run(&mut self, ctx: &mut StartupContext, env: &mut StepEnv<'_>) -> LinkResult<StepResult> {
        let step = self.name();
        if ctx.bottles.is_empty() {
            return Ok(StepResult::Error("no bottle profiles configured".into()));
        }
        loop {
            env.refresh(&mut ctx.registry)?;
            let weights = ctx.registry.snapshot_weights();
            match env.prompt(&mut ctx.registry, step, Prompt::PlaceFullBottles { weights })? {
                UserAction::Next => {}
                UserAction::Back => return Ok(StepResult::Backup),
                UserAction::Abort => return Ok(StepResult::Error(ABORTED.into())),
                other => {
                    tracing::debug!(?other, "action not offered here");
                    continue;
                }
            }

            let weights = ctx.registry.snapshot_weights();
            match first_full_match(&ctx.bottles, &weights).cloned() {
                Some(profile) => {
                    tracing::info!(bottle = %profile.id, ?weights, "full bottle matched");
                    ctx.select(&profile);
                    return Ok(StepResult::Completed);
                }
                None => {
                    let err = FillerError::RangeMismatch {
                        expected: "a bottle profile full range".into(),
                        weights,
                    };
                    tracing::info!(error = %err, "full bottle check failed");
                    env.ui.notify(step, &err);
                }
            }
        }
    }
}

/// The selected bottle, emptied, must weigh within its empty range everywhere.
pub struct EmptyBottleCheck;

impl StartupStep for EmptyBottleCheck {
    fn name(&self) -> StepName {
        StepName::EmptyBottleCheck
    }

    fn run(&mut self, ctx: &mut StartupContext, env: &mut StepEnv<'_>) -> LinkResult<StepResult> {
        let step = self.name();
        let Some(profile) = ctx.selected_profile().cloned() else {
            return Ok(StepResult::Error("no bottle profile selected".into()));
        };
        loop {
            env.refresh(&mut ctx.registry)?;
            let prompt = Prompt::EmptyBottle {
                bottle: profile.id.clone(),
                range: profile.empty,
                weights: ctx.registry.snapshot_weights(),
            };
            match env.prompt(&mut ctx.registry, step, prompt)? {
                UserAction::Next => {}
                UserAction::Back => return Ok(StepResult::Backup),
                UserAction::Abort => return Ok(StepResult::Error(ABORTED.into())),
                other => {
                    tracing::debug!(?other, "action not offered here");
                    continue;
                }
            }

            let weights = ctx.registry.snapshot_weights();
            if profile.empty.contains_all(&weights) {
                return Ok(StepResult::Completed);
            }
            let err = FillerError::RangeMismatch {
                expected: profile.empty.to_string(),
                weights,
            };
            tracing::info!(bottle = %profile.id, error = %err, "empty bottle check failed");
            env.ui.notify(step, &err);
        }
    }
}
