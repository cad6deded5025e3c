//! Hand-off from startup to the runtime fill loop.

use crate::bus::StationBus;
use crate::error::{BuildError, FillerError, LinkResult, Result};
use crate::protocol::{Opcode, Outgoing, Query};
use crate::registry::{SessionState, StationRegistry};
use crate::startup::{FillMode, StartupContext};

/// Validated parameters the runtime fill loop starts from.
#[derive(Debug, Clone, PartialEq)]
pub struct FillPlan {
    mode: FillMode,
    target_g: f32,
    time_limit_ms: u64,
    bottle: Option<String>,
}

#[derive(Debug, Default)]
pub struct FillPlanBuilder {
    mode: Option<FillMode>,
    target_g: Option<f32>,
    time_limit_ms: Option<u64>,
    bottle: Option<String>,
}

impl FillPlanBuilder {
    pub fn mode(mut self, mode: FillMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn target_g(mut self, g: f32) -> Self {
        self.target_g = Some(g);
        self
    }

    pub fn time_limit_ms(mut self, ms: u64) -> Self {
        self.time_limit_ms = Some(ms);
        self
    }

    pub fn bottle(mut self, id: impl Into<String>) -> Self {
        self.bottle = Some(id.into());
        self
    }

    /// Manual fills need only the mode; AUTO and SMART need a bottle, target and time limit.
    pub fn build(self) -> Result<FillPlan> {
        let mode = self.mode.ok_or_else(|| eyre::Report::new(BuildError::MissingMode))?;
        if mode == FillMode::Manual {
            return Ok(FillPlan {
                mode,
                target_g: self.target_g.unwrap_or(0.0),
                time_limit_ms: self.time_limit_ms.unwrap_or(0),
                bottle: self.bottle,
            });
        }
        let bottle = self
            .bottle
            .ok_or_else(|| eyre::Report::new(BuildError::MissingBottle))?;
        let target_g = self
            .target_g
            .ok_or_else(|| eyre::Report::new(BuildError::MissingTarget))?;
        if !(target_g.is_finite() && target_g > 0.0) {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "target weight must be > 0",
            )));
        }
        let time_limit_ms = self
            .time_limit_ms
            .ok_or_else(|| eyre::Report::new(BuildError::MissingTimeLimit))?;
        if time_limit_ms == 0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "time limit must be > 0",
            )));
        }
        Ok(FillPlan {
            mode,
            target_g,
            time_limit_ms,
            bottle: Some(bottle),
        })
    }
}

impl FillPlan {
    pub fn builder() -> FillPlanBuilder {
        FillPlanBuilder::default()
    }

    pub fn from_context(ctx: &StartupContext) -> Result<Self> {
        let mut b = Self::builder();
        if let Some(m) = ctx.filling_mode {
            b = b.mode(m);
        }
        if let Some(t) = ctx.target_weight {
            b = b.target_g(t);
        }
        if let Some(ms) = ctx.time_limit_ms {
            b = b.time_limit_ms(ms);
        }
        if let Some(id) = &ctx.selected_bottle {
            b = b.bottle(id.clone());
        }
        b.build()
    }

    pub fn mode(&self) -> FillMode {
        self.mode
    }
    pub fn target_g(&self) -> f32 {
        self.target_g
    }
    pub fn time_limit_ms(&self) -> u64 {
        self.time_limit_ms
    }
    pub fn bottle(&self) -> Option<&str> {
        self.bottle.as_deref()
    }

    fn begin_opcode(&self) -> (Opcode, SessionState) {
        match self.mode {
            FillMode::Auto => (Opcode::BeginAutoFill, SessionState::FillingAuto),
            FillMode::Manual => (Opcode::SetManualFill, SessionState::FillingManual),
            FillMode::Smart => (Opcode::BeginSmartFill, SessionState::FillingSmart),
        }
    }

    /// Start every enabled and connected station; returns the slots started.
    /// A station whose link fails is demoted and skipped.
    pub fn begin(&self, registry: &mut StationRegistry, bus: &mut dyn StationBus) -> LinkResult<Vec<usize>> {
        let (opcode, state) = self.begin_opcode();
        let mut started = Vec::new();
        for i in registry.active_indices() {
            match bus.send(registry, i, Outgoing::Command(opcode)) {
                Ok(()) => {
                    if let Some(st) = registry.get_mut(i) {
                        st.set_state(state)?;
                    }
                    started.push(i);
                }
                Err(e) if e.is_link_failure() => {
                    tracing::warn!(station = i, error = %e, "station lost at fill start");
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(mode = %self.mode, stations = ?started, "fill started");
        Ok(started)
    }

    /// Reply to a device query with this plan's values.
    pub fn answer(
        &self,
        registry: &mut StationRegistry,
        bus: &mut dyn StationBus,
        index: usize,
        query: Query,
    ) -> LinkResult<()> {
        let out = match query {
            Query::TargetWeight => Outgoing::Value(Opcode::TargetWeightReply, self.target_g),
            Query::TimeLimit => Outgoing::Count(self.time_limit_ms),
            Query::Calibration => {
                let factor = registry
                    .get(index)
                    .map(|s| s.calibration_factor())
                    .ok_or_else(|| FillerError::State(format!("no station slot {index}")))?;
                Outgoing::Payload(factor)
            }
        };
        tracing::debug!(station = index, ?query, ?out, "answering device query");
        bus.send(registry, index, out)
    }

    /// Send STOP to every connected station.
    pub fn stop_all(&self, registry: &mut StationRegistry, bus: &mut dyn StationBus) {
        let connected: Vec<usize> = registry.iter().filter(|s| s.is_connected()).map(|s| s.index()).collect();
        for i in connected {
            if let Err(e) = bus.send(registry, i, Outgoing::Command(Opcode::Stop)) {
                tracing::warn!(station = i, error = %e, "stop failed");
                continue;
            }
            if let Some(st) = registry.get_mut(i)
                && st.state().is_filling()
            {
                let _ = st.set_state(SessionState::Idle);
            }
        }
    }
}
