use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::unbounded;
use filler_core::mocks::{MemorySettings, ScriptedStep, ScriptedUi};
use filler_core::steps;
use filler_core::{
    BottleProfile, LinkResult, Outgoing, StationEvent, DirectBus, FillMode, FillPlan, FillerError, HandshakeCfg, HandshakeManager, Prompt,
    Query, SessionState, StartupCfg, StartupContext, StartupOrchestrator, StartupOutcome, StartupUi,
    StationBus, StationRegistry, StationSpec, StepEnv, StepName, StepResult, Ticker, UiSignal, UserAction,
    WeightRange,
};
use filler_hardware::{DeviceProfile, SimHandle, SimulatedOpener};
use filler_traits::clock::test_clock::TestClock;

use StepName::*;
use UserAction::*;

const TARE: u8 = 0x09;

fn ticker() -> Ticker {
    Ticker::new(Arc::new(TestClock::new()))
}

/// Registry with one simulated station per serial, all attached.
fn attached(serials: &[&str], ticker: &mut Ticker) -> (StationRegistry, Vec<SimHandle>) {
    let mut opener = SimulatedOpener::new();
    for (i, s) in serials.iter().enumerate() {
        opener = opener.with_device(&format!("/dev/ttyACM{i}"), DeviceProfile::new(*s));
    }
    let opener = Arc::new(opener);
    let handles = opener.ports().iter().map(|p| opener.handle(p).unwrap()).collect();
    let mut registry = StationRegistry::new(serials.iter().map(|s| StationSpec::new(*s)).collect());
    HandshakeManager::new(opener.clone(), HandshakeCfg::default())
        .scan(&opener.ports(), &mut registry, ticker)
        .unwrap();
    assert!(registry.connected_flags().iter().all(|c| *c));
    (registry, handles)
}

/// Four configured stations, devices answering only for slots 0 and 2.
fn two_of_four(ticker: &mut Ticker) -> StationRegistry {
    let opener = Arc::new(
        SimulatedOpener::new()
            .with_device("/dev/ttyACM0", DeviceProfile::new("SCL1000"))
            .with_device("/dev/ttyACM1", DeviceProfile::new("SCL1002")),
    );
    let mut registry = StationRegistry::new(
        ["SCL1000", "SCL1001", "SCL1002", "SCL1003"]
            .into_iter()
            .map(StationSpec::new)
            .collect(),
    );
    HandshakeManager::new(opener.clone(), HandshakeCfg::default())
        .scan(&opener.ports(), &mut registry, ticker)
        .unwrap();
    assert_eq!(registry.connected_flags(), vec![true, false, true, false]);
    registry
}

fn bottle(id: &str, full: (f32, f32), empty: (f32, f32)) -> BottleProfile {
    BottleProfile {
        id: id.into(),
        full: WeightRange::new(full.0, full.1),
        empty: WeightRange::new(empty.0, empty.1),
        target_g: 500.0,
        time_limit_ms: 30_000,
    }
}

fn shown_steps(ui: &ScriptedUi) -> Vec<StepName> {
    ui.shown.iter().map(|(s, _)| *s).collect()
}

#[test]
fn backup_reruns_the_previous_step() {
    let (tx, rx) = unbounded();
    let mut ui = ScriptedUi::new(tx, []);
    let mut t = ticker();
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(StationRegistry::new(vec![]), vec![]);
    let mut orch = StartupOrchestrator::new(vec![
        Box::new(ScriptedStep::new(StationVerification, [])),
        Box::new(ScriptedStep::new(ClearAllScales, [StepResult::Backup])),
        Box::new(ScriptedStep::new(FillingModeSelection, [])),
    ]);

    assert_eq!(orch.run(&mut ctx, &mut env).unwrap(), StartupOutcome::Completed);
    assert_eq!(
        orch.trace(),
        &[StationVerification, ClearAllScales, StationVerification, ClearAllScales, FillingModeSelection]
    );
}

#[test]
fn backup_from_the_first_step_is_a_state_error() {
    let (tx, rx) = unbounded();
    let mut ui = ScriptedUi::new(tx, []);
    let mut t = ticker();
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(StationRegistry::new(vec![]), vec![]);
    let mut orch = StartupOrchestrator::new(vec![Box::new(ScriptedStep::new(
        StationVerification,
        [StepResult::Backup],
    ))]);
    assert!(matches!(orch.run(&mut ctx, &mut env), Err(FillerError::State(_))));
}

#[test]
fn manual_selection_skips_bottle_checks() {
    let (tx, rx) = unbounded();
    let mut ui = ScriptedUi::new(tx, []);
    let mut t = ticker();
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let full = ScriptedStep::new(FullBottleCheck, []);
    let empty = ScriptedStep::new(EmptyBottleCheck, []);
    let (full_calls, empty_calls) = (full.calls(), empty.calls());
    let mut ctx = StartupContext::new(StationRegistry::new(vec![]), vec![]);
    let mut orch = StartupOrchestrator::new(vec![
        Box::new(ScriptedStep::new(StationVerification, [])),
        Box::new(ScriptedStep::new(FillingModeSelection, [StepResult::ManualSelected])),
        Box::new(full),
        Box::new(empty),
    ]);
    assert_eq!(orch.run(&mut ctx, &mut env).unwrap(), StartupOutcome::Manual);
    assert_eq!(full_calls.load(Ordering::Relaxed), 0);
    assert_eq!(empty_calls.load(Ordering::Relaxed), 0);
}

#[test]
fn step_error_aborts_with_step_name() {
    let (tx, rx) = unbounded();
    let mut ui = ScriptedUi::new(tx, []);
    let mut t = ticker();
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(StationRegistry::new(vec![]), vec![]);
    let mut orch = StartupOrchestrator::new(vec![
        Box::new(ScriptedStep::new(StationVerification, [])),
        Box::new(ScriptedStep::new(ClearAllScales, [StepResult::Error("scale jammed".into())])),
    ]);
    assert_eq!(
        orch.run(&mut ctx, &mut env).unwrap_err(),
        FillerError::StepFailed {
            step: ClearAllScales,
            message: "scale jammed".into()
        }
    );
}

#[test]
fn back_from_clear_scales_returns_to_verification() {
    let mut t = ticker();
    let (registry, handles) = attached(&["SCL1000", "SCL1001"], &mut t);
    let (tx, rx) = unbounded();
    let mut ui = ScriptedUi::new(tx, [Next, Back, Next, Next, SelectMode(FillMode::Manual)]);
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(registry, vec![]);
    let mut orch = StartupOrchestrator::canonical();

    assert_eq!(orch.run(&mut ctx, &mut env).unwrap(), StartupOutcome::Manual);
    assert_eq!(
        orch.trace(),
        &[StationVerification, ClearAllScales, StationVerification, ClearAllScales, FillingModeSelection]
    );
    assert_eq!(ctx.filling_mode, Some(FillMode::Manual));
    assert!(handles.iter().all(|h| h.written().contains(&TARE)));
    assert!(ctx.registry.iter().all(|s| s.state() == SessionState::Idle));
    assert_eq!(ui.remaining(), 0);
}

#[test]
fn heavy_scale_needs_confirmation_before_tare() {
    let mut t = ticker();
    let (registry, handles) = attached(&["SCL1000", "SCL1001"], &mut t);
    handles[0].set_weight(25.0);
    handles[1].set_weight(3.0);

    let tared_at_confirm = Rc::new(RefCell::new(Vec::new()));
    let seen = tared_at_confirm.clone();
    let h0 = handles[0].clone();
    let (tx, rx) = unbounded();
    let mut ui = ScriptedUi::new(tx, [Next, Next, Next, SelectMode(FillMode::Manual)]).on_show(
        move |_, prompt| {
            if matches!(prompt, Prompt::ConfirmScalesClear { .. }) {
                seen.borrow_mut().push(h0.written().contains(&TARE));
            }
        },
    );
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(registry, vec![]);
    StartupOrchestrator::canonical().run(&mut ctx, &mut env).unwrap();

    assert_eq!(*tared_at_confirm.borrow(), vec![false]);
    assert!(ui.shown.contains(&(
        ClearAllScales,
        Prompt::ConfirmScalesClear {
            weights: vec![25.0, 3.0],
            threshold_g: 20.0
        }
    )));
    assert!(handles[0].written().contains(&TARE));
    assert_eq!(handles[0].tare_offset(), 25.0);
    assert_eq!(ctx.registry.snapshot_weights(), vec![0.0, 0.0]);
}

#[test]
fn back_on_heavy_scale_confirmation_returns_to_verification() {
    let mut t = ticker();
    let (registry, handles) = attached(&["SCL1000", "SCL1001"], &mut t);
    handles[0].set_weight(25.0);
    handles[1].set_weight(3.0);
    let (tx, rx) = unbounded();
    let mut ui = ScriptedUi::new(tx, [Next, Next, Back, Next, Next, Next, SelectMode(FillMode::Manual)]);
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(registry, vec![]);
    let mut orch = StartupOrchestrator::canonical();

    assert_eq!(orch.run(&mut ctx, &mut env).unwrap(), StartupOutcome::Manual);
    assert_eq!(
        orch.trace(),
        &[StationVerification, ClearAllScales, StationVerification, ClearAllScales, FillingModeSelection]
    );
    let confirms = ui
        .shown
        .iter()
        .filter(|(_, p)| matches!(p, Prompt::ConfirmScalesClear { .. }))
        .count();
    assert_eq!(confirms, 2);
    assert_eq!(ui.remaining(), 0);
}

/// Queues a pre-tare reading on station 0 once the clear-scales answer is in.
struct LateReadingBus {
    inner: DirectBus,
    station: SimHandle,
    signals: crossbeam_channel::Receiver<UiSignal>,
    armed: Rc<Cell<bool>>,
    unread: bool,
    unread_at_tare: Vec<bool>,
}

impl filler_core::StationBus for LateReadingBus {
    fn refresh(
        &mut self,
        registry: &mut StationRegistry,
        ticker: &mut Ticker,
    ) -> LinkResult<Vec<(usize, StationEvent)>> {
        self.unread = false;
        let events = self.inner.refresh(registry, ticker)?;
        if self.armed.get() && !self.signals.is_empty() {
            self.armed.set(false);
            self.station.push_raw(b"\x0425\n");
            self.unread = true;
        }
        Ok(events)
    }

    fn send(&mut self, registry: &mut StationRegistry, index: usize, out: Outgoing) -> LinkResult<()> {
        if out == Outgoing::Command(filler_core::Opcode::Tare) {
            self.unread_at_tare.push(self.unread);
        }
        self.inner.send(registry, index, out)
    }
}

#[test]
fn readings_queued_before_tare_are_drained_first() {
    let mut t = ticker();
    let (registry, handles) = attached(&["SCL1000"], &mut t);
    let armed = Rc::new(Cell::new(false));
    let arm = armed.clone();
    let (tx, rx) = unbounded();
    let mut ui = ScriptedUi::new(tx, [Next, Next, SelectMode(FillMode::Manual)]).on_show(
        move |_, prompt| {
            if matches!(prompt, Prompt::ClearScales { .. }) {
                arm.set(true);
            }
        },
    );
    let mut bus = LateReadingBus {
        inner: DirectBus::new(),
        station: handles[0].clone(),
        signals: rx.clone(),
        armed,
        unread: false,
        unread_at_tare: Vec::new(),
    };
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(registry, vec![]);
    StartupOrchestrator::canonical().run(&mut ctx, &mut env).unwrap();

    assert_eq!(bus.unread_at_tare, vec![false]);
    assert_eq!(ctx.registry.snapshot_weights(), vec![0.0]);
}

#[test]
fn light_readings_tare_without_confirmation() {
    let mut t = ticker();
    let (registry, handles) = attached(&["SCL1000", "SCL1001"], &mut t);
    handles[0].set_weight(5.0);
    let (tx, rx) = unbounded();
    let mut ui = ScriptedUi::new(tx, [Next, Next, SelectMode(FillMode::Manual)]);
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(registry, vec![]);
    StartupOrchestrator::canonical().run(&mut ctx, &mut env).unwrap();
    assert_eq!(shown_steps(&ui), vec![StationVerification, ClearAllScales, FillingModeSelection]);
    assert!(
        !ui.shown
            .iter()
            .any(|(_, p)| matches!(p, Prompt::ConfirmScalesClear { .. }))
    );
}

#[test]
fn auto_fill_runs_from_startup_to_stop() {
    let mut t = ticker();
    let (registry, handles) = attached(&["SCL1000", "SCL1001"], &mut t);
    let bottles = vec![
        bottle("half_litre", (650.0, 750.0), (180.0, 220.0)),
        bottle("wide", (600.0, 800.0), (150.0, 250.0)),
    ];

    let hs = handles.clone();
    let (tx, rx) = unbounded();
    let mut ui = ScriptedUi::new(tx, [Next, Next, SelectMode(FillMode::Auto), Next, Next]).on_show(
        move |_, prompt| match prompt {
            Prompt::PlaceFullBottles { .. } => hs.iter().for_each(|h| h.set_weight(700.0)),
            Prompt::EmptyBottle { .. } => hs.iter().for_each(|h| h.set_weight(200.0)),
            _ => {}
        },
    );
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(registry, bottles);
    let mut orch = StartupOrchestrator::canonical();
    assert_eq!(orch.run(&mut ctx, &mut env).unwrap(), StartupOutcome::Completed);

    // Both profiles hold 700 g; the first in config order wins.
    assert_eq!(ctx.selected_bottle.as_deref(), Some("half_litre"));
    assert_eq!(ctx.target_weight, Some(500.0));
    assert_eq!(ctx.time_limit_ms, Some(30_000));

    let plan = FillPlan::from_context(&ctx).unwrap();
    assert_eq!(plan.mode(), FillMode::Auto);
    let started = plan.begin(&mut ctx.registry, &mut bus).unwrap();
    assert_eq!(started, vec![0, 1]);
    assert!(handles.iter().all(|h| h.filling() == Some(0x10)));
    assert!(ctx.registry.iter().all(|s| s.state() == SessionState::FillingAuto));

    plan.answer(&mut ctx.registry, &mut bus, 0, Query::TargetWeight).unwrap();
    assert!(handles[0].written().ends_with(b"\x08500\n"));

    handles[0].finish_fill(512.0);
    bus.refresh(&mut ctx.registry, &mut t).unwrap();
    assert_eq!(ctx.registry.get(0).unwrap().state(), SessionState::Idle);
    assert_eq!(ctx.registry.get(1).unwrap().state(), SessionState::FillingAuto);

    plan.stop_all(&mut ctx.registry, &mut bus);
    assert!(handles.iter().all(|h| h.filling().is_none()));
    assert!(ctx.registry.iter().all(|s| s.state() == SessionState::Idle));
}

#[test]
fn long_time_limit_is_sent_exactly() {
    let mut t = ticker();
    let (mut registry, handles) = attached(&["SCL1000"], &mut t);
    let plan = FillPlan::builder()
        .mode(FillMode::Auto)
        .bottle("drum")
        .target_g(20_000.0)
        .time_limit_ms(16_777_217)
        .build()
        .unwrap();
    let mut bus = DirectBus::new();
    plan.answer(&mut registry, &mut bus, 0, Query::TimeLimit).unwrap();
    assert!(handles[0].written().ends_with(b"16777217\n"));
}

#[test]
fn full_bottle_mismatch_is_reported_and_reprompted() {
    let mut t = ticker();
    let (registry, handles) = attached(&["SCL1000", "SCL1001"], &mut t);
    let bottles = vec![bottle("half_litre", (650.0, 750.0), (180.0, 220.0))];

    let hs = handles.clone();
    let full_shows = Rc::new(RefCell::new(0));
    let count = full_shows.clone();
    let (tx, rx) = unbounded();
    let mut ui = ScriptedUi::new(tx, [Next, Next, SelectMode(FillMode::Smart), Next, Next]).on_show(
        move |_, prompt| {
            if let Prompt::PlaceFullBottles { .. } = prompt {
                *count.borrow_mut() += 1;
                let second = if *count.borrow() == 1 { 900.0 } else { 700.0 };
                hs[0].set_weight(700.0);
                hs[1].set_weight(second);
            }
        },
    );
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(registry, bottles);
    let err = StartupOrchestrator::canonical().run(&mut ctx, &mut env).unwrap_err();

    // Script runs dry at the empty-bottle prompt.
    assert!(matches!(err, FillerError::StepFailed { step: EmptyBottleCheck, .. }));
    assert_eq!(*full_shows.borrow(), 2);
    assert_eq!(ui.notices.len(), 1);
    assert_eq!(
        ui.notices[0],
        (
            FullBottleCheck,
            FillerError::RangeMismatch {
                expected: "a bottle profile full range".into(),
                weights: vec![700.0, 900.0]
            }
        )
    );
    assert_eq!(ctx.selected_bottle.as_deref(), Some("half_litre"));
    assert_eq!(ctx.filling_mode, Some(FillMode::Smart));
}

#[test]
fn empty_bottle_out_of_range_is_reported() {
    let mut t = ticker();
    let (registry, handles) = attached(&["SCL1000"], &mut t);
    let bottles = vec![bottle("half_litre", (650.0, 750.0), (180.0, 220.0))];
    let h = handles[0].clone();
    let (tx, rx) = unbounded();
    let mut ui = ScriptedUi::new(tx, [Next, Next, SelectMode(FillMode::Auto), Next, Next, Next])
        .on_show(move |_, prompt| match prompt {
            Prompt::PlaceFullBottles { .. } => h.set_weight(700.0),
            Prompt::EmptyBottle { weights, .. } if weights == &[700.0] => h.set_weight(260.0),
            Prompt::EmptyBottle { .. } => h.set_weight(200.0),
            _ => {}
        });
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(registry, bottles);
    let outcome = StartupOrchestrator::canonical().run(&mut ctx, &mut env).unwrap();
    assert_eq!(outcome, StartupOutcome::Completed);
    assert_eq!(
        ui.notices,
        vec![(
            EmptyBottleCheck,
            FillerError::RangeMismatch {
                expected: "180..=220 g".into(),
                weights: vec![260.0]
            }
        )]
    );
}

#[test]
fn verification_requires_an_active_station() {
    let mut t = ticker();
    let (registry, _handles) = attached(&["SCL1000"], &mut t);
    let (tx, rx) = unbounded();
    let mut ui = ScriptedUi::new(tx, [Toggle(0), Next, Toggle(0), Next]);
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(registry, vec![]);
    let mut orch = StartupOrchestrator::new(vec![Box::new(steps::StationVerification)]);
    assert_eq!(orch.run(&mut ctx, &mut env).unwrap(), StartupOutcome::Completed);
    assert_eq!(ui.notices, vec![(StationVerification, FillerError::NoStationsEnabled)]);
    assert_eq!(settings.enabled.get(&0), Some(&true));
}

#[test]
fn verification_proceeds_with_two_of_four_stations_attached() {
    let mut t = ticker();
    let registry = two_of_four(&mut t);
    let (tx, rx) = unbounded();
    let mut ui = ScriptedUi::new(tx, [Next]);
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(registry, vec![]);
    let mut orch = StartupOrchestrator::new(vec![Box::new(steps::StationVerification)]);

    assert_eq!(orch.run(&mut ctx, &mut env).unwrap(), StartupOutcome::Completed);
    assert!(ui.notices.is_empty());
    assert_eq!(
        ui.shown[0].1,
        Prompt::StationVerification {
            connected: vec![true, false, true, false],
            enabled: vec![true; 4]
        }
    );
    assert_eq!(ctx.registry.active_indices(), vec![0, 2]);
}

#[test]
fn enabled_but_disconnected_slots_do_not_count_as_active() {
    let mut t = ticker();
    let registry = two_of_four(&mut t);
    let (tx, rx) = unbounded();
    // Disable both attached stations; slots 1 and 3 stay enabled but missing.
    let mut ui = ScriptedUi::new(tx, [Toggle(0), Toggle(2), Next, Toggle(2), Next]);
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(registry, vec![]);
    let mut orch = StartupOrchestrator::new(vec![Box::new(steps::StationVerification)]);

    assert_eq!(orch.run(&mut ctx, &mut env).unwrap(), StartupOutcome::Completed);
    assert_eq!(ui.notices, vec![(StationVerification, FillerError::NoStationsEnabled)]);
    assert_eq!(ctx.registry.active_indices(), vec![2]);
    assert_eq!(settings.enabled.get(&0), Some(&false));
    assert_eq!(settings.enabled.get(&1), Some(&true));
    assert_eq!(settings.enabled.get(&2), Some(&true));
}

#[test]
fn enabled_flags_are_persisted_on_next() {
    let mut t = ticker();
    let (registry, _handles) = attached(&["SCL1000", "SCL1001"], &mut t);
    let (tx, rx) = unbounded();
    let mut ui = ScriptedUi::new(tx, [Toggle(1), Next]);
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(registry, vec![]);
    let mut orch = StartupOrchestrator::new(vec![Box::new(steps::StationVerification)]);
    orch.run(&mut ctx, &mut env).unwrap();
    assert_eq!(settings.enabled.get(&0), Some(&true));
    assert_eq!(settings.enabled.get(&1), Some(&false));
    assert_eq!(ctx.registry.active_indices(), vec![0]);
    assert_eq!(
        ui.shown[1].1,
        Prompt::StationVerification {
            connected: vec![true, true],
            enabled: vec![true, false]
        }
    );
}

#[test]
fn stale_signals_are_discarded_before_prompting() {
    let (tx, rx) = unbounded();
    tx.send(UiSignal {
        step: StationVerification,
        action: Abort,
    })
    .unwrap();
    let mut t = ticker();
    let (registry, _handles) = attached(&["SCL1000"], &mut t);
    let mut ui = ScriptedUi::new(tx, [Next]);
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(registry, vec![]);
    let mut orch = StartupOrchestrator::new(vec![Box::new(steps::StationVerification)]);
    assert_eq!(orch.run(&mut ctx, &mut env).unwrap(), StartupOutcome::Completed);
}

struct SilentUi;

impl StartupUi for SilentUi {
    fn show(&mut self, _step: StepName, _prompt: &Prompt) {}
}

#[test]
fn cancel_flag_interrupts_a_waiting_prompt() {
    let (_tx, rx) = unbounded::<UiSignal>();
    let cancel = Arc::new(AtomicBool::new(true));
    let mut t = ticker().with_cancel(cancel);
    let mut ui = SilentUi;
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(StationRegistry::new(vec![StationSpec::new("SCL1000")]), vec![]);
    let err = StartupOrchestrator::canonical().run(&mut ctx, &mut env).unwrap_err();
    assert_eq!(err, FillerError::Cancelled);
}

#[test]
fn closed_signal_channel_cancels() {
    let (tx, rx) = unbounded::<UiSignal>();
    drop(tx);
    let mut t = ticker();
    let mut ui = SilentUi;
    let mut bus = DirectBus::new();
    let mut settings = MemorySettings::new();
    let mut env = StepEnv {
        ui: &mut ui,
        signals: &rx,
        ticker: &mut t,
        bus: &mut bus,
        settings: &mut settings,
        cfg: StartupCfg::default(),
    };
    let mut ctx = StartupContext::new(StationRegistry::new(vec![]), vec![]);
    let mut orch = StartupOrchestrator::new(vec![Box::new(steps::StationVerification)]);
    assert_eq!(orch.run(&mut ctx, &mut env).unwrap_err(), FillerError::Cancelled);
}
