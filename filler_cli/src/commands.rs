//! Subcommand implementations.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use eyre::{Result, WrapErr};
use filler_config::{Config, RunMode, Settings};
use filler_core::conversions::calibration_step_timeout;
use filler_core::{
    CalibrationSession, DirectBus, FillPlan, FillerError, HandshakeCfg, HandshakeManager,
    SettingsStore, StartupCfg, StartupContext, StartupOrchestrator, StationBus, StationEvent,
    StationPoller, StationRegistry, StepEnv, Ticker,
};
use filler_hardware::util::is_station_candidate;
use filler_hardware::{DeviceProfile, SerialPortOpener, SimulatedOpener, list_ports};
use filler_traits::{MonotonicClock, PortOpener};
use serde_json::json;

use crate::cli::{Cli, Commands};
use crate::console::{ConsoleOperator, ConsoleUi};

/// Runtime monitor poll period.
const MONITOR_POLL: Duration = Duration::from_millis(20);

pub fn dispatch(cli: &Cli, cfg: &Config, cancel: Arc<AtomicBool>) -> Result<()> {
    let mut ticker = Ticker::new(Arc::new(MonotonicClock::new()))
        .with_cancel(cancel)
        .with_pump(|| {
            let _ = std::io::stdout().flush();
        });
    match &cli.cmd {
        Commands::Ports => ports(cfg, cli.sim, cli.json),
        Commands::Scan => scan(cfg, cli.sim, cli.json, &mut ticker),
        Commands::Calibrate { station, weight } => {
            calibrate(cfg, cli.sim, *station, *weight, &mut ticker)
        }
        Commands::Startup { worker } => startup(cfg, cli.sim, *worker, &mut ticker),
        Commands::SelfCheck => self_check(cfg, cli.json),
    }
}

/// Port opener and scan order. `--sim` puts one simulated station per
/// configured serial id on `/dev/ttyACM<slot>`.
fn machine(cfg: &Config, sim: bool) -> (Arc<dyn PortOpener>, Vec<String>) {
    if sim {
        let opener = cfg
            .station_serials()
            .into_iter()
            .enumerate()
            .fold(SimulatedOpener::new(), |o, (i, serial)| {
                o.with_device(&format!("/dev/ttyACM{i}"), DeviceProfile::new(serial).completes_fills())
            });
        let ports = opener.ports();
        return (Arc::new(opener), ports);
    }
    let ports = if cfg.serial.ports.is_empty() {
        list_ports()
            .into_iter()
            .map(|p| p.name)
            .filter(|n| is_station_candidate(n))
            .collect()
    } else {
        cfg.serial.ports.clone()
    };
    (Arc::new(SerialPortOpener), ports)
}

fn load_settings(cfg: &Config) -> Result<Settings> {
    Settings::load(Path::new(&cfg.settings.path))
        .wrap_err_with(|| format!("load settings {}", cfg.settings.path))
}

struct Attachment {
    registry: StationRegistry,
    settings: Settings,
    manager: HandshakeManager,
    ports: Vec<String>,
    report: filler_core::ScanReport,
}

fn attach_all(cfg: &Config, sim: bool, ticker: &mut Ticker) -> Result<Attachment> {
    let (opener, ports) = machine(cfg, sim);
    let settings = load_settings(cfg)?;
    let mut registry = StationRegistry::from_settings(&cfg.station_serials(), &settings)?;
    let manager = HandshakeManager::new(opener, HandshakeCfg::from(cfg));
    tracing::info!(ports = ports.len(), stations = registry.len(), "scanning serial ports");
    let report = manager.scan(&ports, &mut registry, ticker)?;
    Ok(Attachment {
        registry,
        settings,
        manager,
        ports,
        report,
    })
}

fn ports(cfg: &Config, sim: bool, json_out: bool) -> Result<()> {
    if sim || !cfg.serial.ports.is_empty() {
        let (_, names) = machine(cfg, sim);
        if json_out {
            println!("{}", json!({ "ports": names }));
        } else {
            for n in names {
                println!("{n}");
            }
        }
        return Ok(());
    }
    let found: Vec<_> = list_ports()
        .into_iter()
        .filter(|p| is_station_candidate(&p.name))
        .collect();
    if json_out {
        let rows: Vec<_> = found
            .iter()
            .map(|p| json!({ "name": p.name, "vid": p.vid, "pid": p.pid, "product": p.product }))
            .collect();
        println!("{}", json!({ "ports": rows }));
    } else if found.is_empty() {
        println!("no candidate serial ports found");
    } else {
        for p in found {
            match (p.vid, p.pid) {
                (Some(v), Some(d)) => println!(
                    "{}  {v:04x}:{d:04x}  {}",
                    p.name,
                    p.product.as_deref().unwrap_or("")
                ),
                _ => println!("{}", p.name),
            }
        }
    }
    Ok(())
}

fn scan(cfg: &Config, sim: bool, json_out: bool, ticker: &mut Ticker) -> Result<()> {
    let a = attach_all(cfg, sim, ticker)?;
    if json_out {
        let stations: Vec<_> = a
            .registry
            .iter()
            .map(|s| {
                json!({
                    "index": s.index(),
                    "serial_id": s.serial_id(),
                    "port": s.port(),
                    "connected": s.is_connected(),
                    "enabled": s.is_enabled(),
                    "calibration": s.calibration_factor(),
                })
            })
            .collect();
        let skipped: Vec<_> = a
            .report
            .skipped
            .iter()
            .map(|s| json!({ "port": s.port, "reason": s.reason.to_string() }))
            .collect();
        println!("{}", json!({ "stations": stations, "skipped": skipped }));
        return Ok(());
    }
    for s in a.registry.iter() {
        println!(
            "[{}] {:<12} {:<16} {}",
            s.index(),
            s.serial_id(),
            s.port().unwrap_or("-"),
            if s.is_connected() { "attached" } else { "missing" }
        );
    }
    for s in &a.report.skipped {
        println!("skipped {}: {}", s.port, s.reason);
    }
    Ok(())
}

fn calibrate(
    cfg: &Config,
    sim: bool,
    station: usize,
    weight: Option<f32>,
    ticker: &mut Ticker,
) -> Result<()> {
    if let Some(g) = weight
        && !(g.is_finite() && g > 0.0)
    {
        eyre::bail!("reference weight must be a positive number of grams");
    }
    let mut a = attach_all(cfg, sim, ticker)?;
    let session = CalibrationSession::new(station)
        .default_reference(cfg.calibration.default_reference_g)
        .step_timeout(calibration_step_timeout(&cfg.calibration));
    let mut operator = ConsoleOperator::new(weight);
    let factor = session.run(&mut a.registry, &mut operator, &mut a.settings, ticker)?;
    println!("station {station} calibrated: factor {factor}");
    Ok(())
}

fn startup(cfg: &Config, sim: bool, worker: bool, ticker: &mut Ticker) -> Result<()> {
    let a = attach_all(cfg, sim, ticker)?;
    let mut settings = a.settings;
    let startup_cfg = StartupCfg::from(&cfg.startup);
    let bottles = settings.bottle_profiles(startup_cfg.full_tolerance_g)?;
    let mut ctx = StartupContext::new(a.registry, bottles);

    let (signal_tx, signals) = crossbeam_channel::unbounded();
    let mut ui = ConsoleUi::spawn(signal_tx);

    if worker || cfg.runner.mode == RunMode::Worker {
        let links = ctx.registry.lend_links();
        let mut poller = StationPoller::spawn(
            links,
            Duration::from_millis(cfg.runner.worker_poll_ms.max(1)),
            MonotonicClock::new(),
        );
        let res = run_session(&mut ctx, &mut ui, &signals, ticker, &mut poller, &mut settings, startup_cfg);
        ctx.registry.return_links(poller.shutdown());
        res
    } else {
        let mut bus = DirectBus::new().with_rescan(a.manager, a.ports);
        run_session(&mut ctx, &mut ui, &signals, ticker, &mut bus, &mut settings, startup_cfg)
    }
}

#[allow(clippy::too_many_arguments)]
fn run_session(
    ctx: &mut StartupContext,
    ui: &mut ConsoleUi,
    signals: &crossbeam_channel::Receiver<filler_core::UiSignal>,
    ticker: &mut Ticker,
    bus: &mut dyn StationBus,
    settings: &mut Settings,
    cfg: StartupCfg,
) -> Result<()> {
    let outcome = {
        let mut env = StepEnv {
            ui,
            signals,
            ticker: &mut *ticker,
            bus: &mut *bus,
            settings,
            cfg,
        };
        StartupOrchestrator::canonical().run(ctx, &mut env)?
    };
    tracing::info!(?outcome, "startup sequence finished");

    let plan = FillPlan::from_context(ctx)?;
    match plan.bottle() {
        Some(b) => println!(
            "Starting {} fill: bottle '{b}', target {} g, limit {} ms",
            plan.mode(),
            plan.target_g(),
            plan.time_limit_ms()
        ),
        None => println!("Starting {} fill", plan.mode()),
    }
    let started = plan.begin(&mut ctx.registry, bus)?;
    let res = monitor(&plan, &mut ctx.registry, bus, ticker, &started);
    plan.stop_all(&mut ctx.registry, bus);
    res
}

/// Answer device queries and report results until no started station is filling.
fn monitor(
    plan: &FillPlan,
    registry: &mut StationRegistry,
    bus: &mut dyn StationBus,
    ticker: &mut Ticker,
    started: &[usize],
) -> Result<()> {
    if started.is_empty() {
        return Err(FillerError::NoStationsEnabled.into());
    }
    loop {
        for (i, ev) in bus.refresh(registry, ticker)? {
            match ev {
                StationEvent::Query(q) => {
                    if let Err(e) = plan.answer(registry, bus, i, q) {
                        tracing::warn!(station = i, error = %e, "query not answered");
                    }
                }
                StationEvent::FinalWeight(g) => println!("station {i}: final weight {g} g"),
                StationEvent::FillTime(ms) => println!("station {i}: fill time {ms} ms"),
                StationEvent::EStop => println!("station {i}: EMERGENCY STOP"),
                StationEvent::MaxWeightWarning => println!("station {i}: maximum weight warning"),
                StationEvent::LinkLost(reason) => println!("station {i}: link lost ({reason})"),
                _ => {}
            }
        }
        let busy = started
            .iter()
            .any(|i| registry.get(*i).is_some_and(|s| s.state().is_filling()));
        if !busy {
            println!("fill complete");
            return Ok(());
        }
        ticker.wait(MONITOR_POLL)?;
    }
}

fn self_check(cfg: &Config, json_out: bool) -> Result<()> {
    let settings = load_settings(cfg)?;
    for i in 0..cfg.stations.len() {
        settings.station_calibration(i)?;
        settings.station_enabled(i)?;
    }
    let bottles = settings.bottles()?;
    if json_out {
        println!(
            "{}",
            json!({
                "status": "ok",
                "stations": cfg.stations.len(),
                "bottles": bottles.iter().map(|b| b.id.as_str()).collect::<Vec<_>>(),
            })
        );
    } else {
        println!(
            "ok: {} stations, {} bottle profiles",
            cfg.stations.len(),
            bottles.len()
        );
    }
    Ok(())
}
