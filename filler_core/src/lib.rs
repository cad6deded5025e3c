#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Station protocol, discovery and startup orchestration (hardware-agnostic).
//!
//! All byte I/O goes through `filler_traits::SerialEndpoint`; ports are opened
//! through `filler_traits::PortOpener` and time comes from `filler_traits::Clock`.
//!
//! ## Architecture
//!
//! - **Protocol**: single-byte opcodes with optional ASCII payload lines (`protocol`)
//! - **Link**: one polled serial connection per station (`link`)
//! - **Handshake**: port scan, identification, calibration delivery (`handshake`)
//! - **Calibration**: interactive factor exchange for one station (`calibration`)
//! - **Registry**: authoritative station table and its invariant (`registry`)
//! - **Startup**: step orchestrator, canonical steps and typed context (`startup`, `steps`)
//! - **Scheduling**: one tick for every wait (`sched`); cooperative `DirectBus`
//!   or worker-thread `StationPoller` behind `StationBus`
//! - **Hand-off**: `FillPlan` starts, answers and stops the runtime fill (`session`)

pub mod atomic;
pub mod bus;
pub mod calibration;
pub mod conversions;
pub mod error;
pub mod handshake;
pub mod hw_error;
pub mod link;
pub mod mocks;
pub mod poller;
pub mod protocol;
pub mod registry;
pub mod sched;
pub mod session;
pub mod startup;
pub mod status;
pub mod steps;
pub mod store;
pub mod util;

pub use atomic::WeightCell;
pub use bus::{DirectBus, StationBus};
pub use calibration::{CalibrationOperator, CalibrationSession};
pub use error::{BuildError, FillerError, LinkResult, Report, Result};
pub use handshake::{HandshakeCfg, HandshakeManager, HandshakeProfile, ScanReport, SkipReason};
pub use link::StationLink;
pub use poller::{StationPoller, StationUpdate};
pub use protocol::{Frame, Opcode, Outgoing, Query, StationEvent};
pub use registry::{SessionState, Station, StationRegistry, StationSpec};
pub use sched::{Ticker, UiPump};
pub use session::FillPlan;
pub use startup::{
    FillMode, Prompt, StartupCfg, StartupContext, StartupOrchestrator, StartupStep, StartupUi,
    StepEnv, UiSignal, UserAction,
};
pub use status::{StartupOutcome, StepName, StepResult};
pub use store::{BottleProfile, SettingsStore, WeightRange};
