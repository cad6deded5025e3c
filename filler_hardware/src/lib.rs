#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Serial transport and simulated firmware for filling stations.
//!
//! Everything here implements the seams in `filler_traits`; protocol meaning
//! lives in `filler_core`.

pub mod error;
pub mod serial;
pub mod sim;
pub mod util;

pub use serial::{PortInfo, SerialPortEndpoint, SerialPortOpener, list_ports};
pub use sim::{DeviceProfile, Fault, IdentityStyle, SimHandle, SimulatedOpener, SimulatedStation};
