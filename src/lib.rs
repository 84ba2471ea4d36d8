//! servo_power: DUT power measurement through a servo board
//!
//! The crate drives a servo (the power-measurement fixture) and the console
//! of a device under test. Workload scripts are shipped to the DUT, executed
//! between `start`/`end` markers, and the servo's INA telemetry is sampled
//! meanwhile. Several configurations are run for several iterations and
//! compared with margin-trimmed statistics. Sessions can be exported and
//! imported as JSON.
//!
//! Layers, bottom up: [`protocol`] (links, telemetry decoding, script
//! transport), [`core`] (servo loops, runners, orchestration, statistics) and
//! [`cli`] (the terminal front end).

#[doc(hidden)]
pub mod boot;
pub mod cli;
pub mod core;
pub mod error;
pub mod protocol;
pub mod utils;

pub use boot::{init_common, start};
pub use error::{PowerTestError, Result};
