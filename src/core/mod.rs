//! Measurement core, independent of any front end
//!
//! - Session data model and file formats
//! - Servo telemetry loops and the per-configuration test runner
//! - Session orchestration and statistics
//! - Free-running monitor and a simulated fixture
//! - Message bus and console log types for front ends

pub mod bus;
pub mod controller;
pub mod logs;
pub mod monitor;
pub mod runner;
pub mod servo;
pub mod session;
pub mod simulator;
pub mod stats;

pub use bus::{Bus, CoreToUi, UiToCore};
pub use controller::{ControllerState, PowerTestController, RunOutcome};
pub use runner::{CancelHandle, DutLogin, RunnerSettings};
pub use session::Session;
