//! Shared utilities
//!
//! - Serial port discovery and opening
//! - Pacing/sleep helpers

pub mod ports;
pub mod sleep;

pub use ports::*;
pub use sleep::*;
