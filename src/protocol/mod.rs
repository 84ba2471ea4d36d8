//! Device-facing protocol layer: links, the serial I/O loop, telemetry
//! decoding and the DUT script transport.

pub mod link;
pub mod runtime;
pub mod script;
pub mod telemetry;
