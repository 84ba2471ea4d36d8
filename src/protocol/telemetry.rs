//! Servo INA telemetry decoding.
//!
//! The servo answers `ina 0` with a multi-line text block. Lines arrive in
//! arbitrary fragments, so the decoder accumulates text until the block's
//! last line (containing [`SENTINEL`]) shows up, then pulls the milliwatt
//! value out of the `Power => <n> mW` line.

use chrono::Local;

use crate::core::session::PowerSample;

/// Command requesting one telemetry frame. `ina 1` reports the same rail and
/// `ina 2` is not useful for power measurement.
pub const INA_COMMAND: &str = "ina 0\n";

pub const SENTINEL: &str = "Alert limit";

const POWER_PREFIX: &str = "Power";
const VALUE_SEPARATOR: &str = "=>";
/// Fragments this short (after trimming) are partial or noise.
const MIN_LINE_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryFrame {
    pub sample: PowerSample,
    /// Raw text of the whole frame, for display.
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    /// No complete frame yet.
    Pending,
    Frame(TelemetryFrame),
    /// A frame ended but carried no usable power reading. The buffer has been
    /// reset and decoding continues with the next frame.
    Malformed { reason: String, raw: String },
}

impl DecodeEvent {
    /// Whether a request/response round trip finished with this event.
    pub fn completes_request(&self) -> bool {
        !matches!(self, DecodeEvent::Pending)
    }
}

#[derive(Debug, Default, Clone)]
pub struct TelemetryDecoder {
    buffer: String,
}

impl TelemetryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, stamping a completed frame with the wall clock.
    pub fn push(&mut self, chunk: &str) -> DecodeEvent {
        self.push_at(chunk, Local::now().timestamp_millis())
    }

    pub fn push_at(&mut self, chunk: &str, timestamp_millis: i64) -> DecodeEvent {
        self.buffer.push_str(chunk);

        let lines: Vec<&str> = self
            .buffer
            .split('\n')
            .filter(|line| line.trim().len() > MIN_LINE_LEN)
            .collect();
        let frame_done = lines.last().is_some_and(|line| line.contains(SENTINEL));
        if !frame_done {
            return DecodeEvent::Pending;
        }

        let parsed = match lines.iter().find(|line| line.starts_with(POWER_PREFIX)) {
            Some(line) => parse_power_line(line),
            None => Err("no Power line before the sentinel".to_string()),
        };
        let raw = std::mem::take(&mut self.buffer);

        match parsed {
            Ok(power_milliwatts) => DecodeEvent::Frame(TelemetryFrame {
                sample: PowerSample {
                    timestamp_millis,
                    power_milliwatts,
                },
                raw,
            }),
            Err(reason) => {
                log::debug!("dropping malformed telemetry frame: {reason}");
                DecodeEvent::Malformed { reason, raw }
            }
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> &str {
        &self.buffer
    }
}

fn parse_power_line(line: &str) -> Result<i64, String> {
    let value = line
        .split(VALUE_SEPARATOR)
        .nth(1)
        .ok_or_else(|| format!("missing '{VALUE_SEPARATOR}' in {line:?}"))?;
    let token = value
        .split_whitespace()
        .next()
        .ok_or_else(|| format!("missing value in {line:?}"))?;
    token
        .parse::<i64>()
        .map_err(|err| format!("bad power value {token:?}: {err}"))
}
