//! Terminal front end: prints core events and renders statistics tables.

use chrono::{Local, TimeZone};
use flume::Receiver;
use std::fmt::Write as _;

use crate::{
    core::{
        bus::CoreToUi,
        logs::{LogBuffer, LogEntry},
        stats::{Comparison, PowerSummary},
    },
    protocol::link::DeviceCategory,
};

const CONSOLE_HISTORY: usize = 500;

/// Print events until every core-side sender is gone. Returns the DUT
/// console output and error messages seen along the way.
pub async fn print_events(events: Receiver<CoreToUi>) -> LogBuffer {
    let mut console = LogBuffer::new(CONSOLE_HISTORY);
    while let Ok(event) = events.recv_async().await {
        handle_event(&mut console, event);
    }
    console
}

fn handle_event(console: &mut LogBuffer, event: CoreToUi) {
    match event {
        CoreToUi::State(state) => log::debug!("controller state: {state:?}"),
        CoreToUi::RunnerState { slot, state } => println!("[config {}] {state}", slot + 1),
        CoreToUi::ConsoleOutput(text) => {
            log::debug!("DUT: {}", text.trim_end());
            console.push(LogEntry::console(DeviceCategory::Dut, text));
        }
        CoreToUi::ServoOutput(raw) => log::trace!("servo: {}", raw.trim_end()),
        CoreToUi::Sample { slot, sample } => {
            log::trace!("[config {}] {} mW", slot + 1, sample.power_milliwatts)
        }
        CoreToUi::Annotation { slot, marker } => println!(
            "[config {}] {} at {}",
            slot + 1,
            marker.label,
            format_time(marker.timestamp_millis)
        ),
        CoreToUi::ServoStats { slot, stats } => {
            if stats.requests_skipped > 0 || stats.stale_requests > 0 {
                let message = format!(
                    "[config {}] servo: {} frames, {} requests skipped, {} stale",
                    slot + 1,
                    stats.frames,
                    stats.requests_skipped,
                    stats.stale_requests
                );
                println!("{message}");
                console.push(LogEntry::warning(message));
            }
        }
        CoreToUi::IterationCompleted { slot, iteration } => {
            println!("[config {}] iteration {} recorded", slot + 1, iteration + 1)
        }
        CoreToUi::IterationGraph {
            slot,
            iteration,
            record,
        } => log::debug!(
            "[config {}] iteration {}: {} samples",
            slot + 1,
            iteration + 1,
            record.samples.len()
        ),
        CoreToUi::Summary(_) => {}
        CoreToUi::Error(message) => {
            eprintln!("error: {message}");
            console.push(LogEntry::error(message));
        }
    }
}

pub fn format_time(timestamp_millis: i64) -> String {
    match Local.timestamp_millis_opt(timestamp_millis).single() {
        Some(time) => time.format("%H:%M:%S%.3f").to_string(),
        None => timestamp_millis.to_string(),
    }
}

fn summary_row(out: &mut String, label: &str, summary: Option<&PowerSummary>) {
    let _ = match summary {
        Some(s) => writeln!(
            out,
            "{label:<12} {:>7} {:>8} {:>10.1} {:>10.1} {:>10.1} {:>10.1} {:>8}",
            s.count, s.min, s.q1, s.median, s.mean, s.q3, s.max
        ),
        None => writeln!(out, "{label:<12} {:>7}", "no data"),
    };
}

/// Render a comparison as a plain text table (values in mW).
pub fn format_comparison(comparison: &Comparison) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<12} {:>7} {:>8} {:>10} {:>10} {:>10} {:>10} {:>8}",
        "config", "samples", "min", "q1", "median", "mean", "q3", "max"
    );
    for config in &comparison.configs {
        summary_row(
            &mut out,
            &format!("#{} ({}x)", config.slot + 1, config.iterations),
            config.summary.as_ref(),
        );
    }
    for config in &comparison.configs {
        let _ = writeln!(out, "#{}: {}", config.slot + 1, first_line(&config.script));
    }
    if let Some(diff) = comparison.mean_difference {
        let _ = writeln!(out, "mean difference (#2 - #1): {diff:+.1} mW");
    }
    out
}

pub fn format_summary(label: &str, summary: Option<&PowerSummary>) -> String {
    let mut out = String::new();
    summary_row(&mut out, label, summary);
    out
}

fn first_line(script: &str) -> &str {
    script.lines().next().unwrap_or_default()
}

/// Print the last DUT console lines, to give context to a failure.
pub fn print_console_tail(console: &LogBuffer, lines: usize) {
    let tail: Vec<&LogEntry> = console
        .tail(lines)
        .iter()
        .filter(|e| e.source == Some(DeviceCategory::Dut))
        .collect();
    if tail.is_empty() {
        return;
    }
    eprintln!("last DUT console output:");
    for entry in tail {
        eprintln!(
            "  {} {}",
            entry.timestamp.format("%H:%M:%S"),
            entry.message.trim_end()
        );
    }
}
