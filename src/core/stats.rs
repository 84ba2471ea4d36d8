//! Distribution summaries of measured power.
//!
//! Quantiles use linear interpolation between closest ranks (`h = (n - 1) * p`),
//! which is what the charting side of the tool has always displayed.

use serde::Serialize;

use super::session::{PowerSample, RunnerConfig, Session};

pub const DEFAULT_HISTOGRAM_BINS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerSummary {
    pub count: usize,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub iqr: f64,
    pub lower_fence: f64,
    pub upper_fence: f64,
}

/// Quantile `p` of an ascending slice.
pub fn quantile_sorted(sorted: &[i64], p: f64) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    if p <= 0.0 || n == 1 {
        return Some(sorted[0] as f64);
    }
    if p >= 1.0 {
        return Some(sorted[n - 1] as f64);
    }
    let h = (n - 1) as f64 * p;
    let i = h.floor() as usize;
    let lo = sorted[i] as f64;
    let hi = sorted[i + 1] as f64;
    Some(lo + (hi - lo) * (h - i as f64))
}

pub fn summarize(values: &[i64]) -> Option<PowerSummary> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();

    let q1 = quantile_sorted(&sorted, 0.25)?;
    let median = quantile_sorted(&sorted, 0.5)?;
    let q3 = quantile_sorted(&sorted, 0.75)?;
    let iqr = q3 - q1;
    let sum: f64 = sorted.iter().map(|&v| v as f64).sum();

    Some(PowerSummary {
        count: sorted.len(),
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        mean: sum / sorted.len() as f64,
        q1,
        median,
        q3,
        iqr,
        lower_fence: q1 - 1.5 * iqr,
        upper_fence: q3 + 1.5 * iqr,
    })
}

/// Summary of the samples whose timestamp lies in `[from, to]`.
pub fn summarize_range(samples: &[PowerSample], from: i64, to: i64) -> Option<PowerSummary> {
    let values: Vec<i64> = samples
        .iter()
        .filter(|s| s.timestamp_millis >= from && s.timestamp_millis <= to)
        .map(|s| s.power_milliwatts)
        .collect();
    summarize(&values)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    /// One count per series, in series order.
    pub counts: Vec<usize>,
}

/// 1, 2 or 5 times a power of ten, close to `span / count`.
fn nice_step(span: f64, count: usize) -> f64 {
    let raw = span / count.max(1) as f64;
    let power = raw.log10().floor();
    let base = 10f64.powf(power);
    let error = raw / base;
    let factor = if error >= 50f64.sqrt() {
        10.0
    } else if error >= 10f64.sqrt() {
        5.0
    } else if error >= 2f64.sqrt() {
        2.0
    } else {
        1.0
    };
    factor * base
}

/// Histogram with bins shared by every series. `None` when all series are
/// empty.
pub fn histogram(series: &[Vec<i64>], target_bins: usize) -> Option<Vec<HistogramBin>> {
    let all = series.iter().flatten();
    let min = *all.clone().min()? as f64;
    let max = *all.max()? as f64;

    let (lower, step, bin_count) = if max > min {
        let step = nice_step(max - min, target_bins);
        let lower = (min / step).floor() * step;
        let upper = (max / step).ceil() * step;
        let count = (((upper - lower) / step).round() as usize).max(1);
        (lower, step, count)
    } else {
        (min, 1.0, 1)
    };

    let mut bins: Vec<HistogramBin> = (0..bin_count)
        .map(|i| HistogramBin {
            lower: lower + step * i as f64,
            upper: lower + step * (i + 1) as f64,
            counts: vec![0; series.len()],
        })
        .collect();

    for (s, values) in series.iter().enumerate() {
        for &v in values {
            // The top edge belongs to the last bin.
            let index = (((v as f64 - lower) / step).floor() as usize).min(bin_count - 1);
            bins[index].counts[s] += 1;
        }
    }
    Some(bins)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSummary {
    pub slot: usize,
    pub script: String,
    pub iterations: usize,
    pub summary: Option<PowerSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub configs: Vec<ConfigSummary>,
    /// Mean of the second configuration minus mean of the first, when exactly
    /// two configurations are compared.
    pub mean_difference: Option<f64>,
    pub histogram: Option<Vec<HistogramBin>>,
}

/// Summaries of the margin-trimmed power of every configuration.
pub fn compare(session: &Session) -> Comparison {
    build_comparison(session, session.aggregate_power(), |config| {
        config.iteration_records.len()
    })
}

/// Like [`compare`], restricted to one iteration (zero based).
pub fn compare_iteration(session: &Session, iteration: usize) -> Comparison {
    let series: Vec<Vec<i64>> = session
        .runner_configs
        .iter()
        .map(|config| {
            config
                .iteration_records
                .get(iteration)
                .map(|record| {
                    record
                        .trimmed_samples(session.margin_time_millis)
                        .iter()
                        .map(|s| s.power_milliwatts)
                        .collect::<Vec<i64>>()
                })
                .unwrap_or_default()
        })
        .collect();
    build_comparison(session, series, |config| {
        usize::from(config.iteration_records.len() > iteration)
    })
}

fn build_comparison(
    session: &Session,
    series: Vec<Vec<i64>>,
    iterations: impl Fn(&RunnerConfig) -> usize,
) -> Comparison {
    let configs: Vec<ConfigSummary> = session
        .runner_configs
        .iter()
        .zip(&series)
        .enumerate()
        .map(|(slot, (config, values))| ConfigSummary {
            slot,
            script: config.script_text.clone(),
            iterations: iterations(config),
            summary: summarize(values),
        })
        .collect();

    let mean_difference = match configs.as_slice() {
        [a, b] => match (&a.summary, &b.summary) {
            (Some(a), Some(b)) => Some(b.mean - a.mean),
            _ => None,
        },
        _ => None,
    };

    Comparison {
        configs,
        mean_difference,
        histogram: histogram(&series, DEFAULT_HISTOGRAM_BINS),
    }
}
