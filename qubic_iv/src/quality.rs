//! Accept or reject a channel's I-V curve.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fit::{fit_iv, FitOptions, FitResult};
use crate::BiasSweep;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QualityThresholds {
    pub residual_limit: f64,
    /// Minimum peak-to-peak current of the fitted cycle.
    pub abs_amplitude_limit: f64,
    /// Minimum peak-to-peak current relative to the mean current.
    pub rel_amplitude_limit: f64,
    /// The turnover must sit at least this far inside the sweep's bias range.
    pub bias_margin: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            residual_limit: 3.0,
            abs_amplitude_limit: 0.01,
            rel_amplitude_limit: 0.1,
            bias_margin: 0.2,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VerdictReason {
    #[serde(rename = "no comment")]
    NoComment,
    #[serde(rename = "bad poly fit")]
    BadPolyFit,
    #[serde(rename = "current too low")]
    CurrentTooLow,
    #[serde(rename = "current peak-to-peak too small")]
    PeakToPeakTooSmall,
    #[serde(rename = "no turnover")]
    NoTurnover,
    #[serde(rename = "operation point outside acceptable range")]
    OutsideRange,
}

impl VerdictReason {
    pub const ALL: [VerdictReason; 6] = [
        VerdictReason::NoComment,
        VerdictReason::BadPolyFit,
        VerdictReason::CurrentTooLow,
        VerdictReason::PeakToPeakTooSmall,
        VerdictReason::NoTurnover,
        VerdictReason::OutsideRange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictReason::NoComment => "no comment",
            VerdictReason::BadPolyFit => "bad poly fit",
            VerdictReason::CurrentTooLow => "current too low",
            VerdictReason::PeakToPeakTooSmall => "current peak-to-peak too small",
            VerdictReason::NoTurnover => "no turnover",
            VerdictReason::OutsideRange => "operation point outside acceptable range",
        }
    }
}

impl fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    pub is_good: bool,
    pub reason: VerdictReason,
    pub peak_to_peak: f64,
    pub fit: FitResult,
}

/// Fit a channel and run the checks in order; the first failure decides the reason.
pub fn filter_iv(
    samples: &[f64],
    sweep: &BiasSweep,
    options: &FitOptions,
    thresholds: &QualityThresholds,
) -> Verdict {
    let fit = fit_iv(samples, sweep, options);
    let (start, end) = fit.cycle_range;
    let cycle = &samples[start.min(samples.len())..end.min(samples.len())];
    let peak_to_peak = peak_to_peak(cycle);
    let reason = judge(&fit, cycle, peak_to_peak, sweep, thresholds);
    debug!(reason = reason.as_str(), residual = fit.residual, peak_to_peak, "verdict");
    Verdict {
        is_good: reason == VerdictReason::NoComment,
        reason,
        peak_to_peak,
        fit,
    }
}

fn judge(
    fit: &FitResult,
    cycle: &[f64],
    peak_to_peak: f64,
    sweep: &BiasSweep,
    thresholds: &QualityThresholds,
) -> VerdictReason {
    if fit.residual.is_nan() || fit.residual > thresholds.residual_limit {
        return VerdictReason::BadPolyFit;
    }
    if peak_to_peak.is_nan() || peak_to_peak < thresholds.abs_amplitude_limit {
        return VerdictReason::CurrentTooLow;
    }
    let mean = cycle.iter().sum::<f64>() / cycle.len() as f64;
    if (peak_to_peak / mean).abs() < thresholds.rel_amplitude_limit {
        return VerdictReason::PeakToPeakTooSmall;
    }
    let Some(turnover) = fit.turnover() else {
        return VerdictReason::NoTurnover;
    };
    let lowest = sweep.min() + thresholds.bias_margin;
    let highest = sweep.max() - thresholds.bias_margin;
    if turnover < lowest || turnover > highest {
        return VerdictReason::OutsideRange;
    }
    VerdictReason::NoComment
}

fn peak_to_peak(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    hi - lo
}
