//! TES I-V curve characterization and PPS timestamp reconstruction for QUBIC lab data.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub mod config;
pub mod dataset;
pub mod fit;
pub mod interpret;
pub mod jumps;
pub mod pps;
pub mod quality;
pub mod readout;
pub mod timeline;

pub use config::AnalysisConfig;
pub use dataset::{AsicSummary, IvDataset};
pub use fit::{fit_iv, CombinedParams, CubicCoefficients, FitKind, FitModel, FitOptions, FitResult};
pub use interpret::{FitInterpretation, LineFit};
pub use jumps::filter_jumps;
pub use pps::{
    pps2date, pulse_diagnostics, pulse_edges, to_utc, PulseDiagnostics, PulseEvent,
    DEFAULT_PPS_EPSILON,
};
pub use quality::{filter_iv, QualityThresholds, Verdict, VerdictReason};
pub use readout::{normal_resistance, tes_curve, ReadoutCalibration, TesCurve};
pub use timeline::{find_bias_peaks, model_bias, timeline2adu, RemappedSweep, TimelineParams};

/// Denominators with a magnitude at or below this value are treated as zero.
pub const ZERO_EPSILON: f64 = 1e-9;

/// Share of the bias range a sweep must retrace before a reversal is counted.
const REVERSAL_BAND_FRACTION: f64 = 0.1;

/// Fewest points a jump-filtered span may keep before the fit falls back to the whole cycle.
pub const MIN_FIT_POINTS: usize = 11;

#[derive(Error, Debug)]
pub enum IvError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("length mismatch: bias sweep has {bias} samples, channels have {samples}")]
    LengthMismatch { bias: usize, samples: usize },
    #[error("unknown channel {0}")]
    UnknownChannel(usize),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("configuration error: {0}")]
    Config(String),
}

/// `1/x`, saturating at `1/eps` when `|x|` does not exceed `eps`.
pub fn reciprocal_or_cap(x: f64, eps: f64) -> f64 {
    if x.abs() > eps {
        1.0 / x
    } else {
        1.0 / eps
    }
}

/// One TES, numbered from 1 within its ASIC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(usize);

impl ChannelId {
    pub fn new(number: usize) -> Option<Self> {
        (number >= 1).then_some(Self(number))
    }

    pub fn from_index(index: usize) -> Self {
        Self(index + 1)
    }

    pub fn number(self) -> usize {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 - 1
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TES{:03}", self.0)
    }
}

/// Commanded sweep parameters. `cycles == 0` produces a single monotonic ramp.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct BiasRamp {
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub cycles: usize,
    pub start_high: bool,
}

/// Bias voltages shared by every channel of an acquisition.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BiasSweep {
    values: Vec<f64>,
    cycle_count: usize,
    cycled: bool,
}

impl BiasSweep {
    pub fn ramp(ramp: &BiasRamp) -> Result<Self, IvError> {
        let finite = ramp.min.is_finite() && ramp.max.is_finite() && ramp.step.is_finite();
        if !finite || ramp.step <= 0.0 || ramp.max <= ramp.min {
            return Err(IvError::InvalidParameter(format!(
                "bias ramp needs max > min and step > 0 (min={}, max={}, step={})",
                ramp.min, ramp.max, ramp.step
            )));
        }
        let steps = ((ramp.max - ramp.min) / ramp.step).round() as usize;
        let up: Vec<f64> = (0..=steps)
            .map(|i| (ramp.min + i as f64 * ramp.step).min(ramp.max))
            .collect();
        let down: Vec<f64> = up.iter().rev().copied().collect();
        let (first, second) = if ramp.start_high {
            (&down, &up)
        } else {
            (&up, &down)
        };

        if ramp.cycles == 0 {
            return Ok(Self {
                values: first.clone(),
                cycle_count: 1,
                cycled: false,
            });
        }

        let mut values = Vec::with_capacity(ramp.cycles * 2 * up.len());
        for _ in 0..ramp.cycles {
            values.extend_from_slice(first);
            values.extend_from_slice(second);
        }
        Ok(Self {
            values,
            cycle_count: ramp.cycles,
            cycled: true,
        })
    }

    /// Wrap an acquired sweep. A `cycle_count` of zero is treated as a single ramp.
    pub fn from_values(values: Vec<f64>, cycle_count: usize) -> Self {
        Self {
            values,
            cycle_count: cycle_count.max(1),
            cycled: cycle_count > 0,
        }
    }

    /// Wrap an acquired sweep, inferring the cycle count from its direction reversals.
    pub fn detect(values: Vec<f64>) -> Self {
        let reversals = count_reversals(&values, reversal_band(&values));
        let cycles = ((reversals + 1) / 2).max(1);
        let per_cycle = values.len() / cycles;
        if per_cycle < MIN_FIT_POINTS {
            warn!(
                cycles,
                samples = values.len(),
                per_cycle,
                "detected cycles are too short to fit; pass the cycle count explicitly"
            );
        }
        Self {
            values,
            cycle_count: cycles,
            cycled: reversals > 0,
        }
    }

    /// Up/down cycles in `values`, ignoring excursions smaller than a tenth of its range.
    pub fn detect_cycles(values: &[f64]) -> usize {
        let reversals = count_reversals(values, reversal_band(values));
        ((reversals + 1) / 2).max(1)
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn cycle_count(&self) -> usize {
        self.cycle_count
    }

    /// True when the sweep repeats up/down traversals rather than a single ramp.
    pub fn is_cycled(&self) -> bool {
        self.cycled
    }

    pub fn min(&self) -> f64 {
        self.values.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Median absolute sample-to-sample step.
    pub fn step(&self) -> f64 {
        let mut steps: Vec<f64> = self
            .values
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .filter(|s| *s > 0.0)
            .collect();
        if steps.is_empty() {
            return 0.0;
        }
        steps.sort_by(|a, b| a.total_cmp(b));
        steps[steps.len() / 2]
    }

    /// Sample range of one cycle.
    pub fn segment(&self, cycle: usize) -> Range<usize> {
        segment_range(cycle, self.cycle_count, self.len())
    }
}

/// Index range of one of `cycles` equal contiguous segments of `total` samples.
pub(crate) fn segment_range(cycle: usize, cycles: usize, total: usize) -> Range<usize> {
    let len = total / cycles.max(1);
    let start = (cycle * len).min(total);
    start..(start + len).min(total)
}

/// Direction changes that retreat more than `band` from the running extreme.
fn count_reversals(values: &[f64], band: f64) -> usize {
    let Some((&first, rest)) = values.split_first() else {
        return 0;
    };
    let mut reversals = 0;
    let mut direction = 0i8;
    let mut extreme = first;
    for &v in rest {
        if v.is_nan() {
            continue;
        }
        match direction {
            1 if v > extreme => extreme = v,
            -1 if v < extreme => extreme = v,
            1 if extreme - v > band => {
                reversals += 1;
                direction = -1;
                extreme = v;
            }
            -1 if v - extreme > band => {
                reversals += 1;
                direction = 1;
                extreme = v;
            }
            0 if (v - extreme).abs() > band => {
                direction = if v > extreme { 1 } else { -1 };
                extreme = v;
            }
            _ => {}
        }
    }
    reversals
}

/// Read noise on a measured bias column must not count as a reversal.
fn reversal_band(values: &[f64]) -> f64 {
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if hi > lo {
        (REVERSAL_BAND_FRACTION * (hi - lo)).max(ZERO_EPSILON)
    } else {
        ZERO_EPSILON
    }
}

pub(crate) fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((idx, v)),
        }
    }
    best.map(|(idx, _)| idx)
}

pub(crate) fn argmin(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v >= b => {}
            _ => best = Some((idx, v)),
        }
    }
    best.map(|(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reciprocal_or_cap_saturates() {
        assert_eq!(reciprocal_or_cap(0.5, ZERO_EPSILON), 2.0);
        assert_eq!(reciprocal_or_cap(0.0, ZERO_EPSILON), 1.0 / ZERO_EPSILON);
        assert!(reciprocal_or_cap(1e-12, ZERO_EPSILON).is_finite());
    }

    #[test]
    fn test_ramp_single_and_cycled() {
        let single = BiasSweep::ramp(&BiasRamp {
            min: 1.0,
            max: 2.0,
            step: 0.25,
            cycles: 0,
            start_high: false,
        })
        .unwrap();
        assert_eq!(single.values(), &[1.0, 1.25, 1.5, 1.75, 2.0]);
        assert_eq!(single.cycle_count(), 1);
        assert!(!single.is_cycled());

        let cycled = BiasSweep::ramp(&BiasRamp {
            min: 1.0,
            max: 2.0,
            step: 0.5,
            cycles: 2,
            start_high: true,
        })
        .unwrap();
        assert_eq!(
            cycled.values(),
            &[2.0, 1.5, 1.0, 1.0, 1.5, 2.0, 2.0, 1.5, 1.0, 1.0, 1.5, 2.0]
        );
        assert_eq!(cycled.cycle_count(), 2);
        assert_eq!(cycled.segment(1), 6..12);
        assert!((cycled.step() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_ramp_rejects_bad_parameters() {
        let err = BiasSweep::ramp(&BiasRamp {
            min: 2.0,
            max: 1.0,
            step: 0.1,
            cycles: 1,
            start_high: false,
        });
        assert!(matches!(err, Err(IvError::InvalidParameter(_))));
    }

    #[test]
    fn test_detect_cycles_counts_reversals() {
        assert_eq!(BiasSweep::detect_cycles(&[1.0, 2.0, 3.0]), 1);
        assert_eq!(BiasSweep::detect_cycles(&[1.0, 2.0, 3.0, 2.0, 1.0]), 1);
        assert_eq!(
            BiasSweep::detect_cycles(&[1.0, 2.0, 3.0, 2.0, 1.0, 2.0, 3.0, 2.0, 1.0]),
            2
        );
        let sweep = BiasSweep::detect(vec![1.0, 2.0, 1.0, 2.0, 1.0]);
        assert_eq!(sweep.cycle_count(), 2);
        assert!(sweep.is_cycled());
    }

    #[test]
    fn test_detect_ignores_read_noise() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(5);
        let up: Vec<f64> = (0..=200).map(|i| 1.0 + 0.01 * i as f64).collect();
        let down: Vec<f64> = up.iter().rev().copied().collect();
        let mut values = Vec::new();
        for _ in 0..2 {
            values.extend_from_slice(&up);
            values.extend_from_slice(&down);
        }
        let noisy: Vec<f64> = values
            .iter()
            .map(|v| v + rng.gen_range(-0.02..0.02))
            .collect();

        assert_eq!(BiasSweep::detect_cycles(&noisy), 2);
        let sweep = BiasSweep::detect(noisy);
        assert_eq!(sweep.cycle_count(), 2);
        assert!(sweep.is_cycled());

        let flat = BiasSweep::detect(vec![2.0; 50]);
        assert_eq!(flat.cycle_count(), 1);
        assert!(!flat.is_cycled());
    }

    #[test]
    fn test_channel_numbering() {
        assert!(ChannelId::new(0).is_none());
        let ch = ChannelId::new(12).unwrap();
        assert_eq!(ch.index(), 11);
        assert_eq!(ChannelId::from_index(11), ch);
        assert_eq!(ch.to_string(), "TES012");
    }

    #[test]
    fn test_argmax_argmin_first_extreme() {
        assert_eq!(argmax(&[1.0, 3.0, f64::NAN, 3.0]), Some(1));
        assert_eq!(argmin(&[2.0, 0.5, 0.5]), Some(1));
        assert_eq!(argmax(&[]), None);
    }
}
