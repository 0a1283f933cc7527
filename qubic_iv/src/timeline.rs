//! Remap a free-running timeline acquisition onto a modeled sinusoidal bias sweep.

use std::f64::consts::{FRAC_PI_2, PI};

use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dataset::IvDataset;
use crate::{argmax, BiasSweep, ChannelId, IvError};

fn default_skip_s() -> f64 {
    3.0
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct TimelineParams {
    pub bias_period_s: f64,
    pub sample_period_s: f64,
    pub min_bias: f64,
    pub max_bias: f64,
    /// Manual phase correction, in bias periods.
    #[serde(default)]
    pub shift: f64,
    /// Noisy lead-in ignored by the peak search.
    #[serde(default = "default_skip_s")]
    pub skip_s: f64,
}

impl TimelineParams {
    pub fn new(bias_period_s: f64, sample_period_s: f64, min_bias: f64, max_bias: f64) -> Self {
        Self {
            bias_period_s,
            sample_period_s,
            min_bias,
            max_bias,
            shift: 0.0,
            skip_s: default_skip_s(),
        }
    }

    fn validate(&self) -> Result<(), IvError> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.bias_period_s) || !positive(self.sample_period_s) {
            return Err(IvError::InvalidParameter(format!(
                "bias period ({}) and sample period ({}) must be positive",
                self.bias_period_s, self.sample_period_s
            )));
        }
        Ok(())
    }

    pub fn period_samples(&self) -> usize {
        (self.bias_period_s / self.sample_period_s).floor() as usize
    }

    fn skip_samples(&self) -> usize {
        (self.skip_s.max(0.0) / self.sample_period_s).floor() as usize
    }
}

/// Sliced bias and sample matrix between two bias maxima.
#[derive(Clone, Debug, PartialEq)]
pub struct RemappedSweep {
    pub bias: Vec<f64>,
    pub samples: Array2<f64>,
    /// Indices of the two maxima in the original timeline.
    pub peaks: (usize, usize),
    /// Whole bias periods between the peaks; zero for a single ramp.
    pub cycles: usize,
}

impl RemappedSweep {
    pub fn sweep(&self) -> BiasSweep {
        BiasSweep::from_values(self.bias.clone(), self.cycles)
    }

    pub fn into_dataset(self) -> Result<IvDataset, IvError> {
        let sweep = self.sweep();
        IvDataset::new(sweep, self.samples)
    }
}

/// Two successive maxima of `trace`, one bias period apart.
///
/// The first is searched in `[skip, skip + period)` and the second in the following
/// window of the same width; a failed search falls back to the first or last index.
pub fn find_bias_peaks(trace: &[f64], period_samples: usize, skip: usize) -> (usize, usize) {
    let n = trace.len();
    let last = n.saturating_sub(1);
    let search = |start: usize| -> Option<usize> {
        let end = start.saturating_add(period_samples).min(n);
        if start >= end {
            return None;
        }
        argmax(&trace[start..end]).map(|i| start + i)
    };

    let peak0 = search(skip).unwrap_or_else(|| {
        warn!(skip, period_samples, samples = n, "first bias peak not found; using index 0");
        0
    });
    let peak1 = search(skip.saturating_add(period_samples))
        .filter(|&p| p > peak0)
        .unwrap_or_else(|| {
            warn!(
                peak0,
                period_samples,
                samples = n,
                "second bias peak not found; using the last index"
            );
            last
        });
    (peak0, peak1)
}

/// Sinusoidal bias model with its maximum at `peak0`, shifted by `params.shift` periods.
pub fn model_bias(len: usize, peak0: usize, params: &TimelineParams) -> Vec<f64> {
    let amplitude = 0.5 * (params.max_bias - params.min_bias);
    let offset = params.min_bias + amplitude;
    let t_peak = peak0 as f64 * params.sample_period_s;
    (0..len)
        .map(|i| {
            let t = i as f64 * params.sample_period_s;
            let phase = 2.0 * PI * (t - t_peak) / params.bias_period_s
                + FRAC_PI_2
                + params.shift * 2.0 * PI;
            offset + amplitude * phase.sin()
        })
        .collect()
}

/// Slice a timeline (one row per channel, one column per time sample) to one bias period
/// found on `reference` and pair it with the modeled bias.
///
/// A reference channel that does not exist is logged and replaced by the first channel.
pub fn timeline2adu(
    reference: ChannelId,
    timeline: &Array2<f64>,
    params: &TimelineParams,
) -> Result<RemappedSweep, IvError> {
    params.validate()?;
    if timeline.nrows() == 0 || timeline.ncols() == 0 {
        return Err(IvError::InsufficientData("timeline is empty".to_string()));
    }

    let reference = if reference.index() < timeline.nrows() {
        reference
    } else {
        warn!(
            reference = %reference,
            channels = timeline.nrows(),
            "reference channel out of range; using the first channel"
        );
        ChannelId::from_index(0)
    };

    let trace = timeline.row(reference.index()).to_vec();
    let period_samples = params.period_samples();
    let (peak0, peak1) = find_bias_peaks(&trace, period_samples, params.skip_samples());
    let peak1 = peak1.max(peak0);

    let bias = model_bias(timeline.ncols(), peak0, params);
    let cycles =
        ((peak1 - peak0) as f64 * params.sample_period_s / params.bias_period_s).round() as usize;
    if cycles == 0 {
        debug!(peak0, peak1, "less than one bias period between peaks; single ramp");
    }

    Ok(RemappedSweep {
        bias: bias[peak0..=peak1].to_vec(),
        samples: timeline.slice(s![.., peak0..=peak1]).to_owned(),
        peaks: (peak0, peak1),
        cycles,
    })
}
