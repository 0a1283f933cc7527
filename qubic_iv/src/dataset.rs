//! One ASIC acquisition: shared bias sweep, per-channel samples and cached verdicts.

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::Array2;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AnalysisConfig;
use crate::quality::{filter_iv, Verdict, VerdictReason};
use crate::readout::{tes_curve, ReadoutCalibration, TesCurve};
use crate::{BiasSweep, ChannelId, IvError};

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AsicSummary {
    pub channel_count: usize,
    pub analysed_count: usize,
    pub good_count: usize,
    pub good_channels: Vec<ChannelId>,
    pub mean_turnover: Option<f64>,
    pub median_turnover: Option<f64>,
    pub mean_r1: Option<f64>,
    pub rejections: BTreeMap<VerdictReason, usize>,
}

#[derive(Clone, Debug)]
pub struct IvDataset {
    sweep: BiasSweep,
    samples: Array2<f64>,
    verdicts: BTreeMap<ChannelId, Arc<Verdict>>,
}

impl IvDataset {
    /// `samples` holds one row per channel and one column per bias sample.
    pub fn new(sweep: BiasSweep, samples: Array2<f64>) -> Result<Self, IvError> {
        check_shape(&sweep, &samples)?;
        Ok(Self {
            sweep,
            samples,
            verdicts: BTreeMap::new(),
        })
    }

    pub fn sweep(&self) -> &BiasSweep {
        &self.sweep
    }

    pub fn samples(&self) -> &Array2<f64> {
        &self.samples
    }

    pub fn channel_count(&self) -> usize {
        self.samples.nrows()
    }

    pub fn channels(&self) -> impl Iterator<Item = ChannelId> {
        (0..self.channel_count()).map(ChannelId::from_index)
    }

    pub fn channel_samples(&self, id: ChannelId) -> Result<Vec<f64>, IvError> {
        if id.index() >= self.channel_count() {
            return Err(IvError::UnknownChannel(id.number()));
        }
        Ok(self.samples.row(id.index()).to_vec())
    }

    pub fn verdict(&self, id: ChannelId) -> Option<Arc<Verdict>> {
        self.verdicts.get(&id).cloned()
    }

    pub fn verdicts(&self) -> &BTreeMap<ChannelId, Arc<Verdict>> {
        &self.verdicts
    }

    /// Fit and judge one channel, replacing any cached verdict for it.
    pub fn filter_channel(
        &mut self,
        id: ChannelId,
        config: &AnalysisConfig,
    ) -> Result<Arc<Verdict>, IvError> {
        let samples = self.channel_samples(id)?;
        let verdict = Arc::new(filter_iv(
            &samples,
            &self.sweep,
            &config.fit_options(),
            &config.thresholds,
        ));
        debug!(channel = %id, reason = verdict.reason.as_str(), "channel filtered");
        self.verdicts.insert(id, Arc::clone(&verdict));
        Ok(verdict)
    }

    /// Fit and judge every channel in parallel.
    pub fn filter_all(&mut self, config: &AnalysisConfig) -> &BTreeMap<ChannelId, Arc<Verdict>> {
        let options = config.fit_options();
        let ids: Vec<ChannelId> = self.channels().collect();
        let results: Vec<(ChannelId, Verdict)> = ids
            .into_par_iter()
            .map(|id| {
                let row = self.samples.row(id.index()).to_vec();
                let verdict = filter_iv(&row, &self.sweep, &options, &config.thresholds);
                (id, verdict)
            })
            .collect();

        for (id, verdict) in results {
            self.verdicts.insert(id, Arc::new(verdict));
        }
        let good = self.verdicts.values().filter(|v| v.is_good).count();
        info!(
            channels = self.channel_count(),
            good,
            kind = options.kind.name(),
            "filtered all channels"
        );
        &self.verdicts
    }

    /// Offset-adjusted curve over the fitted cycle of a channel with a cached verdict.
    ///
    /// `None` until the channel has been filtered, or when its fit yields no offset.
    pub fn tes_curve(
        &self,
        id: ChannelId,
        readout: &ReadoutCalibration,
    ) -> Result<Option<TesCurve>, IvError> {
        let samples = self.channel_samples(id)?;
        let Some(verdict) = self.verdicts.get(&id) else {
            return Ok(None);
        };
        let Some(offset) = verdict.fit.offset() else {
            return Ok(None);
        };
        let (start, end) = verdict.fit.cycle_range;
        let end = end.min(samples.len());
        let start = start.min(end);
        let bias = &self.sweep.values()[start..end];
        Ok(Some(tes_curve(bias, &samples[start..end], offset, readout)))
    }

    /// Swap in a new sample matrix; every cached verdict is dropped.
    pub fn replace_samples(&mut self, samples: Array2<f64>) -> Result<(), IvError> {
        check_shape(&self.sweep, &samples)?;
        self.samples = samples;
        self.verdicts.clear();
        Ok(())
    }

    pub fn summary(&self) -> AsicSummary {
        let mut summary = AsicSummary {
            channel_count: self.channel_count(),
            analysed_count: self.verdicts.len(),
            ..AsicSummary::default()
        };

        let mut turnovers = Vec::new();
        let mut r1s = Vec::new();
        for (id, verdict) in &self.verdicts {
            if !verdict.is_good {
                *summary.rejections.entry(verdict.reason).or_insert(0) += 1;
                continue;
            }
            summary.good_channels.push(*id);
            if let Some(t) = verdict.fit.turnover() {
                turnovers.push(t);
            }
            if let Some(r1) = verdict.fit.r1() {
                r1s.push(r1);
            }
        }
        summary.good_count = summary.good_channels.len();
        summary.mean_turnover = mean(&turnovers);
        summary.median_turnover = median(&turnovers);
        summary.mean_r1 = mean(&r1s);
        summary
    }
}

fn check_shape(sweep: &BiasSweep, samples: &Array2<f64>) -> Result<(), IvError> {
    if samples.nrows() == 0 || samples.ncols() == 0 {
        return Err(IvError::InsufficientData(
            "sample matrix has no channels or no samples".to_string(),
        ));
    }
    if samples.ncols() != sweep.len() {
        return Err(IvError::LengthMismatch {
            bias: sweep.len(),
            samples: samples.ncols(),
        });
    }
    Ok(())
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

fn median(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<OrderedFloat<f64>> = values.iter().copied().map(OrderedFloat).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some(0.5 * (sorted[mid - 1].0 + sorted[mid].0))
    } else {
        Some(sorted[mid].0)
    }
}
