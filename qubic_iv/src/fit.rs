//! I-V curve fitting: one cubic over the whole cycle, or a three-branch piecewise model.
//!
//! The piecewise ("combined") model is quadratic below the turnover bias, quadratic between
//! the turnover and the normal-branch bias, and linear above. For fixed breakpoints the three
//! branches are independent linear least-squares problems, so the fit searches the two
//! breakpoints on a coarse grid, refines around the best pair, and solves the branch
//! coefficients exactly at every candidate.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::interpret::{interpret, FitInterpretation};
use crate::jumps::filter_jumps;
use crate::{argmin, segment_range, BiasSweep, MIN_FIT_POINTS};

const SVD_EPSILON: f64 = 1e-12;
const COMBINED_COARSE_GRID: usize = 33;
const COMBINED_REFINE_GRID: usize = 9;
const COMBINED_MIN_BRANCH_POINTS: usize = 3;
const COMBINED_SEED: f64 = 1.0;
const MIN_SEGMENT_POINTS: usize = 4;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FitKind {
    #[default]
    Polynomial,
    Combined,
}

impl FitKind {
    pub fn name(&self) -> &'static str {
        match self {
            FitKind::Polynomial => "POLYNOMIAL",
            FitKind::Combined => "COMBINED",
        }
    }

    /// Fit one span of (bias, current) pairs, returning the model and its residual.
    ///
    /// Polynomial residuals are the sum of squared errors over the point count; combined
    /// residuals are the RMS error.
    pub fn fit(&self, bias: &[f64], current: &[f64]) -> (FitModel, f64) {
        match self {
            FitKind::Polynomial => fit_polynomial(bias, current),
            FitKind::Combined => fit_combined(bias, current),
        }
    }
}

/// Cubic `a0 + a1*v + a2*v^2 + a3*v^3`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CubicCoefficients {
    pub a0: f64,
    pub a1: f64,
    pub a2: f64,
    pub a3: f64,
}

impl CubicCoefficients {
    fn from_ascending(coeffs: &[f64]) -> Self {
        let at = |i: usize| coeffs.get(i).copied().unwrap_or(0.0);
        Self {
            a0: at(0),
            a1: at(1),
            a2: at(2),
            a3: at(3),
        }
    }

    pub fn evaluate(&self, v: f64) -> f64 {
        self.a0 + v * (self.a1 + v * (self.a2 + v * self.a3))
    }

    pub fn slope(&self, v: f64) -> f64 {
        self.a1 + v * (2.0 * self.a2 + 3.0 * self.a3 * v)
    }

    pub fn curvature(&self, v: f64) -> f64 {
        2.0 * self.a2 + 6.0 * self.a3 * v
    }
}

/// Ten parameters of the piecewise model.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct CombinedParams {
    pub v_turnover: f64,
    pub v_normal: f64,
    pub a0: f64,
    pub a1: f64,
    pub a2: f64,
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub c0: f64,
    pub c1: f64,
}

impl CombinedParams {
    fn seeded(v_turnover: f64, v_normal: f64) -> Self {
        Self {
            v_turnover,
            v_normal,
            a0: COMBINED_SEED,
            a1: COMBINED_SEED,
            a2: COMBINED_SEED,
            b0: COMBINED_SEED,
            b1: COMBINED_SEED,
            b2: COMBINED_SEED,
            c0: COMBINED_SEED,
            c1: COMBINED_SEED,
        }
    }

    pub fn evaluate(&self, v: f64) -> f64 {
        if v < self.v_turnover {
            self.a0 + self.a1 * v + self.a2 * v * v
        } else if v < self.v_normal {
            self.b0 + self.b1 * v + self.b2 * v * v
        } else {
            self.normal_branch(v)
        }
    }

    pub fn normal_branch(&self, v: f64) -> f64 {
        self.c0 + self.c1 * v
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "params", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FitModel {
    Polynomial(CubicCoefficients),
    Combined(CombinedParams),
}

impl FitModel {
    pub fn kind(&self) -> FitKind {
        match self {
            FitModel::Polynomial(_) => FitKind::Polynomial,
            FitModel::Combined(_) => FitKind::Combined,
        }
    }

    pub fn evaluate(&self, v: f64) -> f64 {
        match self {
            FitModel::Polynomial(c) => c.evaluate(v),
            FitModel::Combined(p) => p.evaluate(v),
        }
    }

    /// Raw coefficient vector: `[a0, a1, a2, a3]` for the cubic,
    /// `[v_turnover, v_normal, a0, a1, a2, b0, b1, b2, c0, c1]` for the combined model.
    pub fn coefficients(&self) -> Vec<f64> {
        match self {
            FitModel::Polynomial(c) => vec![c.a0, c.a1, c.a2, c.a3],
            FitModel::Combined(p) => vec![
                p.v_turnover,
                p.v_normal,
                p.a0,
                p.a1,
                p.a2,
                p.b0,
                p.b1,
                p.b2,
                p.c0,
                p.c1,
            ],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FitOptions {
    pub kind: FitKind,
    pub jump_threshold: Option<f64>,
    pub forced_cycle_index: Option<usize>,
}

/// Fit of one channel: the selected cycle plus everything derived from it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FitResult {
    pub kind: FitKind,
    pub model: FitModel,
    pub residual: f64,
    /// Cycle the result describes (forced or best).
    pub cycle_index: usize,
    pub best_cycle_index: usize,
    pub cycle_residuals: Vec<f64>,
    /// Half-open sample range of the selected cycle.
    pub cycle_range: (usize, usize),
    /// Inclusive sample range actually used by the fit.
    pub fit_range: (usize, usize),
    pub derived: FitInterpretation,
}

impl FitResult {
    pub fn turnover(&self) -> Option<f64> {
        self.derived.turnover
    }

    pub fn r1(&self) -> Option<f64> {
        self.derived.r1
    }

    pub fn offset(&self) -> Option<f64> {
        self.derived.offset
    }

    pub fn fit_points(&self) -> usize {
        self.fit_range.1 + 1 - self.fit_range.0
    }
}

#[derive(Clone, Debug)]
struct SegmentFit {
    model: FitModel,
    residual: f64,
    start: usize,
    end: usize,
}

/// Fit one channel's samples against the shared bias sweep.
///
/// Every cycle is fitted; the caller's forced cycle wins when it exists, otherwise the
/// lowest residual. A forced index out of range is logged and ignored.
pub fn fit_iv(samples: &[f64], sweep: &BiasSweep, options: &FitOptions) -> FitResult {
    if samples.len() != sweep.len() {
        warn!(
            samples = samples.len(),
            bias = sweep.len(),
            "sample count does not match the bias sweep; truncating to the shorter"
        );
    }
    let n = samples.len().min(sweep.len());
    let bias = &sweep.values()[..n];
    let samples = &samples[..n];

    let mut cycles = sweep.cycle_count();
    if cycles > 1 && n / cycles < MIN_SEGMENT_POINTS {
        warn!(cycles, samples = n, "cycles too short to fit separately; fitting as one ramp");
        cycles = 1;
    }

    let segments: Vec<SegmentFit> = (0..cycles)
        .map(|cycle| {
            let range = segment_range(cycle, cycles, n);
            fit_segment(
                options.kind,
                &bias[range.clone()],
                &samples[range.clone()],
                options.jump_threshold,
                range.start,
            )
        })
        .collect();

    let cycle_residuals: Vec<f64> = segments.iter().map(|s| s.residual).collect();
    let best_cycle_index = argmin(&cycle_residuals).unwrap_or(0);
    let cycle_index = match options.forced_cycle_index {
        Some(idx) if idx < cycles => idx,
        Some(idx) => {
            warn!(
                forced = idx,
                cycles, "forced cycle index out of range; using the best-residual cycle"
            );
            best_cycle_index
        }
        None => best_cycle_index,
    };

    let chosen = &segments[cycle_index];
    let cycle = segment_range(cycle_index, cycles, n);
    let max_bias = bias[cycle.clone()]
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let derived = if chosen.start <= chosen.end && chosen.end < n {
        interpret(
            &chosen.model,
            &bias[chosen.start..=chosen.end],
            &samples[chosen.start..=chosen.end],
            max_bias,
        )
    } else {
        FitInterpretation::default()
    };

    debug!(
        kind = options.kind.name(),
        cycle = cycle_index,
        residual = chosen.residual,
        turnover = ?derived.turnover,
        "fit complete"
    );

    FitResult {
        kind: options.kind,
        model: chosen.model.clone(),
        residual: chosen.residual,
        cycle_index,
        best_cycle_index,
        cycle_residuals,
        cycle_range: (cycle.start, cycle.end),
        fit_range: (chosen.start, chosen.end),
        derived,
    }
}

fn fit_segment(
    kind: FitKind,
    bias: &[f64],
    current: &[f64],
    jump_threshold: Option<f64>,
    offset: usize,
) -> SegmentFit {
    if current.is_empty() {
        let (model, residual) = kind.fit(&[], &[]);
        return SegmentFit {
            model,
            residual,
            start: offset,
            end: offset,
        };
    }

    let (mut start, mut end) = filter_jumps(current, jump_threshold);
    if end + 1 - start < MIN_FIT_POINTS {
        start = 0;
        end = current.len() - 1;
    }
    let (model, residual) = kind.fit(&bias[start..=end], &current[start..=end]);
    SegmentFit {
        model,
        residual,
        start: offset + start,
        end: offset + end,
    }
}

fn fit_polynomial(bias: &[f64], current: &[f64]) -> (FitModel, f64) {
    let Some(coeffs) = polyfit(bias, current, 3) else {
        return (
            FitModel::Polynomial(CubicCoefficients::default()),
            f64::INFINITY,
        );
    };
    let cubic = CubicCoefficients::from_ascending(&coeffs);
    let sse = sum_squared_error(bias, current, |v| cubic.evaluate(v));
    (FitModel::Polynomial(cubic), sse / current.len() as f64)
}

#[derive(Clone, Copy, Debug)]
struct CombinedCandidate {
    params: CombinedParams,
    sse: f64,
}

fn fit_combined(bias: &[f64], current: &[f64]) -> (FitModel, f64) {
    let n = bias.len().min(current.len());
    let (bias, current) = (&bias[..n], &current[..n]);
    let lo = bias.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = bias.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let guess_turnover = argmin(current).map(|i| bias[i]).unwrap_or(lo);
    let guess_normal = 0.5 * (guess_turnover + hi);
    let seed = CombinedParams::seeded(guess_turnover, guess_normal);
    if n == 0 || hi <= lo {
        return (FitModel::Combined(seed), f64::INFINITY);
    }

    let mut best = evaluate_breakpoints(bias, current, guess_turnover, guess_normal);
    let consider = |vt: f64, vn: f64, best: &mut Option<CombinedCandidate>| {
        if vn <= vt {
            return;
        }
        if let Some(candidate) = evaluate_breakpoints(bias, current, vt, vn) {
            if best.map_or(true, |b| candidate.sse < b.sse) {
                *best = Some(candidate);
            }
        }
    };

    let grid = linspace(lo, hi, COMBINED_COARSE_GRID);
    for (i, &vt) in grid.iter().enumerate() {
        for &vn in &grid[i + 1..] {
            consider(vt, vn, &mut best);
        }
    }

    let resolution = min_spacing(bias).unwrap_or((hi - lo) / n as f64);
    let mut span = 2.0 * (hi - lo) / (COMBINED_COARSE_GRID - 1) as f64;
    while span > resolution {
        let Some(current_best) = best else { break };
        let (vt0, vn0) = (current_best.params.v_turnover, current_best.params.v_normal);
        for vt in linspace((vt0 - span).max(lo), (vt0 + span).min(hi), COMBINED_REFINE_GRID) {
            for vn in linspace((vn0 - span).max(lo), (vn0 + span).min(hi), COMBINED_REFINE_GRID) {
                consider(vt, vn, &mut best);
            }
        }
        span *= 0.5;
    }

    match best {
        Some(candidate) => (
            FitModel::Combined(candidate.params),
            (candidate.sse / n as f64).sqrt(),
        ),
        None => (FitModel::Combined(seed), f64::INFINITY),
    }
}

fn evaluate_breakpoints(
    bias: &[f64],
    current: &[f64],
    v_turnover: f64,
    v_normal: f64,
) -> Option<CombinedCandidate> {
    let mut branches: [(Vec<f64>, Vec<f64>); 3] = Default::default();
    for (&v, &i) in bias.iter().zip(current.iter()) {
        let branch = if v < v_turnover {
            0
        } else if v < v_normal {
            1
        } else {
            2
        };
        branches[branch].0.push(v);
        branches[branch].1.push(i);
    }
    if branches[1].0.len() < COMBINED_MIN_BRANCH_POINTS
        || branches[2].0.len() < COMBINED_MIN_BRANCH_POINTS
    {
        return None;
    }

    let fit_branch = |branch: &(Vec<f64>, Vec<f64>), degree: usize| -> Option<Vec<f64>> {
        if branch.0.is_empty() {
            return Some(vec![COMBINED_SEED; degree + 1]);
        }
        let mut coeffs = polyfit(&branch.0, &branch.1, degree)?;
        coeffs.resize(degree + 1, 0.0);
        Some(coeffs)
    };
    let a = fit_branch(&branches[0], 2)?;
    let b = fit_branch(&branches[1], 2)?;
    let c = fit_branch(&branches[2], 1)?;

    let params = CombinedParams {
        v_turnover,
        v_normal,
        a0: a[0],
        a1: a[1],
        a2: a[2],
        b0: b[0],
        b1: b[1],
        b2: b[2],
        c0: c[0],
        c1: c[1],
    };
    let sse = sum_squared_error(bias, current, |v| params.evaluate(v));
    sse.is_finite().then_some(CombinedCandidate { params, sse })
}

/// Least-squares polynomial coefficients in ascending order.
///
/// The degree drops to `len - 1` when there are too few points; rank-deficient designs
/// are solved through the SVD pseudo-inverse.
pub(crate) fn polyfit(x: &[f64], y: &[f64], degree: usize) -> Option<Vec<f64>> {
    let n = x.len().min(y.len());
    if n == 0 {
        return None;
    }
    let degree = degree.min(n - 1);
    let design = DMatrix::from_fn(n, degree + 1, |i, j| x[i].powi(j as i32));
    let rhs = DVector::from_column_slice(&y[..n]);
    let coeffs = design.svd(true, true).solve(&rhs, SVD_EPSILON).ok()?;
    let out: Vec<f64> = coeffs.iter().copied().collect();
    out.iter().all(|c| c.is_finite()).then_some(out)
}

fn sum_squared_error(bias: &[f64], current: &[f64], model: impl Fn(f64) -> f64) -> f64 {
    bias.iter()
        .zip(current.iter())
        .map(|(&v, &i)| {
            let r = model(v) - i;
            r * r
        })
        .sum()
}

fn min_spacing(values: &[f64]) -> Option<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|d| *d > 0.0)
        .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |a| a.min(d))))
}

fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    if count <= 1 {
        return vec![end];
    }
    let step = (end - start) / (count as f64 - 1.0);
    (0..count).map(|i| start + step * i as f64).collect()
}
