//! Physical quantities read off a fitted I-V model.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fit::{polyfit, CombinedParams, CubicCoefficients, FitModel};
use crate::{reciprocal_or_cap, ZERO_EPSILON};

/// Straight line fitted to the normal-branch tail of a cubic fit.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct LineFit {
    pub slope: f64,
    pub intercept: f64,
    /// Points with bias strictly above this value were used.
    pub from_bias: f64,
}

impl LineFit {
    pub fn evaluate(&self, v: f64) -> f64 {
        self.intercept + self.slope * v
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FitInterpretation {
    pub turning: Option<[f64; 2]>,
    pub concavity: Option<[f64; 2]>,
    pub inflection: Option<f64>,
    /// Bias of the local minimum of current (superconducting to normal transition).
    pub turnover: Option<f64>,
    pub offset: Option<f64>,
    /// Inverse slope of the normal branch at the top of the sweep.
    pub r1: Option<f64>,
    pub tail_line: Option<LineFit>,
}

/// Derive turning points, turnover, R1 and offset from a fitted model.
///
/// `bias` and `current` are the points the model was fitted to; they are only consulted
/// when a cubic's inflection lies between its turnover and `max_bias`, in which case the
/// normal branch is re-estimated with a straight line through the points above the
/// inflection.
pub fn interpret(
    model: &FitModel,
    bias: &[f64],
    current: &[f64],
    max_bias: f64,
) -> FitInterpretation {
    match model {
        FitModel::Polynomial(cubic) => interpret_cubic(cubic, bias, current, max_bias),
        FitModel::Combined(params) => interpret_combined(params, max_bias),
    }
}

fn interpret_cubic(
    c: &CubicCoefficients,
    bias: &[f64],
    current: &[f64],
    max_bias: f64,
) -> FitInterpretation {
    let discriminant = c.a2 * c.a2 - 3.0 * c.a1 * c.a3;
    if discriminant.is_nan() || discriminant < 0.0 {
        return FitInterpretation::default();
    }

    let inflection = -c.a2 / (3.0 * c.a3);
    let half_width = discriminant.sqrt() / (3.0 * c.a3);
    let turning = [inflection + half_width, inflection - half_width];
    // a3 == 0 leaves no stationary points of a cubic to report.
    if turning.iter().any(|t| !t.is_finite()) {
        debug!(a3 = c.a3, "degenerate cubic, no turning points");
        return FitInterpretation::default();
    }
    let concavity = turning.map(|t| c.curvature(t));
    let turnover = turning
        .iter()
        .zip(concavity.iter())
        .find(|(_, k)| **k > 0.0)
        .map(|(t, _)| *t);

    let mut offset = max_bias - c.evaluate(max_bias);
    let mut r1 = reciprocal_or_cap(c.slope(max_bias), ZERO_EPSILON);
    let mut tail_line = None;
    if let Some(t) = turnover {
        if inflection > t && inflection < max_bias {
            if let Some(line) = fit_tail(bias, current, inflection) {
                r1 = reciprocal_or_cap(line.slope, ZERO_EPSILON);
                offset = max_bias - line.evaluate(max_bias);
                tail_line = Some(line);
            }
        }
    }

    FitInterpretation {
        turning: Some(turning),
        concavity: Some(concavity),
        inflection: Some(inflection),
        turnover,
        offset: Some(offset),
        r1: Some(r1),
        tail_line,
    }
}

fn fit_tail(bias: &[f64], current: &[f64], from_bias: f64) -> Option<LineFit> {
    let (x, y): (Vec<f64>, Vec<f64>) = bias
        .iter()
        .zip(current.iter())
        .filter(|(v, _)| **v > from_bias)
        .map(|(v, i)| (*v, *i))
        .unzip();
    if x.len() < 2 {
        return None;
    }
    let coeffs = polyfit(&x, &y, 1)?;
    (coeffs.len() == 2).then(|| LineFit {
        slope: coeffs[1],
        intercept: coeffs[0],
        from_bias,
    })
}

fn interpret_combined(p: &CombinedParams, max_bias: f64) -> FitInterpretation {
    FitInterpretation {
        turnover: Some(p.v_turnover),
        offset: Some(max_bias - p.normal_branch(max_bias)),
        r1: Some(reciprocal_or_cap(p.c1, ZERO_EPSILON)),
        ..FitInterpretation::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cubic(a0: f64, a1: f64, a2: f64, a3: f64) -> FitModel {
        FitModel::Polynomial(CubicCoefficients { a0, a1, a2, a3 })
    }

    #[test]
    fn test_turning_points_and_turnover() {
        // x^3 - 6x^2 + 9x + 1: stationary at 1 (max) and 3 (min)
        let derived = interpret(&cubic(1.0, 9.0, -6.0, 1.0), &[], &[], 4.0);
        let turning = derived.turning.unwrap();
        assert_relative_eq!(turning[0], 3.0, epsilon = 1e-12);
        assert_relative_eq!(turning[1], 1.0, epsilon = 1e-12);
        let concavity = derived.concavity.unwrap();
        assert!(concavity[0] > 0.0 && concavity[1] < 0.0);
        assert_eq!(derived.turnover, Some(3.0));
        assert_relative_eq!(derived.inflection.unwrap(), 2.0, epsilon = 1e-12);
        assert_relative_eq!(derived.offset.unwrap(), -1.0, epsilon = 1e-12);
        assert_relative_eq!(derived.r1.unwrap(), 1.0 / 9.0, epsilon = 1e-12);
        assert!(derived.tail_line.is_none());
    }

    #[test]
    fn test_tail_line_replaces_cubic_slope() {
        // -(x^3 - 6x^2 + 9x): minimum at 1, inflection at 2
        let bias: Vec<f64> = (0..=40).map(|i| i as f64 * 0.1).collect();
        let current: Vec<f64> = bias.iter().map(|&v| 0.5 * v + 1.0).collect();
        let derived = interpret(&cubic(0.0, -9.0, 6.0, -1.0), &bias, &current, 4.0);
        assert_relative_eq!(derived.turnover.unwrap(), 1.0, epsilon = 1e-12);
        let line = derived.tail_line.unwrap();
        assert_relative_eq!(line.slope, 0.5, epsilon = 1e-9);
        assert_relative_eq!(derived.r1.unwrap(), 2.0, epsilon = 1e-9);
        assert_relative_eq!(derived.offset.unwrap(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_negative_discriminant_has_no_derived_values() {
        let derived = interpret(&cubic(0.0, 1.0, 0.0, 1.0), &[], &[], 2.0);
        assert_eq!(derived, FitInterpretation::default());
    }

    #[test]
    fn test_zero_cubic_term_is_degenerate() {
        let derived = interpret(&cubic(0.0, 0.0, 1.0, 0.0), &[], &[], 2.0);
        assert!(derived.turning.is_none());
        assert!(derived.turnover.is_none());
    }

    #[test]
    fn test_combined_reads_breakpoint_and_normal_slope() {
        let params = CombinedParams {
            v_turnover: 2.0,
            v_normal: 2.5,
            a0: 0.026,
            a1: -0.01,
            a2: 0.0,
            b0: 0.0,
            b1: 0.0,
            b2: 0.0,
            c0: 0.00325,
            c1: 0.002,
        };
        let derived = interpret(&FitModel::Combined(params), &[], &[], 3.0);
        assert_eq!(derived.turnover, Some(2.0));
        assert_relative_eq!(derived.r1.unwrap(), 500.0, epsilon = 1e-9);
        assert_relative_eq!(derived.offset.unwrap(), 3.0 - 0.00925, epsilon = 1e-12);
        assert!(derived.turning.is_none());
    }
}
