//! Jump detection on a single bias cycle.
//!
//! Steps are measured relative to the earlier sample of each pair and normalized by the
//! mean step of the whole cycle. A step whose earlier sample is effectively zero is always
//! a jump.

use crate::ZERO_EPSILON;

/// Return the inclusive `(start, end)` of the widest span free of jumps.
///
/// Without a threshold the full range is returned. The caller decides what to do with a
/// span that is too short to fit (see [`crate::MIN_FIT_POINTS`]).
pub fn filter_jumps(samples: &[f64], jump_threshold: Option<f64>) -> (usize, usize) {
    let last = samples.len().saturating_sub(1);
    let threshold = match jump_threshold {
        Some(t) if samples.len() >= 3 => t,
        _ => return (0, last),
    };

    let steps: Vec<f64> = samples
        .windows(2)
        .map(|w| relative_step(w[0], w[1]))
        .collect();

    let finite: Vec<f64> = steps.iter().copied().filter(|s| s.is_finite()).collect();
    let mean_step = if finite.is_empty() {
        0.0
    } else {
        finite.iter().sum::<f64>() / finite.len() as f64
    };

    let jumps: Vec<usize> = steps
        .iter()
        .enumerate()
        .filter_map(|(idx, &step)| {
            let is_jump = if !step.is_finite() {
                true
            } else if mean_step > ZERO_EPSILON {
                step / mean_step > threshold
            } else {
                false
            };
            is_jump.then_some(idx)
        })
        .collect();

    widest_clean_span(&jumps, samples.len())
}

fn relative_step(lower: f64, upper: f64) -> f64 {
    if lower.abs() <= ZERO_EPSILON {
        return f64::INFINITY;
    }
    (upper - lower).abs() / lower.abs()
}

// A jump at step `j` separates sample `j` from sample `j + 1`.
fn widest_clean_span(jumps: &[usize], n: usize) -> (usize, usize) {
    let last = n - 1;
    let mut best: Option<(usize, usize)> = None;
    let mut start = 0usize;
    for &end in jumps.iter().chain(std::iter::once(&last)) {
        if end > start {
            let wider = best.map_or(true, |(s, e)| end - start > e - s);
            if wider {
                best = Some((start, end));
            }
        }
        start = end + 1;
    }
    best.unwrap_or((0, last))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometric_ramp(n: usize) -> Vec<f64> {
        (0..n).map(|i| 1.01_f64.powi(i as i32)).collect()
    }

    fn shifted_ramp(n: usize, shift_at: usize) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let v = 100.0 + i as f64;
                if i >= shift_at {
                    v * 10.0
                } else {
                    v
                }
            })
            .collect()
    }

    #[test]
    fn test_no_threshold_keeps_everything() {
        let samples = shifted_ramp(50, 20);
        assert_eq!(filter_jumps(&samples, None), (0, 49));
    }

    #[test]
    fn test_clean_ramp_is_untouched() {
        let samples = geometric_ramp(100);
        for threshold in [1.5, 2.0, 10.0, 1e6] {
            assert_eq!(filter_jumps(&samples, Some(threshold)), (0, 99));
        }
        let linear: Vec<f64> = (0..200).map(|i| 100.0 + i as f64).collect();
        assert_eq!(filter_jumps(&linear, Some(3.0)), (0, 199));
    }

    #[test]
    fn test_jump_keeps_longer_side() {
        let late = shifted_ramp(200, 60);
        assert_eq!(filter_jumps(&late, Some(5.0)), (60, 199));

        let early = shifted_ramp(200, 150);
        assert_eq!(filter_jumps(&early, Some(5.0)), (0, 149));
    }

    #[test]
    fn test_zero_sample_is_always_a_jump() {
        let mut samples: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        samples[10] = 0.0;
        let (start, end) = filter_jumps(&samples, Some(1e9));
        assert!(start > 10 || end <= 10);
        assert!(start < end);
        assert_eq!((start, end), (11, 39));
    }

    #[test]
    fn test_short_input_returns_full_range() {
        assert_eq!(filter_jumps(&[1.0, 2.0], Some(1.0)), (0, 1));
        assert_eq!(filter_jumps(&[], Some(1.0)), (0, 0));
    }
}
