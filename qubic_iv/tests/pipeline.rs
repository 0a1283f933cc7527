use std::f64::consts::PI;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use ndarray::Array2;
use qubic_iv::{
    filter_iv, filter_jumps, fit_iv, pps2date, timeline2adu, AnalysisConfig, BiasSweep,
    ChannelId, FitKind, FitModel, FitOptions, QualityThresholds, TimelineParams, VerdictReason,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn dense_bias(lo: f64, hi: f64, step: f64) -> Vec<f64> {
    let n = ((hi - lo) / step).round() as usize;
    (0..=n).map(|i| lo + i as f64 * step).collect()
}

// Linear superconducting branch, quadratic transition, linear normal branch with R1 = 500.
fn combined_current(v: f64) -> f64 {
    if v < 2.0 {
        0.006 + 0.01 * (2.0 - v)
    } else if v < 2.5 {
        0.006 + 0.004 * (v - 2.0) + 0.001 * (v - 2.0).powi(2)
    } else {
        0.00325 + 0.002 * v
    }
}

fn tes_like(v: f64, turnover: f64) -> f64 {
    let u = v - turnover;
    u.powi(3) / 3.0 + u * u + 1.0
}

#[test]
fn combined_fit_recovers_turnover_and_r1() {
    let sweep = BiasSweep::from_values(dense_bias(0.5, 3.0, 0.002), 0);
    let current: Vec<f64> = sweep.values().iter().map(|&v| combined_current(v)).collect();
    let options = FitOptions {
        kind: FitKind::Combined,
        ..FitOptions::default()
    };
    let fit = fit_iv(&current, &sweep, &options);

    assert!(matches!(fit.model, FitModel::Combined(_)));
    assert_eq!(fit.model.coefficients().len(), 10);
    assert!((fit.turnover().unwrap() - 2.0).abs() <= 0.01);
    assert_relative_eq!(fit.r1().unwrap(), 500.0, max_relative = 0.05);
    assert!(fit.residual < 1e-6);
    assert!(fit.derived.turning.is_none());
}

#[test]
fn polynomial_fit_roundtrips_a_cubic() {
    let sweep = BiasSweep::from_values(dense_bias(0.5, 3.0, 0.002), 0);
    let (a0, a1, a2, a3) = (0.4, -1.2, 0.9, -0.15);
    let current: Vec<f64> = sweep
        .values()
        .iter()
        .map(|&v| a0 + a1 * v + a2 * v * v + a3 * v * v * v)
        .collect();
    let fit = fit_iv(&current, &sweep, &FitOptions::default());
    let coeffs = fit.model.coefficients();
    for (got, want) in coeffs.iter().zip([a0, a1, a2, a3]) {
        assert_relative_eq!(*got, want, max_relative = 1e-6);
    }
    assert!(fit.residual < 1e-20);
}

#[test]
fn flat_channel_is_current_too_low() {
    let sweep = BiasSweep::from_values(dense_bias(0.5, 3.0, 0.002), 0);
    let current = vec![0.001; sweep.len()];
    let verdict = filter_iv(
        &current,
        &sweep,
        &FitOptions::default(),
        &QualityThresholds::default(),
    );
    assert!(!verdict.is_good);
    assert_eq!(verdict.reason, VerdictReason::CurrentTooLow);
    assert_eq!(verdict.reason.to_string(), "current too low");
}

#[test]
fn residual_check_wins_over_later_checks() {
    let mut rng = StdRng::seed_from_u64(7);
    let sweep = BiasSweep::from_values(dense_bias(1.0, 2.0, 0.01), 0);
    // too small, too flat and without a turnover as well
    let current: Vec<f64> = (0..sweep.len()).map(|_| rng.gen_range(0.0..1e-4)).collect();
    let thresholds = QualityThresholds {
        residual_limit: 1e-12,
        ..QualityThresholds::default()
    };
    let verdict = filter_iv(&current, &sweep, &FitOptions::default(), &thresholds);
    assert_eq!(verdict.reason, VerdictReason::BadPolyFit);
}

#[test]
fn jump_filter_keeps_the_longer_side() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..50 {
        let n = rng.gen_range(60..400);
        let k = rng.gen_range(20..n - 20);
        let samples: Vec<f64> = (0..n)
            .map(|i| {
                let v = 100.0 + i as f64;
                if i >= k {
                    10.0 * v
                } else {
                    v
                }
            })
            .collect();
        let (start, end) = filter_jumps(&samples, Some(5.0));
        assert!(start < end && end < n);
        if k >= n - k {
            assert_eq!((start, end), (0, k - 1), "n={n} k={k}");
        } else {
            assert_eq!((start, end), (k, n - 1), "n={n} k={k}");
        }
    }
}

#[test]
fn pulse_pair_gives_one_ninety_ninth_period() {
    let n = 300;
    let mut pulse = vec![0u8; n];
    for i in [100, 101, 200, 201] {
        pulse[i] = 1;
    }
    let date: Vec<f64> = (0..n).map(|i| if i < 200 { 1000.0 } else { 1001.0 }).collect();
    let ts = pps2date(&pulse, &date);
    assert_eq!(ts.len(), n);
    for i in 102..200 {
        assert_abs_diff_eq!(ts[i] - ts[i - 1], 1.0 / 99.0, epsilon = 1e-12);
    }
}

#[test]
fn timestamps_roundtrip_exact_pulse_train() {
    let n = 1050;
    let dt = 0.01;
    let t0 = 999.5;
    let pulse: Vec<u8> = (0..n).map(|i| u8::from(i % 100 == 50)).collect();
    let date: Vec<f64> = (0..n).map(|i| 999.0 + ((i + 50) / 100) as f64).collect();
    let ts = pps2date(&pulse, &date);
    for (i, t) in ts.iter().enumerate() {
        assert_abs_diff_eq!(*t, t0 + i as f64 * dt, epsilon = 1e-9);
    }
}

#[test]
fn timestamps_never_decrease() {
    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..200 {
        let n = rng.gen_range(2..400);
        let pulse: Vec<u8> = (0..n).map(|_| u8::from(rng.gen_bool(0.1))).collect();
        let mut clock: f64 = 1.0e9;
        let date: Vec<f64> = (0..n)
            .map(|_| {
                clock += rng.gen_range(-0.5..1.0);
                clock.floor()
            })
            .collect();
        let ts = pps2date(&pulse, &date);
        assert_eq!(ts.len(), n);
        assert!(ts.windows(2).all(|w| w[1] >= w[0]), "non-monotonic for n={n}");
    }
}

#[test]
fn timeline_remap_feeds_the_dataset() {
    let n = 1000;
    let period = 2.0;
    let dt = 0.01;
    let bias_at = |i: usize| 2.5 + 1.5 * (2.0 * PI * (i as f64 * dt - 4.3) / period).cos();
    let timeline = Array2::from_shape_fn((4, n), |(ch, i)| match ch {
        0 => 100.0 + 50.0 * (bias_at(i) - 2.5),
        3 => 0.001,
        _ => tes_like(bias_at(i), 2.5),
    });

    let params = TimelineParams::new(period, dt, 1.0, 4.0);
    let remapped = timeline2adu(ChannelId::from_index(0), &timeline, &params).unwrap();
    assert_eq!(remapped.peaks, (430, 630));
    assert_eq!(remapped.cycles, 1);

    let mut dataset = remapped.into_dataset().unwrap();
    dataset.filter_all(&AnalysisConfig::default());
    let summary = dataset.summary();
    assert_eq!(summary.good_count, 2);
    assert_eq!(
        summary.good_channels,
        vec![ChannelId::from_index(1), ChannelId::from_index(2)]
    );
    assert!((summary.mean_turnover.unwrap() - 2.5).abs() < 1e-6);
    assert_eq!(summary.rejections.values().sum::<usize>(), 2);
}
