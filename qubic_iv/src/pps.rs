//! Absolute sample timestamps from a pulse-per-second line and a coarse date channel.
//!
//! Every pulse edge pins its sample to the coarse date observed there. Samples between two
//! edges advance by the elapsed coarse time divided by the index gap, so a nominal one
//! second between pulses gives `1 / gap` per sample, and the two edges of one pulse share
//! their timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Tolerance in seconds around the nominal one-second pulse separation.
pub const DEFAULT_PPS_EPSILON: f64 = 0.1;

/// Indices of high samples with a low neighbour on either side.
pub fn pulse_edges(pulse: &[u8]) -> Vec<usize> {
    let n = pulse.len();
    (0..n)
        .filter(|&i| {
            pulse[i] != 0
                && ((i > 0 && pulse[i - 1] == 0) || (i + 1 < n && pulse[i + 1] == 0))
        })
        .collect()
}

/// Reconstruct one non-decreasing timestamp per sample.
///
/// Without any pulse edge the coarse date itself is returned, clamped to be non-decreasing.
pub fn pps2date(pulse: &[u8], date: &[f64]) -> Vec<f64> {
    if pulse.len() != date.len() {
        warn!(
            pulse = pulse.len(),
            date = date.len(),
            "pulse and date lengths differ; truncating to the shorter"
        );
    }
    let n = pulse.len().min(date.len());
    if n == 0 {
        return Vec::new();
    }
    let (pulse, date) = (&pulse[..n], &date[..n]);

    let edges = pulse_edges(pulse);
    let (Some(&first), Some(&last)) = (edges.first(), edges.last()) else {
        warn!(samples = n, "no pulse edges found; using the coarse date");
        return running_max(date);
    };

    let mut edge_times: Vec<f64> = edges.iter().map(|&e| date[e]).collect();
    for k in 1..edge_times.len() {
        edge_times[k] = edge_times[k].max(edge_times[k - 1]);
    }

    let mut out = vec![0.0; n];
    let mut periods = Vec::with_capacity(edges.len().saturating_sub(1));
    for (pair, times) in edges.windows(2).zip(edge_times.windows(2)) {
        let (e0, e1) = (pair[0], pair[1]);
        let period = (times[1] - times[0]) / (e1 - e0) as f64;
        for (k, slot) in out[e0..e1].iter_mut().enumerate() {
            *slot = times[0] + k as f64 * period;
        }
        periods.push(period);
    }
    let last_time = edge_times[edge_times.len() - 1];
    out[last] = last_time;

    let fallback = if n > 1 {
        ((date[n - 1] - date[0]) / (n - 1) as f64).max(0.0)
    } else {
        0.0
    };
    let before = periods.iter().copied().find(|p| *p > 0.0).unwrap_or(fallback);
    let after = periods.iter().rev().copied().find(|p| *p > 0.0).unwrap_or(fallback);

    for (i, slot) in out[..first].iter_mut().enumerate() {
        *slot = edge_times[0] - (first - i) as f64 * before;
    }
    for (k, slot) in out[last + 1..].iter_mut().enumerate() {
        *slot = last_time + (k + 1) as f64 * after;
    }

    debug!(edges = edges.len(), before, after, "timestamps reconstructed");
    out
}

fn running_max(values: &[f64]) -> Vec<f64> {
    let mut peak = f64::NEG_INFINITY;
    values
        .iter()
        .map(|&v| {
            peak = peak.max(v);
            peak
        })
        .collect()
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct PulseEvent {
    pub rising: usize,
    pub falling: usize,
    /// Coarse date at the rising sample.
    pub date: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PulseDiagnostics {
    pub events: Vec<PulseEvent>,
    /// Coarse date difference between consecutive events.
    pub separations: Vec<f64>,
    /// Indices into `separations` longer than one second (missed pulses).
    pub jumps: Vec<usize>,
    /// Indices into `separations` shorter than one second (spurious pulses).
    pub sticks: Vec<usize>,
}

impl PulseDiagnostics {
    pub fn is_clean(&self) -> bool {
        self.jumps.is_empty() && self.sticks.is_empty()
    }
}

pub fn pulse_diagnostics(pulse: &[u8], date: &[f64], epsilon: f64) -> PulseDiagnostics {
    let n = pulse.len().min(date.len());
    let pulse = &pulse[..n];

    let mut events = Vec::new();
    let mut i = 0;
    while i < n {
        if pulse[i] == 0 {
            i += 1;
            continue;
        }
        let rising = i;
        while i + 1 < n && pulse[i + 1] != 0 {
            i += 1;
        }
        let falling = i;
        // a line stuck high for the whole record has no edge
        if rising > 0 || falling + 1 < n {
            events.push(PulseEvent {
                rising,
                falling,
                date: date[rising],
            });
        }
        i += 1;
    }

    let separations: Vec<f64> = events.windows(2).map(|w| w[1].date - w[0].date).collect();
    let jumps = separations
        .iter()
        .enumerate()
        .filter(|(_, s)| **s > 1.0 + epsilon)
        .map(|(k, _)| k)
        .collect::<Vec<_>>();
    let sticks = separations
        .iter()
        .enumerate()
        .filter(|(_, s)| **s < 1.0 - epsilon)
        .map(|(k, _)| k)
        .collect::<Vec<_>>();

    if !jumps.is_empty() || !sticks.is_empty() {
        warn!(
            jumps = jumps.len(),
            sticks = sticks.len(),
            "pulse train has irregular separations"
        );
    }

    PulseDiagnostics {
        events,
        separations,
        jumps,
        sticks,
    }
}

/// Epoch seconds to UTC, `None` when out of chrono's range or not finite.
pub fn to_utc(timestamp: f64) -> Option<DateTime<Utc>> {
    if !timestamp.is_finite() {
        return None;
    }
    let secs = timestamp.floor();
    let nanos = (((timestamp - secs) * 1e9).round() as u32).min(999_999_999);
    DateTime::from_timestamp(secs as i64, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_edges_of_wide_and_narrow_pulses() {
        let pulse = [0, 1, 1, 1, 0, 1, 0, 1];
        assert_eq!(pulse_edges(&pulse), vec![1, 3, 5, 7]);
        assert!(pulse_edges(&[1, 1, 1]).is_empty());
    }

    #[test]
    fn test_two_pulses_interpolate_between_edges() {
        let n = 300;
        let mut pulse = vec![0u8; n];
        for i in [100, 101, 200, 201] {
            pulse[i] = 1;
        }
        let date: Vec<f64> = (0..n).map(|i| if i < 200 { 1000.0 } else { 1001.0 }).collect();
        let ts = pps2date(&pulse, &date);

        assert_eq!(ts[100], 1000.0);
        assert_eq!(ts[101], 1000.0);
        assert_eq!(ts[200], 1001.0);
        assert_abs_diff_eq!(ts[150] - ts[149], 1.0 / 99.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ts[150], 1000.0 + 49.0 / 99.0, epsilon = 1e-9);
        assert_abs_diff_eq!(ts[0], 1000.0 - 100.0 / 99.0, epsilon = 1e-9);
        assert_abs_diff_eq!(ts[299], 1001.0 + 98.0 / 99.0, epsilon = 1e-9);
    }

    #[test]
    fn test_no_edges_falls_back_to_running_max() {
        let ts = pps2date(&[0, 0, 0, 0], &[5.0, 4.0, 6.0, 6.0]);
        assert_eq!(ts, vec![5.0, 5.0, 6.0, 6.0]);
        assert!(pps2date(&[], &[]).is_empty());
    }

    #[test]
    fn test_backwards_date_is_clamped() {
        let mut pulse = vec![0u8; 40];
        pulse[10] = 1;
        pulse[20] = 1;
        pulse[30] = 1;
        let mut date = vec![100.0; 40];
        date[20] = 99.0;
        date[30] = 101.0;
        let ts = pps2date(&pulse, &date);
        assert!(ts.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(ts[20], 100.0);
    }

    #[test]
    fn test_diagnostics_flag_jumps_and_sticks() {
        let mut pulse = vec![0u8; 60];
        let mut date = vec![0.0; 60];
        for (idx, d) in [(5, 10.0), (15, 11.0), (25, 13.0), (35, 13.2), (45, 14.2)] {
            pulse[idx] = 1;
            pulse[idx + 1] = 1;
            date[idx] = d;
        }
        let diag = pulse_diagnostics(&pulse, &date, DEFAULT_PPS_EPSILON);
        assert_eq!(diag.events.len(), 5);
        assert_eq!(diag.events[0].falling, 6);
        assert_eq!(diag.jumps, vec![1]);
        assert_eq!(diag.sticks, vec![2]);
        assert!(!diag.is_clean());
    }

    #[test]
    fn test_to_utc() {
        let utc = to_utc(1_600_000_000.5).unwrap();
        assert_eq!(utc.timestamp(), 1_600_000_000);
        assert_eq!(utc.timestamp_subsec_millis(), 500);
        assert!(to_utc(f64::NAN).is_none());
    }
}
