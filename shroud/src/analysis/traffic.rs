// shroud/src/analysis/traffic.rs
//
// Statistical shape of our own recent activity, as a passive observer would
// measure it.
//
//   frequency         entries in the last 60s
//   average_interval  mean consecutive delta (ms)
//   burstiness        CV of deltas (stddev / mean)
//   predictability    |Σ Δ[i]·Δ[i-1]| / (N · 1e6), N = number of deltas
//
// The predictability score is a cheap lag-1 autocorrelation proxy, not a real
// autocorrelation. The 1e6 divisor is tuned together with the risk
// thresholds below; do not normalize it differently.
//
// The trailing window may be out of order after a decorrelation pass, so the
// analyzer sorts its working copy before taking deltas.

use crate::events::{Millis, RiskLevel, TrafficPattern};
use crate::state::history::TimingHistory;

pub const ANALYSIS_WINDOW_MS: Millis = 60 * 1_000;

const PREDICTABILITY_SCALE: f64 = 1_000_000.0;

const HIGH_FREQUENCY:        usize = 20;
const MEDIUM_FREQUENCY:      usize = 10;
const HIGH_PREDICTABILITY:   f64   = 0.7;
const MEDIUM_PREDICTABILITY: f64   = 0.5;

pub struct TrafficAnalyzer;

impl TrafficAnalyzer {
    /// Prunes `history` and analyzes its last 60s.
    pub fn analyze(history: &mut TimingHistory, now: Millis) -> TrafficPattern {
        let window = history.snapshot(now, ANALYSIS_WINDOW_MS);
        Self::pattern_of(&window)
    }

    /// Pure analysis of an arbitrary set of timestamps (any order).
    pub fn pattern_of(timestamps: &[Millis]) -> TrafficPattern {
        let mut ts = timestamps.to_vec();
        ts.sort_unstable();

        let frequency = ts.len();
        let intervals: Vec<f64> = ts.windows(2).map(|w| (w[1] - w[0]) as f64).collect();

        let average_interval = mean(&intervals);

        let burstiness = if ts.len() < 3 || average_interval == 0.0 {
            0.0
        } else {
            let var = intervals.iter().map(|x| (x - average_interval).powi(2)).sum::<f64>()
                / intervals.len() as f64;
            var.sqrt() / average_interval
        };

        let predictability = if intervals.len() < 2 {
            0.0
        } else {
            let lag1: f64 = intervals.windows(2).map(|w| w[1] * w[0]).sum();
            lag1.abs() / (intervals.len() as f64 * PREDICTABILITY_SCALE)
        };

        TrafficPattern {
            frequency,
            average_interval,
            burstiness,
            predictability,
            risk_level: classify(frequency, predictability),
        }
    }
}

fn mean(vals: &[f64]) -> f64 {
    if vals.is_empty() { 0.0 } else { vals.iter().sum::<f64>() / vals.len() as f64 }
}

pub fn classify(frequency: usize, predictability: f64) -> RiskLevel {
    if frequency > HIGH_FREQUENCY || predictability > HIGH_PREDICTABILITY {
        RiskLevel::High
    } else if frequency > MEDIUM_FREQUENCY || predictability > MEDIUM_PREDICTABILITY {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_history_is_neutral() {
        let p = TrafficAnalyzer::pattern_of(&[]);
        assert_eq!(p, TrafficPattern::default());
    }

    #[test]
    fn single_point_is_neutral_except_frequency() {
        let p = TrafficAnalyzer::pattern_of(&[1_000]);
        assert_eq!(p.frequency, 1);
        assert_eq!(p.average_interval, 0.0);
        assert_eq!(p.burstiness, 0.0);
        assert_eq!(p.predictability, 0.0);
        assert_eq!(p.risk_level, RiskLevel::Low);
    }

    #[test]
    fn two_points_have_interval_but_no_burstiness() {
        let p = TrafficAnalyzer::pattern_of(&[1_000, 1_400]);
        assert_eq!(p.average_interval, 400.0);
        assert_eq!(p.burstiness, 0.0);
        assert_eq!(p.predictability, 0.0);
    }

    #[test]
    fn identical_timestamps_do_not_divide_by_zero() {
        let p = TrafficAnalyzer::pattern_of(&[5, 5, 5, 5]);
        assert_eq!(p.average_interval, 0.0);
        assert_eq!(p.burstiness, 0.0);
        assert_eq!(p.predictability, 0.0);
    }

    #[test]
    fn predictability_uses_fixed_normalization() {
        // deltas 1000, 2000, 3000 → lag-1 sum 1000·2000 + 2000·3000 = 8e6, N = 3
        let p = TrafficAnalyzer::pattern_of(&[0, 1_000, 3_000, 6_000]);
        assert!((p.predictability - 8.0 / 3.0).abs() < 1e-9);
        assert_eq!(p.risk_level, RiskLevel::High);
    }

    #[test]
    fn burstiness_is_coefficient_of_variation() {
        // deltas 100, 300 → mean 200, population stddev 100
        let p = TrafficAnalyzer::pattern_of(&[0, 100, 400]);
        assert!((p.burstiness - 0.5).abs() < 1e-9);
    }

    #[test]
    fn unsorted_tail_is_tolerated() {
        let sorted   = TrafficAnalyzer::pattern_of(&[0, 100, 200, 300, 400]);
        let shuffled = TrafficAnalyzer::pattern_of(&[0, 100, 400, 200, 300]);
        assert_eq!(sorted, shuffled);
    }

    #[test]
    fn thresholds() {
        assert_eq!(classify(21, 0.0), RiskLevel::High);
        assert_eq!(classify(20, 0.0), RiskLevel::Medium);
        assert_eq!(classify(11, 0.0), RiskLevel::Medium);
        assert_eq!(classify(10, 0.0), RiskLevel::Low);
        assert_eq!(classify(0, 0.71), RiskLevel::High);
        assert_eq!(classify(0, 0.51), RiskLevel::Medium);
        assert_eq!(classify(0, 0.5), RiskLevel::Low);
    }

    #[test]
    fn analyze_only_sees_last_minute() {
        let mut h = TimingHistory::new(300_000);
        for t in (0..30).map(|i| i * 1_000) { h.record(t); }
        // at now = 90_000 only t > 30_000 qualifies → none
        assert_eq!(TrafficAnalyzer::analyze(&mut h, 90_000).frequency, 0);
        // history itself retained (within 5 min)
        assert_eq!(h.len(), 30);
    }
}
