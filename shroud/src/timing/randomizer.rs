// shroud/src/timing/randomizer.rs
//
// Risk-adaptive delay generation.
//
// Delays are drawn from [min, max] scaled by a risk multiplier:
//   high   ×U(2, 4)
//   medium ×U(1.5, 2.5)
//   low    ×1
// and sampled through the curve r' = √r + (1 − √(1 − r))·0.3 instead of a
// uniform draw, so values never settle around the midpoint. r' spans
// [0, 1.3]; it is divided by 1.3 rather than clamped, which keeps the curve's
// shape without piling mass onto the upper bound. The upper bound of any
// delay is therefore max × 4.

use std::time::Duration;

use rand::Rng;

use crate::config::SpacingConfig;
use crate::events::{Millis, RiskLevel, TrafficPattern};

const BIAS_WEIGHT: f64 = 0.3;

pub struct TimingRandomizer;

impl TimingRandomizer {
    pub fn risk_multiplier<R: Rng + ?Sized>(risk: RiskLevel, rng: &mut R) -> f64 {
        match risk {
            RiskLevel::High   => rng.gen_range(2.0..4.0),
            RiskLevel::Medium => rng.gen_range(1.5..2.5),
            RiskLevel::Low    => 1.0,
        }
    }

    /// Biased variate in [0, 1].
    pub fn biased_unit<R: Rng + ?Sized>(rng: &mut R) -> f64 {
        let r: f64 = rng.gen();
        let curved = r.sqrt() + (1.0 - (1.0 - r).sqrt()) * BIAS_WEIGHT;
        (curved / (1.0 + BIAS_WEIGHT)).clamp(0.0, 1.0)
    }

    pub fn generate_delay<R: Rng + ?Sized>(
        base_min_ms: u64,
        base_max_ms: u64,
        pattern:     &TrafficPattern,
        rng:         &mut R,
    ) -> Duration {
        let m  = Self::risk_multiplier(pattern.risk_level, rng);
        let lo = base_min_ms as f64 * m;
        let hi = (base_max_ms as f64 * m).max(lo);
        let ms = lo + (hi - lo) * Self::biased_unit(rng);
        Duration::from_millis(ms.max(0.0).round() as u64)
    }

    /// Gap to leave before the next dispatch.
    ///
    /// Inside the minimum spacing: top up to it plus a little jitter.
    /// Otherwise (or with no previous dispatch): a fresh draw in [0, max].
    pub fn calculate_spacing<R: Rng + ?Sized>(
        last_dispatch: Option<Millis>,
        now:           Millis,
        cfg:           &SpacingConfig,
        rng:           &mut R,
    ) -> Duration {
        let min = cfg.min_spacing_ms as Millis;
        let ms = match last_dispatch {
            Some(last) if (now - last).max(0) < min => {
                let elapsed = (now - last).max(0);
                (min - elapsed) as u64 + rng.gen_range(0..=cfg.jitter_max_ms)
            }
            _ => rng.gen_range(0..=cfg.max_spacing_ms),
        };
        Duration::from_millis(ms)
    }
}
