//! End-to-end scheduling scenarios
//!
//! Drive the public engine API in virtual time and check the observable
//! timing guarantees: risk escalation, burst limits, spacing, and the
//! decorrelation window.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;

use shroud::config::SpacingConfig;
use shroud::events::Millis;
use shroud::state::history::TimingHistory;
use shroud::timing::randomizer::TimingRandomizer;
use shroud::{dispatch_fn, Action, ActionKind, DispatchFn, Engine, EngineConfig, RiskLevel};

fn zero_delay_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.timing.base_delay_min_ms = 0;
    cfg.timing.base_delay_max_ms = 0;
    cfg.spacing = SpacingConfig { min_spacing_ms: 0, max_spacing_ms: 0, jitter_max_ms: 0 };
    cfg.features.dummy_traffic         = false;
    cfg.features.statistical_poisoning = false;
    cfg
}

fn recorder(times: Arc<Mutex<Vec<Millis>>>) -> DispatchFn {
    dispatch_fn(move |req| {
        let times = Arc::clone(&times);
        async move {
            times.lock().push(req.dispatched_at);
            anyhow::Ok(())
        }
    })
}

// ============================================================================
// Scenario 1: dense activity escalates risk
// ============================================================================

#[tokio::test(start_paused = true)]
async fn twenty_five_actions_in_ten_seconds_is_high_risk() {
    let mut cfg = zero_delay_config();
    cfg.features.burst_prevention = false;
    let engine = Engine::new(cfg).unwrap();
    engine.start();

    let times = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..25 {
        engine.enqueue(Action::new(ActionKind::ResourceBlock, json!({}), recorder(Arc::clone(&times))));
        tokio::time::sleep(Duration::from_millis(400)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(times.lock().len(), 25);
    let pattern = engine.traffic_pattern();
    assert_eq!(pattern.frequency, 25);
    assert_eq!(pattern.risk_level, RiskLevel::High);
    assert!(pattern.average_interval > 0.0);
}

#[tokio::test(start_paused = true)]
async fn sparse_activity_stays_low_risk() {
    let mut cfg = zero_delay_config();
    cfg.features.burst_prevention = false;
    let engine = Engine::new(cfg).unwrap();
    engine.start();

    let times = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..5 {
        engine.enqueue(Action::new(ActionKind::Telemetry, json!({}), recorder(Arc::clone(&times))));
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert_eq!(engine.traffic_pattern().risk_level, RiskLevel::Low);
}

// ============================================================================
// Scenario 2: burst prevention over a sliding window
// ============================================================================

#[tokio::test(start_paused = true)]
async fn burst_limit_holds_in_every_cooldown_window() {
    let mut cfg = zero_delay_config();
    cfg.burst.max_concurrent = 3;
    cfg.burst.cooldown_ms    = 1_000;
    let engine = Engine::new(cfg).unwrap();
    engine.start();

    let times = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..10 {
        engine.enqueue(Action::new(ActionKind::CosmeticHide, json!({}), recorder(Arc::clone(&times))));
    }
    tokio::time::sleep(Duration::from_secs(10)).await;

    let mut times = times.lock().clone();
    assert_eq!(times.len(), 10, "every action eventually dispatched");
    times.sort_unstable();
    for (i, start) in times.iter().enumerate() {
        let in_window = times[i..].iter().take_while(|t| **t - start < 1_000).count();
        assert!(in_window <= 3, "{in_window} dispatches within 1000ms of {start}: {times:?}");
    }
    assert!(engine.statistics().burst_deferrals >= 3);
}

// ============================================================================
// Scenario 3: minimum spacing
// ============================================================================

#[test]
fn spacing_right_after_a_dispatch_is_at_least_the_remainder() {
    let cfg = SpacingConfig { min_spacing_ms: 50, max_spacing_ms: 500, jitter_max_ms: 25 };
    let mut rng = StdRng::seed_from_u64(77);
    let now: Millis = 123_456;
    for _ in 0..1_000 {
        let s = TimingRandomizer::calculate_spacing(Some(now - 10), now, &cfg, &mut rng);
        assert!(s >= Duration::from_millis(40));
    }
}

#[tokio::test(start_paused = true)]
async fn consecutive_dispatches_respect_min_spacing() {
    let mut cfg = zero_delay_config();
    cfg.spacing = SpacingConfig { min_spacing_ms: 50, max_spacing_ms: 50, jitter_max_ms: 10 };
    cfg.features.burst_prevention = false;
    let engine = Engine::new(cfg).unwrap();
    engine.start();

    let times = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..8 {
        engine.enqueue(Action::new(ActionKind::ResourceBlock, json!({}), recorder(Arc::clone(&times))));
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    let times = times.lock();
    assert_eq!(times.len(), 8);
    for w in times.windows(2) {
        assert!(w[1] - w[0] >= 50, "gap {} < 50 in {times:?}", w[1] - w[0]);
    }
}

// ============================================================================
// Scenario 4: decorrelation only touches the recent window
// ============================================================================

#[test]
fn decorrelation_keeps_older_entries_in_place() {
    let mut rng = StdRng::seed_from_u64(5);
    let original: Vec<Millis> = (0..20).map(|i| 1_000 + i * 137).collect();
    let mut history = TimingHistory::new(300_000);
    for t in &original { history.record(*t); }

    assert_eq!(history.decorrelate_tail(10, &mut rng), 10);

    let after = history.entries();
    assert_eq!(&after[..10], &original[..10]);
    let mut tail = after[10..].to_vec();
    tail.sort_unstable();
    assert_eq!(tail, original[10..].to_vec());
}

#[tokio::test(start_paused = true)]
async fn poisoning_never_loses_real_dispatches() {
    let mut cfg = zero_delay_config();
    cfg.features.burst_prevention = false;
    let engine = Engine::new(cfg).unwrap();
    engine.start();

    let times = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..12 {
        engine.enqueue(Action::new(ActionKind::Telemetry, json!({}), recorder(Arc::clone(&times))));
        tokio::time::sleep(Duration::from_millis(700)).await;
    }

    let mut size = engine.statistics().history_size;
    for _ in 0..4 {
        engine.poisoner().poison_once();
        let now = engine.statistics().history_size;
        assert!(now > size);
        size = now;
    }

    let history = engine.queue().history();
    for t in times.lock().iter() {
        assert!(history.contains(t), "real dispatch at {t} missing");
    }
}
