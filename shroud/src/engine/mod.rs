// shroud/src/engine/mod.rs
//
// Engine facade: one instance per host, owning the queue, the decoy ticker
// and the poisoner.
//
//   new(cfg)          validate config, build components (no tasks yet)
//   start()           spawn the decoy ticker and the poisoner
//   enqueue(action)   fire-and-forget submission, returns the queue id
//   update_config()   whole-snapshot replace; timers restart if running
//   statistics()      read-only snapshot for dashboards and tests
//   cleanup()         stop timers and pattern injections, clear all state;
//                     start() may be called again
//
// Stopping never cancels dispatch waits already in flight. They run to
// completion against an orphaned epoch and leave no trace in engine state.

pub mod decoy;
pub mod headers;
pub mod poisoner;
pub mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock::EngineClock;
use crate::config::{ConfigError, ConfigHandle, EngineConfig, FeatureFlags};
use crate::events::{dispatch_fn, Action, DispatchFn, DispatchRequest, TrafficPattern};

use decoy::DummyActionGenerator;
use poisoner::StatisticalPoisoner;
use queue::QueueManager;

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatistics {
    pub active_dispatches:    usize,
    pub queued_count:         usize,
    pub history_size:         usize,
    pub traffic_pattern:      TrafficPattern,
    pub dummy_traffic_active: bool,
    pub feature_flags:        FeatureFlags,
    pub enqueued_total:       u64,
    pub dispatched_total:     u64,
    pub failed_total:         u64,
    pub burst_deferrals:      u64,
    pub decoys_enqueued:      u64,
    pub poison_passes:        u64,
    pub generated_at:         DateTime<Utc>,
}

#[derive(Default)]
struct Timers {
    decoy:  Option<JoinHandle<()>>,
    poison: Option<JoinHandle<()>>,
}

impl Timers {
    fn abort(&mut self) {
        if let Some(h) = self.decoy.take()  { h.abort(); }
        if let Some(h) = self.poison.take() { h.abort(); }
    }
}

pub struct Engine {
    config:   ConfigHandle,
    queue:    Arc<QueueManager>,
    decoys:   Arc<DummyActionGenerator>,
    poisoner: Arc<StatisticalPoisoner>,
    running:  Arc<AtomicBool>,
    timers:   Mutex<Timers>,
}

async fn log_decoy(req: DispatchRequest) -> anyhow::Result<()> {
    debug!(
        id     = req.id,
        target = req.payload["target"].as_str().unwrap_or("-"),
        method = req.payload["method"].as_str().unwrap_or("-"),
        "Decoy dispatched"
    );
    Ok(())
}

impl Engine {
    /// Engine whose decoys are only logged. Hosts that actually emit decoy
    /// traffic use `with_decoy_sink`.
    pub fn new(cfg: EngineConfig) -> Result<Self, ConfigError> {
        Self::with_decoy_sink(cfg, dispatch_fn(log_decoy))
    }

    pub fn with_decoy_sink(cfg: EngineConfig, sink: DispatchFn) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let config   = ConfigHandle::new(cfg);
        let running  = Arc::new(AtomicBool::new(false));
        let queue    = QueueManager::new(config.clone(), EngineClock::new());
        let decoys   = DummyActionGenerator::new(
            Arc::clone(&queue), config.clone(), sink, Arc::clone(&running),
        );
        let poisoner = StatisticalPoisoner::new(
            Arc::clone(&queue), Arc::clone(&decoys), config.clone(), Arc::clone(&running),
        );
        Ok(Self { config, queue, decoys, poisoner, running, timers: Mutex::new(Timers::default()) })
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Spawn background timers. Idempotent. Must be called inside a tokio runtime.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) { return; }
        self.spawn_timers();
        info!("Traffic obfuscation engine started");
    }

    fn spawn_timers(&self) {
        let mut timers = self.timers.lock();
        timers.abort();
        timers.decoy  = Some(tokio::spawn(Arc::clone(&self.decoys).run()));
        timers.poison = Some(tokio::spawn(Arc::clone(&self.poisoner).run()));
    }

    pub fn is_running(&self) -> bool { self.running.load(Ordering::Acquire) }

    /// Stop timers and clear history, queue, active set and counters.
    pub fn cleanup(&self) {
        self.running.store(false, Ordering::Release);
        self.timers.lock().abort();
        let injections = self.decoys.abort_injections();
        self.queue.reset();
        self.decoys.emitted.store(0, Ordering::Relaxed);
        self.poisoner.passes.store(0, Ordering::Relaxed);
        info!(injections, "Traffic obfuscation engine cleaned up");
    }

    // ── Collaborator interface ────────────────────────────────────────────────

    pub fn enqueue(&self, action: Action) -> u64 {
        self.queue.enqueue(action)
    }

    /// Replace the whole config. On error the previous snapshot stays active.
    pub fn update_config(&self, cfg: EngineConfig) -> Result<(), ConfigError> {
        self.config.replace(cfg)?;
        if self.is_running() {
            self.spawn_timers();
        }
        info!("Engine configuration replaced");
        Ok(())
    }

    pub fn config(&self) -> Arc<EngineConfig> { self.config.snapshot() }

    pub fn traffic_pattern(&self) -> TrafficPattern { self.queue.traffic_pattern() }

    pub fn statistics(&self) -> EngineStatistics {
        let cfg = self.config.snapshot();
        let c   = &self.queue.counters;
        EngineStatistics {
            active_dispatches:    self.queue.active_count(),
            queued_count:         self.queue.queued_count(),
            history_size:         self.queue.history().len(),
            traffic_pattern:      self.queue.traffic_pattern(),
            dummy_traffic_active: self.is_running() && cfg.features.dummy_traffic,
            feature_flags:        cfg.features.clone(),
            enqueued_total:       c.enqueued.load(Ordering::Relaxed),
            dispatched_total:     c.dispatched.load(Ordering::Relaxed),
            failed_total:         c.failed.load(Ordering::Relaxed),
            burst_deferrals:      c.burst_deferrals.load(Ordering::Relaxed),
            decoys_enqueued:      self.decoys.emitted.load(Ordering::Relaxed),
            poison_passes:        self.poisoner.passes.load(Ordering::Relaxed),
            generated_at:         Utc::now(),
        }
    }

    /// Direct access for hosts that drive passes or inspect history themselves.
    pub fn queue(&self) -> &Arc<QueueManager> { &self.queue }

    pub fn poisoner(&self) -> &Arc<StatisticalPoisoner> { &self.poisoner }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.timers.get_mut().abort();
        self.decoys.abort_injections();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecoyConfig, SpacingConfig, TimingConfig};
    use crate::events::ActionKind;
    use serde_json::json;
    use std::time::Duration;

    async fn noop(_: DispatchRequest) -> anyhow::Result<()> { Ok(()) }

    fn fast_config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.timing  = TimingConfig { base_delay_min_ms: 0, base_delay_max_ms: 0 };
        cfg.spacing = SpacingConfig { min_spacing_ms: 0, max_spacing_ms: 0, jitter_max_ms: 0 };
        cfg.decoy   = DecoyConfig { frequency_min_ms: 1_000, frequency_max_ms: 1_000 };
        cfg.features.burst_prevention      = false;
        cfg.features.statistical_poisoning = false;
        cfg
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let mut cfg = EngineConfig::default();
        cfg.burst.max_concurrent = 0;
        assert!(Engine::new(cfg).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn statistics_reflect_activity() {
        let engine = Engine::new(fast_config()).unwrap();
        assert!(!engine.statistics().dummy_traffic_active);
        engine.start();

        for _ in 0..3 {
            engine.enqueue(Action::new(ActionKind::ResourceBlock, json!({}), dispatch_fn(noop)));
        }
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let stats = engine.statistics();
        assert!(stats.dummy_traffic_active);
        assert_eq!(stats.decoys_enqueued, 2);
        assert_eq!(stats.dispatched_total, 5);
        assert_eq!(stats.history_size, 5);
        assert_eq!(stats.queued_count, 0);
        assert_eq!(stats.active_dispatches, 5);

        let v = serde_json::to_value(&stats).unwrap();
        assert_eq!(v["traffic_pattern"]["risk_level"], "low");
        assert!(v["generated_at"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_stops_timers_and_resets_state() {
        let engine = Engine::new(fast_config()).unwrap();
        engine.start();
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert!(engine.statistics().decoys_enqueued > 0);

        engine.cleanup();
        tokio::time::sleep(Duration::from_secs(10)).await;
        let stats = engine.statistics();
        assert_eq!(stats.decoys_enqueued, 0);
        assert_eq!(stats.history_size, 0);
        assert_eq!(stats.active_dispatches, 0);
        assert_eq!(stats.dispatched_total, 0);

        engine.start();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(engine.statistics().decoys_enqueued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pattern_injections_do_not_survive_cleanup_and_restart() {
        let mut cfg = fast_config();
        cfg.decoy = DecoyConfig { frequency_min_ms: 3_000_000, frequency_max_ms: 3_000_000 };
        let engine = Engine::new(cfg).unwrap();
        engine.start();

        engine.decoys.inject_pattern(decoy::PatternKind::Exponential);
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(engine.statistics().decoys_enqueued, 1);

        engine.cleanup();
        engine.start();
        tokio::time::sleep(Duration::from_secs(120)).await;

        let stats = engine.statistics();
        assert_eq!(stats.decoys_enqueued, 0);
        assert_eq!(stats.history_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn update_config_restarts_timers_with_new_flags() {
        let engine = Engine::new(fast_config()).unwrap();
        engine.start();

        let mut quiet = fast_config();
        quiet.features.dummy_traffic = false;
        engine.update_config(quiet).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(engine.statistics().decoys_enqueued, 0);
        assert!(!engine.statistics().dummy_traffic_active);

        let mut bad = fast_config();
        bad.timing.base_delay_min_ms = 5_000;
        bad.timing.base_delay_max_ms = 1_000;
        assert!(engine.update_config(bad).is_err());
        assert!(!engine.config().features.dummy_traffic);
    }
}
