// shroud/src/engine/poisoner.rs
//
// Periodic statistical poisoning of the engine's own timing history.
//
// Every U(interval_min, interval_max) one pass runs:
//   1. inject a random decoy pattern (only while dummy traffic is enabled)
//   2. with temporal decorrelation on, shuffle the trailing recent_count
//      entries, before this pass adds any noise
//   3. merge noise_min..=noise_max synthetic timestamps drawn uniformly from
//      the last min(retention, 5 min); existing entries keep their order
//
// A pass never removes entries: the history only grows (until normal
// retention pruning), and timestamps that were really recorded stay in it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use crate::config::{ConfigHandle, EngineConfig};
use crate::engine::decoy::{DummyActionGenerator, PatternKind};
use crate::engine::queue::QueueManager;
use crate::events::Millis;

const NOISE_WINDOW_CAP_MS: u64 = 5 * 60 * 1_000;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoisonReport {
    pub pattern:        Option<PatternKind>,
    pub noise_injected: usize,
    pub decorrelated:   usize,
}

pub struct StatisticalPoisoner {
    queue:      Arc<QueueManager>,
    decoys:     Arc<DummyActionGenerator>,
    config:     ConfigHandle,
    running:    Arc<AtomicBool>,
    pub passes: AtomicU64,
}

impl StatisticalPoisoner {
    pub fn new(
        queue:   Arc<QueueManager>,
        decoys:  Arc<DummyActionGenerator>,
        config:  ConfigHandle,
        running: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self { queue, decoys, config, running, passes: AtomicU64::new(0) })
    }

    /// Synthetic timestamps spread over the recent past.
    pub fn noise_timestamps<R: Rng + ?Sized>(cfg: &EngineConfig, now: Millis, rng: &mut R) -> Vec<Millis> {
        let window = cfg.history.retention_ms.min(NOISE_WINDOW_CAP_MS) as Millis;
        let count  = rng.gen_range(cfg.poisoning.noise_min..=cfg.poisoning.noise_max);
        (0..count).map(|_| now - rng.gen_range(0..window.max(1))).collect()
    }

    pub fn poison_once(&self) -> PoisonReport {
        let cfg = self.config.snapshot();
        let mut rng = rand::thread_rng();

        let pattern = cfg.features.dummy_traffic.then(|| {
            let kind = PatternKind::random(&mut rng);
            self.decoys.inject_pattern(kind);
            kind
        });

        let decorrelated = if cfg.features.temporal_decorrelation {
            self.queue.decorrelate_recent(cfg.poisoning.recent_count, &mut rng)
        } else {
            0
        };

        let noise = Self::noise_timestamps(&cfg, self.queue.now_ms(), &mut rng);
        let noise_injected = noise.len();
        self.queue.inject_noise(noise);

        self.passes.fetch_add(1, Ordering::Relaxed);
        let report = PoisonReport { pattern, noise_injected, decorrelated };
        debug!(pattern = ?report.pattern, noise = noise_injected, decorrelated, "Poisoning pass");
        report
    }

    pub async fn run(self: Arc<Self>) {
        info!("Statistical poisoner started");
        loop {
            let wait = {
                let cfg = self.config.snapshot();
                let p   = &cfg.poisoning;
                Duration::from_millis(rand::thread_rng().gen_range(p.interval_min_ms..=p.interval_max_ms))
            };
            tokio::time::sleep(wait).await;
            if !self.running.load(Ordering::Acquire) { break; }
            if self.config.snapshot().features.statistical_poisoning {
                self.poison_once();
            }
        }
        info!("Statistical poisoner stopped");
    }
}
