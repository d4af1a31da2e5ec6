// shroud/src/engine/decoy.rs
//
// Decoy traffic. Two sources, both feeding the normal QueueManager path:
//
//   run()            background ticker, one decoy per tick, next tick after
//                    U(frequency_min, frequency_max)
//   inject_pattern() one-shot shaped series, triggered by the poisoner:
//       Periodic     period U(5s, 15s) ± 10%, as many as fit in 60s
//       Burst        3–7 decoys, 50–250ms apart
//       Exponential  gaps 1s, ×1.5 each, while ≤ 60s
//       Linear       10 gaps of 2s + i·1s
//
// Varying the shape between observation windows keeps the aggregate decoy
// volume from becoming its own fingerprint.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::distributions::{Alphanumeric, Distribution, WeightedIndex};
use rand::Rng;
use serde_json::{json, Value};
use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, trace};

use crate::config::{ConfigHandle, DecoyConfig};
use crate::engine::queue::QueueManager;
use crate::events::{Action, ActionKind, DispatchFn, HttpMethod};

pub const DECOY_TARGETS: &[&str] = &[
    "https://www.google.com/favicon.ico",
    "https://www.wikipedia.org/portal/wikipedia.org/assets/img/Wikipedia-logo-v2.png",
    "https://fonts.googleapis.com/css2?family=Roboto",
    "https://cdnjs.cloudflare.com/ajax/libs/jquery/3.7.1/jquery.min.js",
    "https://www.github.com/robots.txt",
    "https://www.mozilla.org/en-US/",
    "https://news.ycombinator.com/",
    "https://www.reddit.com/.json",
];

const METHODS: [(HttpMethod, u32); 3] = [
    (HttpMethod::Get,  70),
    (HttpMethod::Post, 20),
    (HttpMethod::Head, 10),
];

const POST_BODY_MIN: usize = 16;
const POST_BODY_MAX: usize = 256;

// ── Pattern families ──────────────────────────────────────────────────────────

const PERIODIC_SPAN_MS:       u64 = 60_000;
const PERIODIC_PERIOD_MS:     (u64, u64) = (5_000, 15_000);
const PERIODIC_JITTER:        f64 = 0.10;
const BURST_COUNT:            (usize, usize) = (3, 7);
const BURST_GAP_MS:           (u64, u64) = (50, 250);
const EXPONENTIAL_START_MS:   f64 = 1_000.0;
const EXPONENTIAL_GROWTH:     f64 = 1.5;
const EXPONENTIAL_CAP_MS:     f64 = 60_000.0;
const LINEAR_BASE_MS:         u64 = 2_000;
const LINEAR_STEP_MS:         u64 = 1_000;
const LINEAR_COUNT:           u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind { Periodic, Burst, Exponential, Linear }

impl PatternKind {
    pub const ALL: [PatternKind; 4] = [Self::Periodic, Self::Burst, Self::Exponential, Self::Linear];

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::ALL[rng.gen_range(0..Self::ALL.len())]
    }

    /// Gaps before each decoy; the first is measured from injection time.
    pub fn intervals<R: Rng + ?Sized>(self, rng: &mut R) -> Vec<Duration> {
        match self {
            Self::Periodic => {
                let period = rng.gen_range(PERIODIC_PERIOD_MS.0..=PERIODIC_PERIOD_MS.1);
                let count  = PERIODIC_SPAN_MS / period;
                (0..count)
                    .map(|_| {
                        let j = rng.gen_range(-PERIODIC_JITTER..=PERIODIC_JITTER);
                        Duration::from_millis((period as f64 * (1.0 + j)).round() as u64)
                    })
                    .collect()
            }
            Self::Burst => {
                let count = rng.gen_range(BURST_COUNT.0..=BURST_COUNT.1);
                (0..count)
                    .map(|i| if i == 0 {
                        Duration::ZERO
                    } else {
                        Duration::from_millis(rng.gen_range(BURST_GAP_MS.0..=BURST_GAP_MS.1))
                    })
                    .collect()
            }
            Self::Exponential => {
                let mut gaps = Vec::new();
                let mut gap  = EXPONENTIAL_START_MS;
                while gap <= EXPONENTIAL_CAP_MS {
                    gaps.push(Duration::from_millis(gap as u64));
                    gap *= EXPONENTIAL_GROWTH;
                }
                gaps
            }
            Self::Linear => (0..LINEAR_COUNT)
                .map(|i| Duration::from_millis(LINEAR_BASE_MS + i * LINEAR_STEP_MS))
                .collect(),
        }
    }
}

// ── Generator ─────────────────────────────────────────────────────────────────

pub struct DummyActionGenerator {
    queue:       Arc<QueueManager>,
    config:      ConfigHandle,
    sink:        DispatchFn,
    running:     Arc<AtomicBool>,
    /// Pattern injections still sleeping between decoys.
    injections:  Mutex<Vec<AbortHandle>>,
    pub emitted: AtomicU64,
}

impl DummyActionGenerator {
    pub fn new(
        queue:   Arc<QueueManager>,
        config:  ConfigHandle,
        sink:    DispatchFn,
        running: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            config,
            sink,
            running,
            injections: Mutex::new(Vec::new()),
            emitted:    AtomicU64::new(0),
        })
    }

    pub fn next_tick_delay<R: Rng + ?Sized>(cfg: &DecoyConfig, rng: &mut R) -> Duration {
        Duration::from_millis(rng.gen_range(cfg.frequency_min_ms..=cfg.frequency_max_ms))
    }

    /// Random target, weighted method, random body for POST.
    pub fn synthesize_payload<R: Rng + ?Sized>(rng: &mut R) -> Value {
        let target = DECOY_TARGETS[rng.gen_range(0..DECOY_TARGETS.len())];
        let method = match WeightedIndex::new(METHODS.iter().map(|(_, w)| *w)) {
            Ok(dist) => METHODS[dist.sample(rng)].0,
            Err(_)   => HttpMethod::Get,
        };
        let body = (method == HttpMethod::Post).then(|| {
            let len = rng.gen_range(POST_BODY_MIN..=POST_BODY_MAX);
            (0..len).map(|_| rng.sample(Alphanumeric) as char).collect::<String>()
        });
        json!({ "target": target, "method": method, "body": body })
    }

    /// Enqueue one decoy. Skipped once the engine has been stopped.
    pub fn emit_one(&self) -> Option<u64> {
        if !self.running.load(Ordering::Acquire) { return None; }
        let payload = Self::synthesize_payload(&mut rand::thread_rng());
        let action  = Action::new(ActionKind::Decoy, payload, Arc::clone(&self.sink))
            .with_headers(Vec::new());
        let id = self.queue.enqueue(action);
        self.emitted.fetch_add(1, Ordering::Relaxed);
        trace!(id, "Decoy enqueued");
        Some(id)
    }

    /// Background ticker. Exits on the first tick after the engine stops.
    pub async fn run(self: Arc<Self>) {
        debug!("Decoy ticker started");
        loop {
            let wait = Self::next_tick_delay(&self.config.snapshot().decoy, &mut rand::thread_rng());
            tokio::time::sleep(wait).await;
            if !self.running.load(Ordering::Acquire) { break; }
            if self.config.snapshot().features.dummy_traffic {
                self.emit_one();
            }
        }
        debug!("Decoy ticker stopped");
    }

    pub fn inject_pattern(self: &Arc<Self>, kind: PatternKind) -> JoinHandle<()> {
        let gaps = kind.intervals(&mut rand::thread_rng());
        debug!(pattern = ?kind, decoys = gaps.len(), "Injecting decoy pattern");
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            for gap in gaps {
                tokio::time::sleep(gap).await;
                if this.emit_one().is_none() { break; }
            }
        });
        let mut injections = self.injections.lock();
        injections.retain(|h| !h.is_finished());
        injections.push(handle.abort_handle());
        handle
    }

    /// Cancel every pattern injection still in progress.
    pub fn abort_injections(&self) -> usize {
        let mut injections = self.injections.lock();
        let live = injections.iter().filter(|h| !h.is_finished()).count();
        for h in injections.drain(..) { h.abort(); }
        live
    }
}
