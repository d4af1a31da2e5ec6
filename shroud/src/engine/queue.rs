// shroud/src/engine/queue.rs
//
// Pending-action queue and the sequential dispatch loop.
//
// Per item: Queued → (maybe reordered) → Dispatching → Completed | Failed
//
// Enqueue:
//   - id from a monotonic counter
//   - priority = 5.0 + kind adjustment + U(-1, 1)
//   - delay from TimingRandomizer, scaled by the current traffic risk
//   - optional bounded Fisher–Yates over the queue tail that only swaps two
//     items whose priorities differ by < 1.0
//   - starts the dispatch loop if idle
//
// Dispatch loop (one task at a time per epoch):
//   - burst gate: ≥ max_concurrent dispatches started inside the cooldown
//     window → sleep one cooldown and re-check, nothing popped
//   - pop head, wait (stored delay + spacing), record into TimingHistory,
//     add to the active set, start the callback on its own task and move on;
//     the active entry is dropped a grace period after the dispatch started
//   - dispatch starts are sequential; callbacks may overlap, and one that
//     never resolves blocks nothing behind it
//   - callback errors and panics are logged and counted; the action is lost
//
// TimingHistory and the queue share one mutex. The active set is a DashMap so
// grace-period removals never contend with the loop.
//
// `epoch` is bumped by reset(). A loop or in-flight dispatch from an older
// epoch still runs its callback but no longer touches engine state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, error, trace, warn};

use crate::analysis::traffic::TrafficAnalyzer;
use crate::clock::EngineClock;
use crate::config::{ConfigHandle, EngineConfig};
use crate::engine::headers::HeaderRandomizer;
use crate::events::{Action, ActiveDispatch, DispatchRequest, Millis, QueueItem, TrafficPattern};
use crate::state::history::TimingHistory;
use crate::timing::randomizer::TimingRandomizer;

/// Minimum time an entry stays in the active set after its dispatch started.
pub const ACTIVE_GRACE: Duration = Duration::from_secs(5);

const BASE_PRIORITY:       f64 = 5.0;
const PRIORITY_JITTER:     f64 = 1.0;
const REORDER_TOLERANCE:   f64 = 1.0;

struct CoreState {
    history:       TimingHistory,
    queue:         VecDeque<QueueItem>,
    next_id:       u64,
    last_dispatch: Option<Millis>,
    loop_running:  bool,
    epoch:         u64,
}

#[derive(Debug, Default)]
pub struct QueueCounters {
    pub enqueued:        AtomicU64,
    pub dispatched:      AtomicU64,
    pub failed:          AtomicU64,
    pub burst_deferrals: AtomicU64,
}

impl QueueCounters {
    fn reset(&self) {
        self.enqueued.store(0, Ordering::Relaxed);
        self.dispatched.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.burst_deferrals.store(0, Ordering::Relaxed);
    }
}

pub struct QueueManager {
    core:         Mutex<CoreState>,
    /// Keyed by (epoch, id): ids restart after reset() while orphaned grace
    /// timers may still be pending.
    active:       Arc<DashMap<(u64, u64), ActiveDispatch>>,
    config:       ConfigHandle,
    clock:        EngineClock,
    pub counters: QueueCounters,
}

impl QueueManager {
    pub fn new(config: ConfigHandle, clock: EngineClock) -> Arc<Self> {
        let retention = config.snapshot().history.retention_ms;
        Arc::new(Self {
            core: Mutex::new(CoreState {
                history:       TimingHistory::new(retention),
                queue:         VecDeque::new(),
                next_id:       0,
                last_dispatch: None,
                loop_running:  false,
                epoch:         0,
            }),
            active:   Arc::new(DashMap::new()),
            config,
            clock,
            counters: QueueCounters::default(),
        })
    }

    pub fn now_ms(&self) -> Millis { self.clock.now_ms() }

    // ── Enqueue ───────────────────────────────────────────────────────────────

    /// Queue an action for obfuscated dispatch. Returns the assigned id.
    /// Must be called from within a tokio runtime.
    pub fn enqueue(self: &Arc<Self>, action: Action) -> u64 {
        let cfg = self.config.snapshot();
        let now = self.clock.now_ms();
        let mut rng = rand::thread_rng();

        let (id, start_loop, epoch) = {
            let mut core = self.core.lock();
            core.history.set_retention(cfg.history.retention_ms);
            let pattern = TrafficAnalyzer::analyze(&mut core.history, now);

            let delay = if cfg.features.timing_randomization {
                TimingRandomizer::generate_delay(
                    cfg.timing.base_delay_min_ms,
                    cfg.timing.base_delay_max_ms,
                    &pattern,
                    &mut rng,
                )
            } else {
                Duration::from_millis(cfg.timing.base_delay_min_ms)
            };
            let priority = BASE_PRIORITY
                + action.kind.priority_adjustment()
                + rng.gen_range(-PRIORITY_JITTER..=PRIORITY_JITTER);

            let id = core.next_id;
            core.next_id += 1;
            trace!(id, kind = %action.kind, priority, ?delay, risk = %pattern.risk_level, "Enqueued");
            core.queue.push_back(QueueItem { id, action, enqueued_at: now, priority, delay });

            if cfg.features.queue_reordering {
                let swaps = reorder_tail(&mut core.queue, cfg.queue.reorder_window, &mut rng);
                if !swaps.is_empty() {
                    trace!(swaps = swaps.len(), "Queue tail reordered");
                }
            }

            let start = !core.loop_running;
            core.loop_running = true;
            (id, start, core.epoch)
        };

        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        if start_loop {
            tokio::spawn(Arc::clone(self).dispatch_loop(epoch));
        }
        id
    }

    // ── Dispatch loop ─────────────────────────────────────────────────────────

    async fn dispatch_loop(self: Arc<Self>, epoch: u64) {
        debug!(epoch, "Dispatch loop started");
        loop {
            let cfg = self.config.snapshot();

            if cfg.features.burst_prevention {
                let recent = self.recent_dispatches(self.clock.now_ms(), cfg.burst.cooldown_ms);
                if recent >= cfg.burst.max_concurrent {
                    self.counters.burst_deferrals.fetch_add(1, Ordering::Relaxed);
                    debug!(recent, max = cfg.burst.max_concurrent, "Burst limit reached, deferring");
                    tokio::time::sleep(cfg.burst_cooldown()).await;
                    continue;
                }
            }

            let Some((item, wait)) = self.pop_next(epoch, &cfg) else { break };
            tokio::time::sleep(wait).await;
            self.dispatch(item, epoch);
        }
        debug!(epoch, "Dispatch loop idle");
    }

    fn pop_next(&self, epoch: u64, cfg: &EngineConfig) -> Option<(QueueItem, Duration)> {
        let mut core = self.core.lock();
        if core.epoch != epoch { return None; }
        let Some(item) = core.queue.pop_front() else {
            core.loop_running = false;
            return None;
        };
        let spacing = TimingRandomizer::calculate_spacing(
            core.last_dispatch,
            self.clock.now_ms(),
            &cfg.spacing,
            &mut rand::thread_rng(),
        );
        let wait = item.delay + spacing;
        Some((item, wait))
    }

    /// Starts one dispatch and returns without waiting for the callback. The
    /// callback and its outcome accounting run on their own tasks, so a
    /// callback that never resolves holds up nothing but itself.
    fn dispatch(self: &Arc<Self>, item: QueueItem, epoch: u64) {
        let cfg  = self.config.snapshot();
        let now  = self.clock.now_ms();
        let id   = item.id;
        let kind = item.action.kind;

        let current = {
            let mut core = self.core.lock();
            let current = core.epoch == epoch;
            if current {
                core.history.record(now);
                core.last_dispatch = Some(now);
            }
            current
        };
        if current {
            self.active.insert((epoch, id), ActiveDispatch {
                id,
                kind,
                started_at: now,
                payload:    item.action.payload.clone(),
            });
            let grace  = ACTIVE_GRACE.max(cfg.burst_cooldown());
            let active = Arc::clone(&self.active);
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                active.remove(&(epoch, id));
            });
        }

        let headers = item.action.headers.as_ref().map(|h| {
            if cfg.features.header_randomization {
                HeaderRandomizer::randomize(h, &cfg.headers, &mut rand::thread_rng())
            } else {
                h.clone()
            }
        });
        let request = DispatchRequest {
            id,
            kind,
            payload: item.action.payload,
            headers,
            dispatched_at: now,
        };

        // Own task so a panicking callback surfaces as a JoinError.
        let on_dispatch = item.action.on_dispatch;
        let callback    = tokio::spawn(async move { on_dispatch(request).await });
        let waited_ms   = now - item.enqueued_at;
        let this        = Arc::clone(self);
        tokio::spawn(async move {
            let counter = match callback.await {
                Ok(Ok(())) => {
                    trace!(id, kind = %kind, waited_ms, "Dispatched");
                    &this.counters.dispatched
                }
                Ok(Err(e)) => {
                    warn!(id, kind = %kind, "Dispatch failed, action dropped: {:#}", e);
                    &this.counters.failed
                }
                Err(e) => {
                    error!(id, kind = %kind, "Dispatch callback panicked, action dropped: {}", e);
                    &this.counters.failed
                }
            };
            // Completions from before a reset() are not counted.
            if this.core.lock().epoch == epoch {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    fn recent_dispatches(&self, now: Millis, cooldown_ms: u64) -> usize {
        let cooldown = cooldown_ms as Millis;
        self.active.iter().filter(|e| now - e.started_at < cooldown).count()
    }

    // ── History access for other components ───────────────────────────────────

    pub fn traffic_pattern(&self) -> TrafficPattern {
        let now = self.clock.now_ms();
        TrafficAnalyzer::analyze(&mut self.core.lock().history, now)
    }

    pub fn inject_noise(&self, noise: Vec<Millis>) {
        self.core.lock().history.inject_noise(noise);
    }

    pub fn decorrelate_recent<R: Rng + ?Sized>(&self, recent_count: usize, rng: &mut R) -> usize {
        self.core.lock().history.decorrelate_tail(recent_count, rng)
    }

    /// Test / introspection hook: record a timestamp as if dispatched.
    pub fn record_dispatch_at(&self, ts: Millis) {
        let mut core = self.core.lock();
        core.history.record(ts);
        core.last_dispatch = Some(ts);
    }

    pub fn history(&self) -> Vec<Millis> {
        let now = self.clock.now_ms();
        let mut core = self.core.lock();
        core.history.prune(now);
        core.history.entries().to_vec()
    }

    pub fn history_len(&self) -> usize { self.core.lock().history.len() }

    pub fn queued_count(&self) -> usize { self.core.lock().queue.len() }

    pub fn active_count(&self) -> usize { self.active.len() }

    pub fn active_dispatches(&self) -> Vec<ActiveDispatch> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    /// Clear queue, history, active set and counters; orphan running loops.
    pub fn reset(&self) {
        {
            let mut core = self.core.lock();
            core.queue.clear();
            core.history.clear();
            core.next_id       = 0;
            core.last_dispatch = None;
            core.loop_running  = false;
            core.epoch        += 1;
        }
        self.active.clear();
        self.counters.reset();
    }
}

/// Bounded Fisher–Yates over the last `window` queue slots. A candidate swap
/// is skipped unless the two priorities differ by less than 1.0. Returns the
/// swaps performed as (i, j) index pairs.
pub fn reorder_tail<R: Rng + ?Sized>(
    queue:  &mut VecDeque<QueueItem>,
    window: usize,
    rng:    &mut R,
) -> Vec<(usize, usize)> {
    let len = queue.len();
    let mut swaps = Vec::new();
    if len < 2 || window < 2 { return swaps; }

    let start = len.saturating_sub(window);
    for i in (start + 1..len).rev() {
        let j = rng.gen_range(start..=i);
        if i != j && (queue[i].priority - queue[j].priority).abs() < REORDER_TOLERANCE {
            queue.swap(i, j);
            swaps.push((i, j));
        }
    }
    swaps
}
