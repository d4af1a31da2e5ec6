// shroud/src/events.rs
//
// Shared domain types flowing through the scheduler.
//
//   Action          what a collaborator hands to Engine::enqueue()
//   QueueItem       an Action plus id / priority / computed delay, owned by the queue
//   ActiveDispatch  burst-accounting record for a dispatch that started recently
//   DispatchRequest what the external dispatch callback receives
//   TrafficPattern  statistical descriptor of recent self-generated activity
//
// Timestamps are logical milliseconds from EngineClock (see clock.rs).

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Logical clock value in milliseconds.
pub type Millis = i64;

/// Ordered header list (arrival order matters to fingerprinting observers).
pub type Headers = Vec<(String, String)>;

// ── Action kinds ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RuleUpdate,    // filter-list refresh
    ResourceBlock, // block / redirect a matched resource
    CosmeticHide,  // stealth styling batch from the DOM watcher
    Telemetry,     // counters, dashboard sync
    Decoy,         // synthetic cover activity
}

impl ActionKind {
    /// Added to the base priority of 5.0 at enqueue time.
    pub fn priority_adjustment(self) -> f64 {
        match self {
            Self::RuleUpdate    =>  2.0,
            Self::ResourceBlock =>  1.0,
            Self::CosmeticHide  =>  0.0,
            Self::Telemetry     => -1.0,
            Self::Decoy         => -2.0,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RuleUpdate    => write!(f, "RULE_UPDATE"),
            Self::ResourceBlock => write!(f, "RESOURCE_BLOCK"),
            Self::CosmeticHide  => write!(f, "COSMETIC_HIDE"),
            Self::Telemetry     => write!(f, "TELEMETRY"),
            Self::Decoy         => write!(f, "DECOY"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod { Get, Post, Head }

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get  => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Head => write!(f, "HEAD"),
        }
    }
}

// ── Dispatch contract ─────────────────────────────────────────────────────────

/// Handed to the external dispatch callback once an item's wait has elapsed.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchRequest {
    pub id:            u64,
    pub kind:          ActionKind,
    pub payload:       Value,
    /// Present only for header-bearing actions; already decorated if header
    /// randomization is enabled.
    pub headers:       Option<Headers>,
    pub dispatched_at: Millis,
}

impl DispatchRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.as_ref()?
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub type DispatchFn =
    Arc<dyn Fn(DispatchRequest) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a `DispatchFn`.
pub fn dispatch_fn<F, Fut>(f: F) -> DispatchFn
where
    F:   Fn(DispatchRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

/// Unit of work submitted by a collaborator (filter engine, DOM watcher, ...).
#[derive(Clone)]
pub struct Action {
    pub kind:        ActionKind,
    pub payload:     Value,
    pub headers:     Option<Headers>,
    pub on_dispatch: DispatchFn,
}

impl Action {
    pub fn new(kind: ActionKind, payload: Value, on_dispatch: DispatchFn) -> Self {
        Self { kind, payload, headers: None, on_dispatch }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("kind", &self.kind)
            .field("payload", &self.payload)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

// ── Queue state ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct QueueItem {
    pub id:          u64,
    pub action:      Action,
    pub enqueued_at: Millis,
    pub priority:    f64,
    pub delay:       Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveDispatch {
    pub id:         u64,
    pub kind:       ActionKind,
    pub started_at: Millis,
    pub payload:    Value,
}

// ── Traffic pattern ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low    => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High   => write!(f, "high"),
        }
    }
}

/// Recomputed on demand from TimingHistory; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TrafficPattern {
    /// Entries in the last 60s.
    pub frequency:        usize,
    /// Mean of consecutive deltas (ms).
    pub average_interval: f64,
    /// Coefficient of variation of the deltas.
    pub burstiness:       f64,
    /// Lag-1 autocorrelation proxy.
    pub predictability:   f64,
    pub risk_level:       RiskLevel,
}
