// shroud/src/lib.rs
//
// Behavioral scheduling engine that disguises a host's own background
// activity from passive timing analysis: risk-adaptive delays, priority-aware
// queue shuffling, burst limits, decoy traffic and history poisoning.

pub mod analysis;
pub mod clock;
pub mod config;
pub mod engine;
pub mod events;
pub mod state;
pub mod timing;

pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineStatistics};
pub use events::{dispatch_fn, Action, ActionKind, DispatchFn, DispatchRequest, RiskLevel, TrafficPattern};
