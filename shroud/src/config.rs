// shroud/src/config.rs
//
// Engine tunables. Loaded once at startup (JSON, every field optional) and
// replaced wholesale at runtime through ConfigHandle::replace(). Readers take
// an Arc snapshot and never observe a half-updated config.
//
// All durations are integer milliseconds.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field}: min ({min}) exceeds max ({max})")]
    InvertedRange { field: &'static str, min: u64, max: u64 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("failed to read config {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub base_delay_min_ms: u64,
    pub base_delay_max_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self { Self { base_delay_min_ms: 100, base_delay_max_ms: 2_000 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpacingConfig {
    pub min_spacing_ms: u64,
    pub max_spacing_ms: u64,
    /// Upper bound of the extra jitter added when topping up to min spacing.
    pub jitter_max_ms:  u64,
}

impl Default for SpacingConfig {
    fn default() -> Self { Self { min_spacing_ms: 50, max_spacing_ms: 500, jitter_max_ms: 25 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BurstConfig {
    pub max_concurrent: usize,
    pub cooldown_ms:    u64,
}

impl Default for BurstConfig {
    fn default() -> Self { Self { max_concurrent: 3, cooldown_ms: 1_000 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoyConfig {
    pub frequency_min_ms: u64,
    pub frequency_max_ms: u64,
}

impl Default for DecoyConfig {
    fn default() -> Self { Self { frequency_min_ms: 30_000, frequency_max_ms: 300_000 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoisoningConfig {
    pub interval_min_ms: u64,
    pub interval_max_ms: u64,
    pub noise_min:       usize,
    pub noise_max:       usize,
    /// Trailing history entries shuffled by a decorrelation pass.
    pub recent_count:    usize,
}

impl Default for PoisoningConfig {
    fn default() -> Self {
        Self {
            interval_min_ms: 60_000,
            interval_max_ms: 120_000,
            noise_min:       5,
            noise_max:       15,
            recent_count:    10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub retention_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self { Self { retention_ms: 5 * 60 * 1_000 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How many trailing queue slots an insert-time reorder pass may touch.
    pub reorder_window: usize,
}

impl Default for QueueConfig {
    fn default() -> Self { Self { reorder_window: 10 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderConfig {
    pub rotate_user_agent: bool,
    pub vary_accept:       bool,
    pub strip_identifying: bool,
    /// Set on every decorated request after all other rules, overwriting any
    /// existing value. JSON form: `[["X-Client", "blocker"], ...]`.
    pub custom:            Vec<(String, String)>,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            rotate_user_agent: true,
            vary_accept:       true,
            strip_identifying: true,
            custom:            Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub timing_randomization:   bool,
    pub queue_reordering:       bool,
    pub burst_prevention:       bool,
    pub dummy_traffic:          bool,
    pub header_randomization:   bool,
    pub statistical_poisoning:  bool,
    pub temporal_decorrelation: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            timing_randomization:   true,
            queue_reordering:       true,
            burst_prevention:       true,
            dummy_traffic:          true,
            header_randomization:   true,
            statistical_poisoning:  true,
            temporal_decorrelation: true,
        }
    }
}

// ── Top level ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub timing:    TimingConfig,
    pub spacing:   SpacingConfig,
    pub burst:     BurstConfig,
    pub decoy:     DecoyConfig,
    pub poisoning: PoisoningConfig,
    pub history:   HistoryConfig,
    pub queue:     QueueConfig,
    pub headers:   HeaderConfig,
    pub features:  FeatureFlags,
}

fn range(field: &'static str, min: u64, max: u64) -> Result<(), ConfigError> {
    if min > max { Err(ConfigError::InvertedRange { field, min, max }) } else { Ok(()) }
}

fn nonzero(field: &'static str, v: u64) -> Result<(), ConfigError> {
    if v == 0 { Err(ConfigError::Zero(field)) } else { Ok(()) }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        range("timing.base_delay", self.timing.base_delay_min_ms, self.timing.base_delay_max_ms)?;
        range("spacing", self.spacing.min_spacing_ms, self.spacing.max_spacing_ms)?;
        nonzero("burst.max_concurrent", self.burst.max_concurrent as u64)?;
        nonzero("burst.cooldown_ms", self.burst.cooldown_ms)?;
        nonzero("decoy.frequency_min_ms", self.decoy.frequency_min_ms)?;
        range("decoy.frequency", self.decoy.frequency_min_ms, self.decoy.frequency_max_ms)?;
        nonzero("poisoning.interval_min_ms", self.poisoning.interval_min_ms)?;
        range("poisoning.interval", self.poisoning.interval_min_ms, self.poisoning.interval_max_ms)?;
        range("poisoning.noise", self.poisoning.noise_min as u64, self.poisoning.noise_max as u64)?;
        nonzero("history.retention_ms", self.history.retention_ms)?;
        Ok(())
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn burst_cooldown(&self) -> Duration { Duration::from_millis(self.burst.cooldown_ms) }
}

// ── Shared handle ─────────────────────────────────────────────────────────────

/// Whole-snapshot config cell shared by every engine component.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<EngineConfig>>>,
}

impl ConfigHandle {
    pub fn new(cfg: EngineConfig) -> Self {
        Self { inner: Arc::new(RwLock::new(Arc::new(cfg))) }
    }

    pub fn snapshot(&self) -> Arc<EngineConfig> {
        self.inner.read().clone()
    }

    /// Validates, then swaps in the new snapshot. On error the old one stays.
    pub fn replace(&self, cfg: EngineConfig) -> Result<(), ConfigError> {
        cfg.validate()?;
        *self.inner.write() = Arc::new(cfg);
        Ok(())
    }
}
