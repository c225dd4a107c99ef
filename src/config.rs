// mlbreaker: Configuration support

use crate::error::{MlError, MlResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Legal range for the sliding-window knob
pub const MIN_WINDOW_SIZE: u32 = 10;
pub const MAX_WINDOW_SIZE: u32 = 100;

/// Legal range for the failure-rate-threshold knob
pub const MIN_FAILURE_RATE_THRESHOLD: f64 = 0.2;
pub const MAX_FAILURE_RATE_THRESHOLD: f64 = 0.8;

/// Legal range for the open-state cooldown knob
pub const MIN_OPEN_WAIT: Duration = Duration::from_millis(1_000);
pub const MAX_OPEN_WAIT: Duration = Duration::from_millis(60_000);

/// Breaker settings loaded from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Identity of the breaker instance for metrics and persistence keys
    pub name: String,
    pub ml: MlSettings,
}

/// ML subsystem settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlSettings {
    /// Whether ML updates and reconfiguration run at all. When false the
    /// breaker behaves as a classic breaker using the initial knobs.
    pub enabled: bool,
    /// Minimum observations before a decision can open the circuit
    pub min_calls: u32,
    /// Permitted trial calls in half-open
    pub half_open_calls: u32,
    pub initial_failure_threshold: f64,
    pub initial_window: u32,
    pub initial_wait_ms: u64,
    /// Minimum spacing between config replacements
    pub reconfig_min_interval_ms: u64,
    /// Per-knob relative change required before a replacement is considered
    pub significant_change: f64,
    /// Batch-learn frequency, in ticks
    pub training_interval: u32,
    /// Periodic report cadence for the background worker
    pub report_interval_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            name: "defaultBreaker".to_string(),
            ml: MlSettings::default(),
        }
    }
}

impl Default for MlSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_calls: 10,
            half_open_calls: 5,
            initial_failure_threshold: 0.5,
            initial_window: 100,
            initial_wait_ms: 30_000,
            reconfig_min_interval_ms: 60_000,
            significant_change: 0.10,
            training_interval: 10,
            report_interval_secs: 3_600,
        }
    }
}

/// On-disk layout: everything lives under a `[breaker]` table, so option
/// paths read `breaker.name`, `breaker.ml.enabled`, and so on.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SettingsFile {
    breaker: BreakerSettings,
}

impl BreakerSettings {
    /// Load settings from a TOML file
    pub fn from_file(path: &str) -> MlResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MlError::Config(format!("Failed to read config file {}: {}", path, e)))?;

        let file: SettingsFile = toml::from_str(&content)
            .map_err(|e| MlError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(file.breaker)
    }

    /// The breaker configuration in force before any adaptation has run
    pub fn initial_config(&self) -> BreakerConfig {
        BreakerConfig {
            window_size: self.ml.initial_window,
            failure_rate_threshold: self.ml.initial_failure_threshold,
            open_state_wait: Duration::from_millis(self.ml.initial_wait_ms),
            min_calls: self.ml.min_calls,
            permitted_half_open_calls: self.ml.half_open_calls,
            ..BreakerConfig::default()
        }
        .validated()
    }
}

/// The three adaptive knobs plus fixed operational constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub window_size: u32,
    pub failure_rate_threshold: f64,
    pub open_state_wait: Duration,
    pub min_calls: u32,
    pub permitted_half_open_calls: u32,
    pub slow_call_rate_threshold: f64,
    pub slow_call_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            failure_rate_threshold: 0.5,
            open_state_wait: Duration::from_millis(30_000),
            min_calls: 10,
            permitted_half_open_calls: 5,
            slow_call_rate_threshold: 0.5,
            slow_call_duration: Duration::from_secs(1),
        }
    }
}

impl BreakerConfig {
    /// Clamp the adaptive knobs into their legal ranges
    pub fn validated(mut self) -> Self {
        self.window_size = self.window_size.clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE);
        self.failure_rate_threshold = self
            .failure_rate_threshold
            .clamp(MIN_FAILURE_RATE_THRESHOLD, MAX_FAILURE_RATE_THRESHOLD);
        self.open_state_wait = self.open_state_wait.clamp(MIN_OPEN_WAIT, MAX_OPEN_WAIT);
        self
    }
}
