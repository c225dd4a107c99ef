// mlbreaker: Adaptive configuration manager

use crate::config::BreakerConfig;
use crate::predictor::TickOutcome;
use std::time::Duration;

const RELATIVE_EPSILON: f64 = 1e-9;

/// Absolute open-wait change that is always significant
const WAIT_ABSOLUTE_TRIGGER: Duration = Duration::from_secs(1);

/// Decides when a knob change is worth a replacement and packages the
/// predictor's knobs into a full breaker configuration.
pub struct AdaptiveConfigManager {
    /// Per-knob relative change required before a replacement is considered
    significant_change: f64,
    /// Fixed operational constants carried into every produced config
    template: BreakerConfig,
}

impl AdaptiveConfigManager {
    pub fn new(significant_change: f64, template: BreakerConfig) -> Self {
        Self {
            significant_change,
            template,
        }
    }

    /// Package the predictor's knobs plus the fixed operational constants
    pub fn updated_config(&self, outcome: &TickOutcome) -> BreakerConfig {
        BreakerConfig {
            window_size: outcome.window_size,
            failure_rate_threshold: outcome.failure_rate_threshold,
            open_state_wait: outcome.open_state_wait,
            min_calls: self.template.min_calls,
            permitted_half_open_calls: self.template.permitted_half_open_calls,
            slow_call_rate_threshold: self.template.slow_call_rate_threshold,
            slow_call_duration: self.template.slow_call_duration,
        }
        .validated()
    }

    /// True when any knob moved by more than the relative threshold, or the
    /// open-state wait moved by more than a second in absolute terms.
    pub fn is_significant(&self, new: &BreakerConfig, old: &BreakerConfig) -> bool {
        let window_shift = relative_change(new.window_size as f64, old.window_size as f64);
        let threshold_shift = relative_change(
            new.failure_rate_threshold,
            old.failure_rate_threshold,
        );

        let new_wait = new.open_state_wait.as_millis() as f64;
        let old_wait = old.open_state_wait.as_millis() as f64;
        let wait_shift = relative_change(new_wait, old_wait);

        let wait_absolute = if new.open_state_wait > old.open_state_wait {
            new.open_state_wait - old.open_state_wait
        } else {
            old.open_state_wait - new.open_state_wait
        };

        window_shift > self.significant_change
            || threshold_shift > self.significant_change
            || wait_shift > self.significant_change
            || wait_absolute > WAIT_ABSOLUTE_TRIGGER
    }
}

fn relative_change(new: f64, old: f64) -> f64 {
    (new - old).abs() / old.max(RELATIVE_EPSILON)
}
