// mlbreaker: Prediction accuracy and reconfiguration-effectiveness tracking

use crate::config::BreakerConfig;
use crate::metrics::MetricSnapshot;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A prediction is "accurate" when its absolute error is below this bound
pub const ACCURACY_BOUND: f64 = 0.25;

/// Parameter changes retained for effectiveness tracking
const CHANGE_HISTORY: usize = 50;

/// Stable gauge names of the telemetry surface
pub mod gauge {
    pub const PREDICTION_ACCURACY_PERCENT: &str = "ml.prediction.accuracy.percent";
    pub const PREDICTION_ERROR_AVG: &str = "ml.prediction.error.avg";
    pub const PREDICTION_ERROR_LAST: &str = "ml.prediction.error.last";
    pub const PREDICTION_ACTUAL: &str = "ml.prediction.actual";
    pub const PREDICTION_FORECAST: &str = "ml.prediction.forecast";
    pub const FEATURE_LATENCY: &str = "ml.feature.latency";
    pub const FEATURE_ERROR_RATE: &str = "ml.feature.error_rate";
    pub const FEATURE_CONCURRENCY: &str = "ml.feature.concurrency";
    pub const FEATURE_SYSTEM_LOAD: &str = "ml.feature.system_load";
    pub const CONFIG_WINDOW_SIZE: &str = "ml.config.window_size";
    pub const CONFIG_THRESHOLD: &str = "ml.config.threshold";
    pub const CONFIG_WAIT_DURATION: &str = "ml.config.wait_duration";
    pub const CONFIG_EFFECTIVENESS: &str = "ml.config.effectiveness";
}

/// One knob replacement with the error rates observed around it
#[derive(Debug, Clone)]
pub struct ParameterChange {
    pub at_ms: u64,
    /// Window error rate just before the change
    pub pre_error_rate: f64,
    /// Window error rate observed after the change settled; filled in at the
    /// next report
    pub post_error_rate: Option<f64>,
    pub window_size: u32,
    pub failure_rate_threshold: f64,
    pub open_wait_ms: u64,
}

impl ParameterChange {
    /// Positive means the error rate got worse after the change
    pub fn effectiveness_delta(&self) -> Option<f64> {
        self.post_error_rate.map(|post| post - self.pre_error_rate)
    }
}

/// Numeric gauge snapshot of the whole surface
#[derive(Debug, Clone, Default)]
pub struct TelemetryGauges {
    pub prediction_accuracy_percent: f64,
    pub prediction_error_avg: f64,
    pub prediction_error_last: f64,
    pub prediction_actual: f64,
    pub prediction_forecast: f64,
    pub feature_latency: f64,
    pub feature_error_rate: f64,
    pub feature_concurrency: f64,
    pub feature_system_load: f64,
    pub config_window_size: f64,
    pub config_threshold: f64,
    pub config_wait_duration_ms: f64,
    pub config_effectiveness: f64,
}

#[derive(Default)]
struct MonitorInner {
    predictions: u64,
    accurate: u64,
    error_sum: f64,
    last_error: f64,
    last_actual: f64,
    last_forecast: f64,
    feature_latency: f64,
    feature_error_rate: f64,
    feature_concurrency: f64,
    feature_system_load: f64,
    config_window_size: f64,
    config_threshold: f64,
    config_wait_ms: f64,
    changes: VecDeque<ParameterChange>,
}

/// Records prediction-vs-actual error and parameter-change effectiveness.
///
/// Interior-locked so the call path and the report worker can share it.
pub struct PerformanceMonitor {
    inner: Mutex<MonitorInner>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MonitorInner::default()),
        }
    }

    /// Record one prediction against the observed outcome
    pub fn record_prediction(&self, predicted: f64, actual: f64) {
        let error = (actual - predicted).abs();
        let mut inner = self.inner.lock();
        inner.predictions += 1;
        if error < ACCURACY_BOUND {
            inner.accurate += 1;
        }
        inner.error_sum += error;
        inner.last_error = error;
        inner.last_actual = actual;
        inner.last_forecast = predicted;
    }

    /// Refresh the feature gauges from the current snapshot
    pub fn record_features(&self, snapshot: &MetricSnapshot) {
        let mut inner = self.inner.lock();
        inner.feature_latency = snapshot.p95_latency;
        inner.feature_error_rate = snapshot.error_rate;
        inner.feature_concurrency = snapshot.concurrency;
        inner.feature_system_load = snapshot.system_load;
    }

    /// Record a knob replacement with the pre-change error rate
    pub fn record_config_change(&self, pre_error_rate: f64, config: &BreakerConfig) {
        let mut inner = self.inner.lock();
        inner.config_window_size = config.window_size as f64;
        inner.config_threshold = config.failure_rate_threshold;
        inner.config_wait_ms = config.open_state_wait.as_millis() as f64;

        if inner.changes.len() >= CHANGE_HISTORY {
            inner.changes.pop_front();
        }
        inner.changes.push_back(ParameterChange {
            at_ms: Utc::now().timestamp_millis() as u64,
            pre_error_rate,
            post_error_rate: None,
            window_size: config.window_size,
            failure_rate_threshold: config.failure_rate_threshold,
            open_wait_ms: config.open_state_wait.as_millis() as u64,
        });
    }

    /// Record the initial knobs so the config gauges are meaningful before
    /// any replacement has happened
    pub fn record_initial_config(&self, config: &BreakerConfig) {
        let mut inner = self.inner.lock();
        inner.config_window_size = config.window_size as f64;
        inner.config_threshold = config.failure_rate_threshold;
        inner.config_wait_ms = config.open_state_wait.as_millis() as f64;
    }

    /// Fill the post-change error rate on any change still waiting for one
    pub fn observe_post_change(&self, current_error_rate: f64) {
        let mut inner = self.inner.lock();
        for change in inner.changes.iter_mut() {
            if change.post_error_rate.is_none() {
                change.post_error_rate = Some(current_error_rate);
            }
        }
    }

    pub fn prediction_count(&self) -> u64 {
        self.inner.lock().predictions
    }

    pub fn change_history(&self) -> Vec<ParameterChange> {
        self.inner.lock().changes.iter().cloned().collect()
    }

    /// Current value of every gauge
    pub fn gauges(&self) -> TelemetryGauges {
        let inner = self.inner.lock();
        let accuracy = if inner.predictions > 0 {
            inner.accurate as f64 / inner.predictions as f64 * 100.0
        } else {
            0.0
        };
        let error_avg = if inner.predictions > 0 {
            inner.error_sum / inner.predictions as f64
        } else {
            0.0
        };
        let effectiveness = inner
            .changes
            .iter()
            .rev()
            .find_map(|c| c.effectiveness_delta())
            .unwrap_or(0.0);

        TelemetryGauges {
            prediction_accuracy_percent: accuracy,
            prediction_error_avg: error_avg,
            prediction_error_last: inner.last_error,
            prediction_actual: inner.last_actual,
            prediction_forecast: inner.last_forecast,
            feature_latency: inner.feature_latency,
            feature_error_rate: inner.feature_error_rate,
            feature_concurrency: inner.feature_concurrency,
            feature_system_load: inner.feature_system_load,
            config_window_size: inner.config_window_size,
            config_threshold: inner.config_threshold,
            config_wait_duration_ms: inner.config_wait_ms,
            config_effectiveness: effectiveness,
        }
    }

    /// Human-readable summary line for the periodic report
    pub fn report(&self) -> String {
        let gauges = self.gauges();
        let changes = self.inner.lock().changes.len();
        format!(
            "Predictions: {:5} | Accuracy: {:5.1}% | Err avg: {:.4} (last: {:.4}) | Knobs: window={} threshold={:.2} wait={}ms | Changes: {} | Effectiveness: {:+.4}",
            self.prediction_count(),
            gauges.prediction_accuracy_percent,
            gauges.prediction_error_avg,
            gauges.prediction_error_last,
            gauges.config_window_size as u64,
            gauges.config_threshold,
            gauges.config_wait_duration_ms as u64,
            changes,
            gauges.config_effectiveness,
        )
    }

    /// Emit the gauge surface as structured fields; field names match the
    /// constants in [`gauge`]
    pub fn emit(&self, breaker_name: &str) {
        let gauges = self.gauges();
        tracing::info!(
            target: "mlbreaker::telemetry",
            breaker = breaker_name,
            ml.prediction.accuracy.percent = gauges.prediction_accuracy_percent,
            ml.prediction.error.avg = gauges.prediction_error_avg,
            ml.prediction.error.last = gauges.prediction_error_last,
            ml.prediction.actual = gauges.prediction_actual,
            ml.prediction.forecast = gauges.prediction_forecast,
            ml.feature.latency = gauges.feature_latency,
            ml.feature.error_rate = gauges.feature_error_rate,
            ml.feature.concurrency = gauges.feature_concurrency,
            ml.feature.system_load = gauges.feature_system_load,
            ml.config.window_size = gauges.config_window_size,
            ml.config.threshold = gauges.config_threshold,
            ml.config.wait_duration = gauges.config_wait_duration_ms,
            ml.config.effectiveness = gauges.config_effectiveness,
            "telemetry gauges"
        );
    }
}
