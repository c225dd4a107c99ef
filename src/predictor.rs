// mlbreaker: Threshold predictor, turning learned health into breaker knobs

use crate::anomaly::AnomalyDetector;
use crate::config::{
    MAX_FAILURE_RATE_THRESHOLD, MAX_OPEN_WAIT, MAX_WINDOW_SIZE, MIN_FAILURE_RATE_THRESHOLD,
    MIN_OPEN_WAIT, MIN_WINDOW_SIZE,
};
use crate::ensemble::EnsembleRegressor;
use crate::error::{MlError, MlResult};
use crate::features::{feature_index, FeatureEngineer, FEATURE_WIDTH};
use crate::forecaster::ArmaForecaster;
use crate::metrics::MetricSnapshot;
use std::time::Duration;

/// Batch size pulled from the training memory on a batch tick
const BATCH_SIZE: usize = 10;

/// Everything one decision tick produced
#[derive(Debug, Clone)]
pub struct TickOutcome {
    /// Composite health score in [0, 1]; higher is healthier
    pub prediction: f64,
    pub anomaly_score: f64,
    /// True when the tick ran in an unfamiliar regime and reconfiguration
    /// should be suppressed
    pub anomalous: bool,
    pub window_size: u32,
    pub failure_rate_threshold: f64,
    pub open_state_wait: Duration,
}

impl TickOutcome {
    /// The outcome used before any telemetry exists and by the safe-defaults
    /// substitute: neutral health, conservative fixed knobs.
    pub fn neutral() -> Self {
        Self {
            prediction: 0.5,
            anomaly_score: 0.0,
            anomalous: false,
            window_size: 100,
            failure_rate_threshold: 0.5,
            open_state_wait: Duration::from_secs(30),
        }
    }
}

/// The seam the orchestrator drives each tick. The production implementation
/// is [`ThresholdPredictor`]; the trait exists so a degraded substitute (or a
/// fault-injecting test double) can stand in without touching the call path.
pub trait AdaptivePredictor: Send {
    /// Run one decision tick over the current snapshot
    fn tick(&mut self, snapshot: &MetricSnapshot) -> MlResult<TickOutcome>;

    /// Serialized ensemble state, when the implementation has one
    fn ensemble_bytes(&self) -> Option<Vec<u8>> {
        None
    }

    /// Restore ensemble state from a serialized blob
    fn restore_ensemble(&mut self, _bytes: &[u8]) -> MlResult<()> {
        Err(MlError::Model(
            "This predictor has no restorable model".to_string(),
        ))
    }
}

/// Combines the feature engineer, ensemble, forecaster and anomaly detector
/// into the three breaker knobs plus a composite health prediction.
pub struct ThresholdPredictor {
    engineer: FeatureEngineer,
    ensemble: EnsembleRegressor,
    forecaster: ArmaForecaster,
    detector: AnomalyDetector,
    training_interval: u32,
    ticks: u64,
    last_prediction: f64,
}

impl ThresholdPredictor {
    pub fn new(training_interval: u32) -> MlResult<Self> {
        if training_interval == 0 {
            return Err(MlError::Config(
                "training_interval must be > 0".to_string(),
            ));
        }

        Ok(Self {
            engineer: FeatureEngineer::new(),
            ensemble: EnsembleRegressor::new(FEATURE_WIDTH)?,
            forecaster: ArmaForecaster::new(),
            detector: AnomalyDetector::new(FEATURE_WIDTH),
            training_interval,
            ticks: 0,
            last_prediction: 0.5,
        })
    }

    pub fn last_prediction(&self) -> f64 {
        self.last_prediction
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks
    }

    /// Ensemble share of the composite: grows with experience, shrinks when
    /// the detector flags an unfamiliar regime so the autoregressive prior
    /// takes over.
    fn ensemble_weight(&self, anomaly_score: f64) -> f64 {
        let experience = (self.ticks as f64 / 100.0).min(1.0);
        let mut weight = (0.4 + 0.4 * experience).min(0.8);
        if anomaly_score > 0.8 {
            weight *= (1.0 - (anomaly_score - 0.8) * 0.5).max(0.0);
        }
        weight
    }

    fn derive_knobs(composite: f64) -> (u32, f64, Duration) {
        let min_w = MIN_WINDOW_SIZE as f64;
        let max_w = MAX_WINDOW_SIZE as f64;
        let window_size = (min_w + (1.0 - composite) * (max_w - min_w)).round() as u32;

        let failure_rate = MIN_FAILURE_RATE_THRESHOLD
            + composite * (MAX_FAILURE_RATE_THRESHOLD - MIN_FAILURE_RATE_THRESHOLD);

        let min_d = MIN_OPEN_WAIT.as_millis() as f64;
        let max_d = MAX_OPEN_WAIT.as_millis() as f64;
        let wait_ms = (min_d + (1.0 - composite) * (max_d - min_d)).round() as u64;

        (window_size, failure_rate, Duration::from_millis(wait_ms))
    }

    fn learning_target(snapshot: &MetricSnapshot, stability: f64) -> f64 {
        let latency_score = (1.0 - snapshot.p95_latency / 2_000.0).max(0.0);
        0.6 * snapshot.success_rate + 0.3 * latency_score + 0.1 * stability
    }
}

impl AdaptivePredictor for ThresholdPredictor {
    fn tick(&mut self, snapshot: &MetricSnapshot) -> MlResult<TickOutcome> {
        if snapshot.is_empty() {
            return Ok(TickOutcome::neutral());
        }

        let features = self.engineer.extract(snapshot);
        let anomaly_score = self.detector.score_and_observe(&features);
        let anomalous = self.detector.is_anomalous(anomaly_score);

        let forecast_ts = self.forecaster.forecast();
        let forecast_ens = self.ensemble.predict(&features);

        self.ticks += 1;
        let ensemble_weight = self.ensemble_weight(anomaly_score);
        let mut composite =
            ensemble_weight * forecast_ens + (1.0 - ensemble_weight) * forecast_ts;

        let error_trend = features[feature_index::ERROR_TREND];
        if error_trend > 0.3 {
            composite *= 1.0 - (error_trend - 0.3) * 0.5;
        }
        let latency_trend = features[feature_index::LATENCY_TREND];
        if latency_trend > 0.3 {
            composite *= 1.0 - (latency_trend - 0.3) * 0.3;
        }
        let composite = composite.clamp(0.0, 1.0);

        let (window_size, failure_rate_threshold, open_state_wait) =
            Self::derive_knobs(composite);

        let stability = features[feature_index::STABILITY_SCORE];
        let target = Self::learning_target(snapshot, stability);

        self.engineer
            .record_training_example(features.clone(), target);

        if self.ticks % self.training_interval as u64 == 0 {
            if let Some((batch, targets)) = self.engineer.recent_batch(BATCH_SIZE) {
                self.ensemble.learn_batch(&batch, &targets);
            } else {
                self.ensemble.learn(&features, target);
            }
        } else {
            self.ensemble.learn(&features, target);
        }
        self.forecaster.update(target);

        self.last_prediction = composite;

        tracing::debug!(
            tick = self.ticks,
            composite,
            forecast_ens,
            forecast_ts,
            anomaly_score,
            anomalous,
            target,
            window_size,
            failure_rate_threshold,
            wait_ms = open_state_wait.as_millis() as u64,
            "decision tick"
        );

        Ok(TickOutcome {
            prediction: composite,
            anomaly_score,
            anomalous,
            window_size,
            failure_rate_threshold,
            open_state_wait,
        })
    }

    fn ensemble_bytes(&self) -> Option<Vec<u8>> {
        Some(self.ensemble.to_bytes())
    }

    fn restore_ensemble(&mut self, bytes: &[u8]) -> MlResult<()> {
        let restored = EnsembleRegressor::from_bytes(bytes)?;
        if restored.input_width() != FEATURE_WIDTH {
            return Err(MlError::Serialization(format!(
                "Model input width {} does not match feature width {}",
                restored.input_width(),
                FEATURE_WIDTH
            )));
        }
        self.ensemble = restored;
        Ok(())
    }
}

/// Fixed-value substitute installed when the learning stack fails to
/// initialize. The breaker stays fully operational on conservative knobs;
/// reconfiguration is disabled by the orchestrator.
pub struct SafeDefaultsPredictor;

impl AdaptivePredictor for SafeDefaultsPredictor {
    fn tick(&mut self, _snapshot: &MetricSnapshot) -> MlResult<TickOutcome> {
        Ok(TickOutcome::neutral())
    }
}
