// mlbreaker: Feature engineering for the learning stack

use crate::metrics::MetricSnapshot;
use std::collections::VecDeque;

/// Fixed width of every extracted feature vector
pub const FEATURE_WIDTH: usize = 15;

/// Snapshots retained for trend computation
pub const TREND_WINDOW: usize = 10;

/// Capacity of the training memory
pub const TRAINING_MEMORY: usize = 100;

/// Fixed feature indices. Downstream consumers and tests address features by
/// position, so this layout must not change.
pub mod feature_index {
    pub const LATENCY_NORM: usize = 0;
    pub const ERROR_RATE: usize = 1;
    pub const CONCURRENCY_NORM: usize = 2;
    pub const LOAD_NORM: usize = 3;
    pub const TIME_OF_DAY: usize = 4;
    pub const ERROR_TREND: usize = 5;
    pub const LATENCY_TREND: usize = 6;
    pub const STABILITY_SCORE: usize = 7;
    pub const LATENCY_X_ERROR: usize = 8;
    pub const LATENCY_SQUARED: usize = 9;
    pub const CONCURRENCY_X_ERROR: usize = 10;
    pub const LOAD_X_LATENCY: usize = 11;
    pub const IS_BUSINESS_HOURS: usize = 12;
    pub const IS_NIGHTTIME: usize = 13;
    pub const RECENT_FAILURE_DECAY: usize = 14;
}

/// One (features, target) pair held in the training memory
#[derive(Debug, Clone)]
pub struct TrainingExample {
    pub features: Vec<f64>,
    pub target: f64,
}

#[derive(Debug, Clone, Copy)]
struct TrendPoint {
    error_rate: f64,
    p95_latency: f64,
}

/// Turns a snapshot plus recent history into a fixed-width feature vector and
/// maintains a short training memory.
pub struct FeatureEngineer {
    trend: VecDeque<TrendPoint>,
    memory: VecDeque<TrainingExample>,
}

impl Default for FeatureEngineer {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureEngineer {
    pub fn new() -> Self {
        Self {
            trend: VecDeque::with_capacity(TREND_WINDOW),
            memory: VecDeque::with_capacity(TRAINING_MEMORY),
        }
    }

    /// Extract the 15-wide feature vector for one snapshot.
    ///
    /// The snapshot is also absorbed into the trend window, so extraction
    /// must happen exactly once per decision tick.
    pub fn extract(&mut self, snapshot: &MetricSnapshot) -> Vec<f64> {
        if self.trend.len() >= TREND_WINDOW {
            self.trend.pop_front();
        }
        self.trend.push_back(TrendPoint {
            error_rate: snapshot.error_rate,
            p95_latency: snapshot.p95_latency,
        });

        let latency_norm = snapshot.p95_latency / 1_000.0;
        let error_rate = snapshot.error_rate;
        let concurrency_norm = snapshot.concurrency / 10.0;
        let load_norm = snapshot.system_load / 10.0;
        let time_of_day = snapshot.time_of_day;

        let error_trend = self.error_trend();
        let latency_trend = self.latency_trend();
        let stability = self.stability_score(snapshot);
        let failure_decay = self.recent_failure_decay();

        let is_business_hours = if (0.33..=0.75).contains(&time_of_day) {
            1.0
        } else {
            0.0
        };
        let is_nighttime = if time_of_day <= 0.25 || time_of_day >= 0.875 {
            1.0
        } else {
            0.0
        };

        vec![
            latency_norm,
            error_rate,
            concurrency_norm,
            load_norm,
            time_of_day,
            error_trend,
            latency_trend,
            stability,
            latency_norm * error_rate,
            latency_norm * latency_norm,
            concurrency_norm * error_rate,
            load_norm * latency_norm,
            is_business_hours,
            is_nighttime,
            failure_decay,
        ]
    }

    /// Short-horizon error-rate trend in [-1, 1].
    ///
    /// With three or more snapshots the newest rate is compared against an
    /// exponentially weighted mean of the historical ones (decay 0.8 toward
    /// older); with exactly two, against the oldest.
    fn error_trend(&self) -> f64 {
        let len = self.trend.len();
        if len < 2 {
            return 0.0;
        }

        let newest = self.trend[len - 1].error_rate;
        if len == 2 {
            return clip((newest - self.trend[0].error_rate) * 5.0, -1.0, 1.0);
        }

        let mut weighted_sum = 0.0;
        let mut weight_sum = 0.0;
        let mut weight = 1.0;
        for point in self.trend.iter().rev().skip(1) {
            weighted_sum += point.error_rate * weight;
            weight_sum += weight;
            weight *= 0.8;
        }
        let weighted_mean = weighted_sum / weight_sum;

        clip((newest - weighted_mean) * 5.0, -1.0, 1.0)
    }

    /// p95 drift over the trend window, 500ms of drift saturating the scale
    fn latency_trend(&self) -> f64 {
        let len = self.trend.len();
        if len < 2 {
            return 0.0;
        }
        let newest = self.trend[len - 1].p95_latency;
        let oldest = self.trend[0].p95_latency;
        clip((newest - oldest) / 500.0, -1.0, 1.0)
    }

    /// Composite stability estimate in [0, 1].
    ///
    /// Base score blends error rate, latency headroom and how close the host
    /// sits to a healthy load point; once enough history exists the score is
    /// rescaled by the observed error/latency variance.
    fn stability_score(&self, snapshot: &MetricSnapshot) -> f64 {
        let error_component = 1.0 - snapshot.error_rate;
        let latency_component = (1.0 - snapshot.p95_latency / 2_000.0).max(0.0);
        let load_component = clip(
            1.0 - 1.5 * (0.6 - snapshot.system_load / 10.0).abs(),
            0.0,
            1.0,
        );

        let mut score =
            0.5 * error_component + 0.3 * latency_component + 0.2 * load_component;

        if self.trend.len() >= 3 {
            let err_var = variance(self.trend.iter().map(|p| p.error_rate));
            // Variance on the latency_norm scale; raw milliseconds would
            // saturate the normalization for any realistic service.
            let lat_var = variance(self.trend.iter().map(|p| p.p95_latency / 1_000.0));

            let norm_err_var = (err_var * 20.0).min(1.0);
            let norm_lat_var = (lat_var * 5.0).min(1.0);
            let variance_component = 1.0 - (0.6 * norm_err_var + 0.4 * norm_lat_var);

            score *= 0.8 + 0.2 * variance_component;
        }

        clip(score, 0.0, 1.0)
    }

    /// Exponentially decayed memory of recent failure rates, in [0, 1]
    fn recent_failure_decay(&self) -> f64 {
        let len = self.trend.len();
        if len < 2 {
            return 0.0;
        }

        let mut weighted_sum = 0.0;
        let mut weight_sum = 0.0;
        let mut weight = 1.0;
        for point in self.trend.iter().rev().skip(1) {
            weighted_sum += point.error_rate * weight;
            weight_sum += weight;
            weight *= 0.7;
        }

        clip(weighted_sum / weight_sum * 2.0, 0.0, 1.0)
    }

    /// Append a training example, evicting the oldest on overflow
    pub fn record_training_example(&mut self, features: Vec<f64>, target: f64) {
        if self.memory.len() >= TRAINING_MEMORY {
            self.memory.pop_front();
        }
        self.memory.push_back(TrainingExample { features, target });
    }

    /// The most recent `n` training examples, or None when fewer exist
    pub fn recent_batch(&self, n: usize) -> Option<(Vec<Vec<f64>>, Vec<f64>)> {
        if self.memory.len() < n || n == 0 {
            return None;
        }

        let start = self.memory.len() - n;
        let mut features = Vec::with_capacity(n);
        let mut targets = Vec::with_capacity(n);
        for example in self.memory.iter().skip(start) {
            features.push(example.features.clone());
            targets.push(example.target);
        }
        Some((features, targets))
    }

    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    pub fn trend_len(&self) -> usize {
        self.trend.len()
    }
}

fn variance(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let count = values.clone().count();
    if count == 0 {
        return 0.0;
    }
    let mean = values.clone().sum::<f64>() / count as f64;
    values.map(|v| (v - mean) * (v - mean)).sum::<f64>() / count as f64
}

fn clip(value: f64, lo: f64, hi: f64) -> f64 {
    value.clamp(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::feature_index as idx;
    use super::*;

    fn snapshot(error_rate: f64, p95_latency: f64, load: f64) -> MetricSnapshot {
        MetricSnapshot {
            p95_latency,
            error_rate,
            success_rate: 1.0 - error_rate,
            concurrency: 4.0,
            system_load: load,
            time_of_day: 0.5,
            sample_count: 50,
        }
    }

    #[test]
    fn test_feature_vector_width_and_finiteness() {
        let mut engineer = FeatureEngineer::new();
        let features = engineer.extract(&snapshot(0.1, 120.0, 2.0));

        assert_eq!(features.len(), FEATURE_WIDTH);
        assert!(features.iter().all(|f| f.is_finite()));
    }

    #[test]
    fn test_normalizations_by_index() {
        let mut engineer = FeatureEngineer::new();
        let features = engineer.extract(&snapshot(0.2, 500.0, 3.0));

        assert!((features[idx::LATENCY_NORM] - 0.5).abs() < 1e-12);
        assert!((features[idx::ERROR_RATE] - 0.2).abs() < 1e-12);
        assert!((features[idx::CONCURRENCY_NORM] - 0.4).abs() < 1e-12);
        assert!((features[idx::LOAD_NORM] - 0.3).abs() < 1e-12);
        assert!((features[idx::LATENCY_X_ERROR] - 0.1).abs() < 1e-12);
        assert!((features[idx::LATENCY_SQUARED] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_first_snapshot_has_no_trends() {
        let mut engineer = FeatureEngineer::new();
        let features = engineer.extract(&snapshot(0.1, 100.0, 2.0));

        assert_eq!(features[idx::ERROR_TREND], 0.0);
        assert_eq!(features[idx::LATENCY_TREND], 0.0);
        assert_eq!(features[idx::RECENT_FAILURE_DECAY], 0.0);
    }

    #[test]
    fn test_error_trend_two_snapshots_uses_oldest() {
        let mut engineer = FeatureEngineer::new();
        engineer.extract(&snapshot(0.1, 100.0, 2.0));
        let features = engineer.extract(&snapshot(0.2, 100.0, 2.0));

        // (0.2 - 0.1) * 5 = 0.5
        assert!((features[idx::ERROR_TREND] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_error_trend_saturates() {
        let mut engineer = FeatureEngineer::new();
        engineer.extract(&snapshot(0.0, 100.0, 2.0));
        let features = engineer.extract(&snapshot(0.9, 100.0, 2.0));

        assert_eq!(features[idx::ERROR_TREND], 1.0);
    }

    #[test]
    fn test_error_trend_weights_recent_history_more() {
        let mut engineer = FeatureEngineer::new();
        engineer.extract(&snapshot(0.4, 100.0, 2.0));
        engineer.extract(&snapshot(0.1, 100.0, 2.0));
        let features = engineer.extract(&snapshot(0.1, 100.0, 2.0));

        // Weighted history mean sits between 0.1 (recent) and 0.4 (old) but
        // closer to 0.1, so the trend is a small negative value.
        assert!(features[idx::ERROR_TREND] < 0.0);
        assert!(features[idx::ERROR_TREND] > -1.0);
    }

    #[test]
    fn test_latency_trend_direction_and_saturation() {
        let mut engineer = FeatureEngineer::new();
        engineer.extract(&snapshot(0.0, 100.0, 2.0));
        let features = engineer.extract(&snapshot(0.0, 350.0, 2.0));
        assert!((features[idx::LATENCY_TREND] - 0.5).abs() < 1e-9);

        let mut engineer = FeatureEngineer::new();
        engineer.extract(&snapshot(0.0, 100.0, 2.0));
        let saturated = engineer.extract(&snapshot(0.0, 5_000.0, 2.0));
        assert_eq!(saturated[idx::LATENCY_TREND], 1.0);
    }

    #[test]
    fn test_stability_score_degrades_with_errors() {
        let mut healthy = FeatureEngineer::new();
        let healthy_score = healthy.extract(&snapshot(0.0, 50.0, 6.0))[idx::STABILITY_SCORE];

        let mut failing = FeatureEngineer::new();
        let failing_score = failing.extract(&snapshot(0.9, 1_900.0, 9.9))[idx::STABILITY_SCORE];

        assert!(healthy_score > failing_score);
        assert!((0.0..=1.0).contains(&healthy_score));
        assert!((0.0..=1.0).contains(&failing_score));
    }

    #[test]
    fn test_business_hours_and_nighttime_flags() {
        let mut engineer = FeatureEngineer::new();
        let mut snap = snapshot(0.0, 100.0, 2.0);

        snap.time_of_day = 0.5; // midday
        let features = engineer.extract(&snap);
        assert_eq!(features[idx::IS_BUSINESS_HOURS], 1.0);
        assert_eq!(features[idx::IS_NIGHTTIME], 0.0);

        snap.time_of_day = 0.08; // 2am
        let features = engineer.extract(&snap);
        assert_eq!(features[idx::IS_BUSINESS_HOURS], 0.0);
        assert_eq!(features[idx::IS_NIGHTTIME], 1.0);
    }

    #[test]
    fn test_failure_decay_clipped_to_unit() {
        let mut engineer = FeatureEngineer::new();
        for _ in 0..5 {
            engineer.extract(&snapshot(0.9, 100.0, 2.0));
        }
        let features = engineer.extract(&snapshot(0.9, 100.0, 2.0));
        assert_eq!(features[idx::RECENT_FAILURE_DECAY], 1.0);
    }

    #[test]
    fn test_trend_window_is_bounded() {
        let mut engineer = FeatureEngineer::new();
        for _ in 0..50 {
            engineer.extract(&snapshot(0.1, 100.0, 2.0));
        }
        assert_eq!(engineer.trend_len(), TREND_WINDOW);
    }

    #[test]
    fn test_training_memory_bounded_and_fifo() {
        let mut engineer = FeatureEngineer::new();
        for i in 0..150 {
            engineer.record_training_example(vec![i as f64; FEATURE_WIDTH], i as f64);
        }

        assert_eq!(engineer.memory_len(), TRAINING_MEMORY);
        let (_, targets) = engineer.recent_batch(TRAINING_MEMORY).expect("full batch");
        assert_eq!(targets[0], 50.0);
        assert_eq!(targets[TRAINING_MEMORY - 1], 149.0);
    }

    #[test]
    fn test_recent_batch_requires_enough_examples() {
        let mut engineer = FeatureEngineer::new();
        for i in 0..5 {
            engineer.record_training_example(vec![0.0; FEATURE_WIDTH], i as f64);
        }

        assert!(engineer.recent_batch(10).is_none());
        let (features, targets) = engineer.recent_batch(5).expect("batch of 5");
        assert_eq!(features.len(), 5);
        assert_eq!(targets, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }
}
