// mlbreaker: Statistical anomaly detection over feature vectors

use std::collections::VecDeque;

/// Samples kept for the exact-statistics phase and distribution inspection
pub const RECENT_SAMPLES: usize = 30;

/// Observations required before anomalies are reported
pub const MIN_SAMPLES: u64 = 10;

/// Default score threshold
pub const DEFAULT_THRESHOLD: f64 = 2.5;

const EMA_RATE: f64 = 0.1;
const VARIANCE_FLOOR: f64 = 1e-4;

/// Per-feature running statistics with an RMS z-score.
///
/// The first `MIN_SAMPLES` observations recompute mean and variance exactly
/// from the retained sample buffer; after that the statistics decay by EMA so
/// the detector tracks slow regime drift without forgetting instantly.
pub struct AnomalyDetector {
    width: usize,
    mean: Vec<f64>,
    variance: Vec<f64>,
    min: Vec<f64>,
    max: Vec<f64>,
    count: u64,
    recent: VecDeque<Vec<f64>>,
    threshold: f64,
}

impl AnomalyDetector {
    pub fn new(width: usize) -> Self {
        Self::with_threshold(width, DEFAULT_THRESHOLD)
    }

    pub fn with_threshold(width: usize, threshold: f64) -> Self {
        Self {
            width,
            mean: vec![0.0; width],
            variance: vec![0.0; width],
            min: vec![f64::INFINITY; width],
            max: vec![f64::NEG_INFINITY; width],
            count: 0,
            recent: VecDeque::with_capacity(RECENT_SAMPLES),
            threshold,
        }
    }

    /// RMS of per-feature z-scores against the current statistics
    pub fn score(&self, features: &[f64]) -> f64 {
        if self.count == 0 || features.len() != self.width {
            return 0.0;
        }

        let mut sum_sq = 0.0;
        for i in 0..self.width {
            let std = self.variance[i].max(VARIANCE_FLOOR).sqrt();
            let z = (features[i] - self.mean[i]) / std;
            sum_sq += z * z;
        }

        (sum_sq / self.width as f64).sqrt()
    }

    /// Score against the pre-update statistics, then absorb the observation
    pub fn score_and_observe(&mut self, features: &[f64]) -> f64 {
        let score = self.score(features);
        self.observe(features);
        score
    }

    /// Absorb one feature vector into the running statistics
    pub fn observe(&mut self, features: &[f64]) {
        if features.len() != self.width {
            return;
        }

        for i in 0..self.width {
            self.min[i] = self.min[i].min(features[i]);
            self.max[i] = self.max[i].max(features[i]);
        }

        if self.recent.len() >= RECENT_SAMPLES {
            self.recent.pop_front();
        }
        self.recent.push_back(features.to_vec());
        self.count += 1;

        if self.count <= MIN_SAMPLES {
            self.recompute_exact();
        } else {
            for i in 0..self.width {
                self.mean[i] = (1.0 - EMA_RATE) * self.mean[i] + EMA_RATE * features[i];
                let diff = features[i] - self.mean[i];
                self.variance[i] =
                    (1.0 - EMA_RATE) * self.variance[i] + EMA_RATE * diff * diff;
            }
        }
    }

    /// Whether the score marks an unfamiliar regime. Never fires during the
    /// warmup phase, where z-scores against near-empty statistics are noise.
    pub fn is_anomalous(&self, score: f64) -> bool {
        self.count >= MIN_SAMPLES && score > self.threshold
    }

    pub fn observation_count(&self) -> u64 {
        self.count
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn recompute_exact(&mut self) {
        let n = self.recent.len() as f64;
        for i in 0..self.width {
            let mean = self.recent.iter().map(|s| s[i]).sum::<f64>() / n;
            let variance = self
                .recent
                .iter()
                .map(|s| (s[i] - mean) * (s[i] - mean))
                .sum::<f64>()
                / n;
            self.mean[i] = mean;
            self.variance[i] = variance;
        }
    }
}
