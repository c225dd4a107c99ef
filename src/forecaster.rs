// mlbreaker: ARMA forecaster over the health signal

use std::collections::VecDeque;

/// Autoregressive order
pub const AR_ORDER: usize = 5;

/// Moving-average order
pub const MA_ORDER: usize = 3;

const LEARNING_RATE: f64 = 0.01;
const RENORMALIZE_EVERY: u64 = 50;
const AR_BOUND: f64 = 0.95;
const MA_BOUND: f64 = 0.5;

/// ARMA(5,3) model over the observed health scores. Provides the temporal
/// prior that anchors the ensemble while it is still inexperienced.
pub struct ArmaForecaster {
    ar: [f64; AR_ORDER],
    ma: [f64; MA_ORDER],
    values: VecDeque<f64>,
    residuals: VecDeque<f64>,
    last_forecast: f64,
    updates: u64,
}

impl Default for ArmaForecaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ArmaForecaster {
    pub fn new() -> Self {
        Self {
            // Damped recency-weighted prior; sums stay inside the
            // renormalization bounds.
            ar: [0.5, 0.2, 0.1, 0.1, 0.05],
            ma: [0.0; MA_ORDER],
            values: VecDeque::with_capacity(AR_ORDER),
            residuals: VecDeque::with_capacity(MA_ORDER),
            last_forecast: 0.5,
            updates: 0,
        }
    }

    /// One-step-ahead forecast in [0, 1]; the neutral prior 0.5 before any
    /// observation has arrived.
    pub fn forecast(&self) -> f64 {
        if self.values.is_empty() {
            return 0.5;
        }

        let mut forecast = 0.0;
        for (i, value) in self.values.iter().rev().enumerate().take(AR_ORDER) {
            forecast += self.ar[i] * value;
        }
        for (j, residual) in self.residuals.iter().rev().enumerate().take(MA_ORDER) {
            forecast += self.ma[j] * residual;
        }

        forecast.clamp(0.0, 1.0)
    }

    /// Absorb one observation: single-step gradient update of the
    /// coefficients against the forecast residual, then shift the lag queues.
    pub fn update(&mut self, observed: f64) {
        let predicted = self.forecast();
        let residual = observed - predicted;
        self.last_forecast = predicted;

        for (i, value) in self.values.iter().rev().enumerate().take(AR_ORDER) {
            self.ar[i] += LEARNING_RATE * residual * value;
        }
        for (j, past_residual) in self.residuals.iter().rev().enumerate().take(MA_ORDER) {
            self.ma[j] += LEARNING_RATE * residual * past_residual;
        }

        if self.values.len() >= AR_ORDER {
            self.values.pop_front();
        }
        self.values.push_back(observed);

        if self.residuals.len() >= MA_ORDER {
            self.residuals.pop_front();
        }
        self.residuals.push_back(residual);

        self.updates += 1;
        if self.updates % RENORMALIZE_EVERY == 0 {
            self.renormalize();
        }
    }

    /// The forecast that preceded the most recent observation
    pub fn last_forecast(&self) -> f64 {
        self.last_forecast
    }

    pub fn update_count(&self) -> u64 {
        self.updates
    }

    /// Keep the model stable: rescale when coefficient mass drifts past the
    /// stationarity bounds.
    fn renormalize(&mut self) {
        let ar_mass: f64 = self.ar.iter().map(|a| a.abs()).sum();
        if ar_mass > AR_BOUND {
            let scale = AR_BOUND / ar_mass;
            for a in self.ar.iter_mut() {
                *a *= scale;
            }
        }

        let ma_mass: f64 = self.ma.iter().map(|b| b.abs()).sum();
        if ma_mass > MA_BOUND {
            let scale = MA_BOUND / ma_mass;
            for b in self.ma.iter_mut() {
                *b *= scale;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neutral_prior_before_any_observation() {
        let forecaster = ArmaForecaster::new();
        assert_eq!(forecaster.forecast(), 0.5);
    }

    #[test]
    fn test_forecast_tracks_steady_signal() {
        let mut forecaster = ArmaForecaster::new();
        for _ in 0..100 {
            forecaster.update(0.8);
        }
        assert!((forecaster.forecast() - 0.8).abs() < 0.1);
    }

    #[test]
    fn test_forecast_clipped_to_unit_interval() {
        let mut forecaster = ArmaForecaster::new();
        for _ in 0..200 {
            forecaster.update(1.0);
        }
        let forecast = forecaster.forecast();
        assert!((0.0..=1.0).contains(&forecast));

        let mut falling = ArmaForecaster::new();
        for _ in 0..200 {
            falling.update(0.0);
        }
        assert!((0.0..=1.0).contains(&falling.forecast()));
    }

    #[test]
    fn test_coefficients_bounded_after_renormalization() {
        let mut forecaster = ArmaForecaster::new();
        // Alternating extremes push the coefficients hard
        for i in 0..500 {
            forecaster.update(if i % 2 == 0 { 1.0 } else { 0.0 });
        }

        let ar_mass: f64 = forecaster.ar.iter().map(|a| a.abs()).sum();
        let ma_mass: f64 = forecaster.ma.iter().map(|b| b.abs()).sum();
        assert!(ar_mass <= AR_BOUND + 1e-9);
        assert!(ma_mass <= MA_BOUND + 1e-9);
    }

    #[test]
    fn test_lag_queues_are_bounded() {
        let mut forecaster = ArmaForecaster::new();
        for _ in 0..100 {
            forecaster.update(0.5);
        }
        assert!(forecaster.values.len() <= AR_ORDER);
        assert!(forecaster.residuals.len() <= MA_ORDER);
    }

    #[test]
    fn test_last_forecast_is_pre_observation() {
        let mut forecaster = ArmaForecaster::new();
        forecaster.update(0.9);
        // The first observation was forecast against the neutral prior
        assert_eq!(forecaster.last_forecast(), 0.5);
    }
}
