// mlbreaker: Adaptive ML circuit breaker
// Protects downstream calls with a breaker whose window size, failure-rate
// threshold, and open-state cooldown are rewritten in place by an online
// learning pipeline, while preserving breaker state under load.

// CRITICAL: Enforce proper error handling - no unwrap/expect in production code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod adaptive;
pub mod anomaly;
pub mod breaker;
pub mod circuit;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod features;
pub mod forecaster;
pub mod metrics;
pub mod monitor;
pub mod persistence;
pub mod predictor;

pub use breaker::{MlBreakerBuilder, MlCircuitBreaker};
pub use circuit::CircuitState;
pub use config::{BreakerConfig, BreakerSettings, MlSettings};
pub use error::{BreakerError, MlError, MlResult};
pub use metrics::{MetricRecord, MetricSnapshot, MetricWindow};
pub use monitor::{PerformanceMonitor, TelemetryGauges};
pub use persistence::{MetricSink, ModelStore};
pub use predictor::{AdaptivePredictor, ThresholdPredictor, TickOutcome};
