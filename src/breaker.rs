// mlbreaker: ML breaker orchestrator
//
// The public entry point. Wraps a caller's operation, records timing into the
// metric window, drives the learning stack, gates admission through the state
// machine, and degrades safely when any learning component misbehaves.

use crate::adaptive::AdaptiveConfigManager;
use crate::circuit::{CircuitBreaker, CircuitState};
use crate::config::{BreakerConfig, BreakerSettings};
use crate::error::BreakerError;
use crate::metrics::{MetricRecord, MetricSnapshot, MetricWindow, SystemLoadProbe};
use crate::monitor::{PerformanceMonitor, TelemetryGauges};
use crate::persistence::{MetricSink, ModelStore};
use crate::predictor::{
    AdaptivePredictor, SafeDefaultsPredictor, ThresholdPredictor, TickOutcome,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Operations between throughput log lines
const THROUGHPUT_LOG_EVERY: u64 = 1_000;

/// How far back the warm start asks the metric sink for history
const WARM_START_LOOKBACK: Duration = Duration::from_secs(24 * 3_600);

/// The learning stack owned by one orchestrator. Mutated only under the
/// orchestrator's lock on the per-call path; never shared across breakers.
struct MlStack {
    predictor: Box<dyn AdaptivePredictor>,
    manager: AdaptiveConfigManager,
    /// Cleared when initialization fell back to safe defaults
    reconfig_enabled: bool,
    last_prediction: f64,
}

/// Adaptive circuit breaker protecting one downstream dependency.
///
/// Build one per protected service with [`MlCircuitBreaker::builder`]; the
/// learning stack is per-instance state and must not be shared. All ML
/// failures are contained: the call path always admits or rejects, runs the
/// operation, and records exactly one metric per completed call.
pub struct MlCircuitBreaker {
    name: String,
    settings: BreakerSettings,
    window: MetricWindow,
    breaker: Mutex<CircuitBreaker>,
    ml: Mutex<MlStack>,
    monitor: PerformanceMonitor,
    metric_sink: Option<Arc<dyn MetricSink>>,
    model_store: Option<Arc<dyn ModelStore>>,
    load_probe: SystemLoadProbe,
    operations: AtomicU64,
    in_flight: AtomicU32,
    last_reconfig: Mutex<Option<Instant>>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MlCircuitBreaker {
    pub fn builder(name: impl Into<String>) -> MlBreakerBuilder {
        MlBreakerBuilder::new(name)
    }

    /// Run `op` under breaker protection.
    ///
    /// Returns the operation's value, its error wrapped as
    /// [`BreakerError::Operation`], or [`BreakerError::CircuitOpen`] when
    /// admission is denied (in which case `op` was never invoked and no
    /// metric record is written).
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let snapshot = self.window.snapshot();

        let operations = self.operations.fetch_add(1, Ordering::Relaxed) + 1;
        if operations % THROUGHPUT_LOG_EVERY == 0 {
            tracing::info!(
                breaker = %self.name,
                operations,
                window = snapshot.sample_count,
                error_rate = snapshot.error_rate,
                "throughput checkpoint"
            );
        }

        let predicted = if self.settings.ml.enabled {
            self.decision_tick(&snapshot)
        } else {
            0.5
        };

        {
            let mut breaker = self.breaker.lock();
            if !breaker.try_acquire(Instant::now()) {
                return Err(BreakerError::CircuitOpen {
                    name: self.name.clone(),
                });
            }
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = CallGuard {
            breaker: self,
            predicted,
            started: Instant::now(),
            armed: true,
        };

        let result = op().await;
        guard.complete(result.is_ok());

        result.map_err(BreakerError::Operation)
    }

    /// Write the one metric record an admitted call owes, run breaker
    /// transitions, and settle accuracy bookkeeping.
    fn finish_call(&self, latency: Duration, success: bool, predicted: f64) {
        // Sampled while this call is still counted in flight
        let record = MetricRecord::new(
            latency,
            success,
            self.in_flight.load(Ordering::SeqCst),
            self.load_probe.sample(),
        );
        self.window.record(record);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.breaker.lock().on_result(success, Instant::now());
        self.monitor
            .record_prediction(predicted, if success { 1.0 } else { 0.0 });
    }

    /// One pass through the ML update block. Never propagates: a failing
    /// step is logged and the previous knobs stand.
    fn decision_tick(&self, snapshot: &MetricSnapshot) -> f64 {
        let mut ml = self.ml.lock();
        self.monitor.record_features(snapshot);

        let outcome = match ml.predictor.tick(snapshot) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    breaker = %self.name,
                    step = "predictor",
                    error = %e,
                    "ML step failed; keeping previous knobs"
                );
                return ml.last_prediction;
            }
        };
        ml.last_prediction = outcome.prediction;

        if outcome.anomalous {
            tracing::warn!(
                breaker = %self.name,
                score = outcome.anomaly_score,
                "anomalous regime; reconfiguration suppressed this tick"
            );
        } else if ml.reconfig_enabled {
            self.replace_config_if_needed(&ml.manager, &outcome, snapshot);
        }

        outcome.prediction
    }

    /// Swap in a new configuration when the change is significant, preserving
    /// breaker state. Rate-limited; skipped ticks leave the knobs untouched.
    fn replace_config_if_needed(
        &self,
        manager: &AdaptiveConfigManager,
        outcome: &TickOutcome,
        snapshot: &MetricSnapshot,
    ) {
        {
            let last = self.last_reconfig.lock();
            if let Some(at) = *last {
                let min_interval =
                    Duration::from_millis(self.settings.ml.reconfig_min_interval_ms);
                if at.elapsed() < min_interval {
                    return;
                }
            }
        }

        let candidate = manager.updated_config(outcome);

        let previous_state;
        {
            let mut breaker = self.breaker.lock();
            if !manager.is_significant(&candidate, breaker.config()) {
                return;
            }
            previous_state = breaker.state();
            *breaker = breaker.rebuild(candidate.clone());
        }

        *self.last_reconfig.lock() = Some(Instant::now());
        self.monitor
            .record_config_change(snapshot.error_rate, &candidate);

        tracing::info!(
            breaker = %self.name,
            state = ?previous_state,
            window_size = candidate.window_size,
            threshold = candidate.failure_rate_threshold,
            wait_ms = candidate.open_state_wait.as_millis() as u64,
            "breaker configuration replaced"
        );
    }

    /// Best-effort restoration of model and metric history
    async fn warm_start(&self) {
        if let Some(store) = &self.model_store {
            match store.load(&self.name).await {
                Ok(Some(bytes)) => {
                    let restore = self.ml.lock().predictor.restore_ensemble(&bytes);
                    match restore {
                        Ok(()) => tracing::info!(
                            breaker = %self.name,
                            bytes = bytes.len(),
                            "restored ensemble model"
                        ),
                        Err(e) => tracing::warn!(
                            breaker = %self.name,
                            error = %e,
                            "stored model rejected; starting with a fresh ensemble"
                        ),
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    breaker = %self.name,
                    error = %e,
                    "model load failed; starting with a fresh ensemble"
                ),
            }
        }

        if let Some(sink) = &self.metric_sink {
            match sink.load_historical(&self.name, WARM_START_LOOKBACK).await {
                Ok(history) if !history.is_empty() => {
                    let replayed = history.len();
                    let mut ml = self.ml.lock();
                    for snapshot in &history {
                        if let Err(e) = ml.predictor.tick(snapshot) {
                            tracing::warn!(
                                breaker = %self.name,
                                error = %e,
                                "warm-start replay stopped early"
                            );
                            break;
                        }
                    }
                    drop(ml);
                    tracing::info!(
                        breaker = %self.name,
                        snapshots = replayed,
                        "warm-start replay complete"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    breaker = %self.name,
                    error = %e,
                    "historical metrics unavailable; starting cold"
                ),
            }
        }
    }

    /// Emit the periodic report and flush the current snapshot to the sink
    async fn emit_report(&self) {
        let snapshot = self.window.snapshot();
        self.monitor.observe_post_change(snapshot.error_rate);
        tracing::info!(
            breaker = %self.name,
            report = %self.monitor.report(),
            "performance report"
        );
        self.monitor.emit(&self.name);

        if let Some(sink) = &self.metric_sink {
            if let Err(e) = sink.store(&snapshot, &self.name).await {
                tracing::warn!(breaker = %self.name, error = %e, "metric flush failed");
            }
        }
    }

    /// Stop the background worker, flush a final report, persist the model,
    /// and shut the metric sink down. Call once at the end of life.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.emit_report().await;

        if let Some(store) = &self.model_store {
            let bytes = self.ml.lock().predictor.ensemble_bytes();
            if let Some(bytes) = bytes {
                if let Err(e) = store.save(&bytes, &self.name).await {
                    tracing::warn!(
                        breaker = %self.name,
                        error = %e,
                        "model save failed on shutdown"
                    );
                }
            }
        }

        if let Some(sink) = &self.metric_sink {
            if let Err(e) = sink.shutdown().await {
                tracing::warn!(
                    breaker = %self.name,
                    error = %e,
                    "metric sink shutdown failed"
                );
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.breaker.lock().state()
    }

    pub fn current_config(&self) -> BreakerConfig {
        self.breaker.lock().config().clone()
    }

    /// Records currently held in the metric window
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn window_snapshot(&self) -> MetricSnapshot {
        self.window.snapshot()
    }

    /// The composite health prediction from the most recent ML tick
    pub fn last_prediction(&self) -> f64 {
        self.ml.lock().last_prediction
    }

    /// False when initialization fell back to safe defaults or the settings
    /// disable ML entirely
    pub fn adaptive(&self) -> bool {
        self.settings.ml.enabled && self.ml.lock().reconfig_enabled
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn gauges(&self) -> TelemetryGauges {
        self.monitor.gauges()
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }
}

/// Settles an admitted call no matter how it ends. Dropping the `execute`
/// future between admission and completion is a cancellation: the guard
/// records a failure with the latency measured up to the drop, so half-open
/// trial accounting and the in-flight gauge stay consistent.
struct CallGuard<'a> {
    breaker: &'a MlCircuitBreaker,
    predicted: f64,
    started: Instant,
    armed: bool,
}

impl CallGuard<'_> {
    fn complete(mut self, success: bool) {
        self.armed = false;
        self.breaker
            .finish_call(self.started.elapsed(), success, self.predicted);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker
                .finish_call(self.started.elapsed(), false, self.predicted);
        }
    }
}

/// Builder for [`MlCircuitBreaker`]. Collaborators are explicit and
/// optional: absent means no-op.
pub struct MlBreakerBuilder {
    settings: BreakerSettings,
    metric_sink: Option<Arc<dyn MetricSink>>,
    model_store: Option<Arc<dyn ModelStore>>,
    predictor: Option<Box<dyn AdaptivePredictor>>,
}

impl MlBreakerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let mut settings = BreakerSettings::default();
        settings.name = name.into();
        Self {
            settings,
            metric_sink: None,
            model_store: None,
            predictor: None,
        }
    }

    /// Replace the full settings block; the builder's name wins only when the
    /// given settings carry an empty one
    pub fn settings(mut self, mut settings: BreakerSettings) -> Self {
        if settings.name.is_empty() {
            settings.name = self.settings.name;
        }
        self.settings = settings;
        self
    }

    pub fn metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = Some(sink);
        self
    }

    pub fn model_store(mut self, store: Arc<dyn ModelStore>) -> Self {
        self.model_store = Some(store);
        self
    }

    /// Inject a predictor implementation, replacing the built-in stack
    pub fn predictor(mut self, predictor: Box<dyn AdaptivePredictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    /// Build the breaker, warm-start it, and spawn its background worker.
    ///
    /// Never fails: a learning stack that cannot initialize is replaced by
    /// the safe-defaults substitute and reconfiguration is disabled.
    pub async fn build(self) -> Arc<MlCircuitBreaker> {
        let settings = self.settings;
        let name = settings.name.clone();
        let initial_config = settings.initial_config();

        let (predictor, reconfig_enabled): (Box<dyn AdaptivePredictor>, bool) =
            match self.predictor {
                Some(predictor) => (predictor, true),
                None => match ThresholdPredictor::new(settings.ml.training_interval) {
                    Ok(predictor) => (Box::new(predictor), true),
                    Err(e) => {
                        tracing::error!(
                            breaker = %name,
                            error = %e,
                            "learning stack failed to initialize; installing safe defaults \
                             (window=100, threshold=0.5, wait=30s) with reconfiguration disabled"
                        );
                        (Box::new(SafeDefaultsPredictor), false)
                    }
                },
            };

        let manager =
            AdaptiveConfigManager::new(settings.ml.significant_change, initial_config.clone());

        let monitor = PerformanceMonitor::new();
        monitor.record_initial_config(&initial_config);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let breaker = Arc::new(MlCircuitBreaker {
            name,
            window: MetricWindow::default(),
            breaker: Mutex::new(CircuitBreaker::new(initial_config)),
            ml: Mutex::new(MlStack {
                predictor,
                manager,
                reconfig_enabled,
                last_prediction: 0.5,
            }),
            monitor,
            metric_sink: self.metric_sink,
            model_store: self.model_store,
            load_probe: SystemLoadProbe::default(),
            operations: AtomicU64::new(0),
            in_flight: AtomicU32::new(0),
            last_reconfig: Mutex::new(None),
            shutdown_tx,
            worker: Mutex::new(None),
            settings,
        });

        breaker.warm_start().await;

        let handle = tokio::spawn(run_worker(Arc::clone(&breaker), shutdown_rx));
        *breaker.worker.lock() = Some(handle);

        breaker
    }
}

/// The single periodic worker owned by the orchestrator: report emission and
/// best-effort metric flushing. Shutdown is signaled over the watch channel.
async fn run_worker(breaker: Arc<MlCircuitBreaker>, mut shutdown_rx: watch::Receiver<bool>) {
    let period = Duration::from_secs(breaker.settings.ml.report_interval_secs.max(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                breaker.emit_report().await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MlError, MlResult};

    fn settings(name: &str) -> BreakerSettings {
        let mut settings = BreakerSettings::default();
        settings.name = name.to_string();
        settings.ml.report_interval_secs = 3_600;
        settings
    }

    async fn ok_call(breaker: &MlCircuitBreaker) -> Result<u32, BreakerError<&'static str>> {
        breaker.execute(|| async { Ok::<_, &'static str>(7) }).await
    }

    async fn failing_call(breaker: &MlCircuitBreaker) -> Result<u32, BreakerError<&'static str>> {
        breaker.execute(|| async { Err::<u32, _>("downstream failed") }).await
    }

    #[tokio::test]
    async fn test_successful_call_returns_value_and_records() {
        let breaker = MlCircuitBreaker::builder("test").settings(settings("test")).build().await;

        let value = ok_call(&breaker).await.expect("admitted and successful");
        assert_eq!(value, 7);
        assert_eq!(breaker.window_len(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_call_propagates_cause_and_records() {
        let breaker = MlCircuitBreaker::builder("test").settings(settings("test")).build().await;

        let err = failing_call(&breaker).await.expect_err("operation failed");
        assert!(!err.is_open());
        assert_eq!(err.into_operation(), Some("downstream failed"));
        assert_eq!(breaker.window_len(), 1);

        breaker.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_record_per_completed_call() {
        let breaker = MlCircuitBreaker::builder("test").settings(settings("test")).build().await;

        for i in 0..30 {
            if i % 4 == 0 {
                let _ = failing_call(&breaker).await;
            } else {
                let _ = ok_call(&breaker).await;
            }
        }
        assert_eq!(breaker.window_len(), 30);

        breaker.shutdown().await;
    }

    #[tokio::test]
    async fn test_ml_disabled_behaves_classically() {
        let mut s = settings("classic");
        s.ml.enabled = false;
        let breaker = MlCircuitBreaker::builder("classic").settings(s).build().await;

        assert!(!breaker.adaptive());
        for _ in 0..20 {
            ok_call(&breaker).await.expect("admitted");
        }
        assert_eq!(breaker.current_config(), breaker.settings().initial_config());

        breaker.shutdown().await;
    }

    struct FailingPredictor;

    impl AdaptivePredictor for FailingPredictor {
        fn tick(&mut self, _snapshot: &MetricSnapshot) -> MlResult<TickOutcome> {
            Err(MlError::Model("synthetic failure".to_string()))
        }
    }

    #[tokio::test]
    async fn test_predictor_failure_is_contained() {
        let breaker = MlCircuitBreaker::builder("faulty")
            .settings(settings("faulty"))
            .predictor(Box::new(FailingPredictor))
            .build()
            .await;

        let initial = breaker.current_config();
        for _ in 0..100 {
            let value = ok_call(&breaker).await.expect("call path unaffected");
            assert_eq!(value, 7);
        }

        assert_eq!(breaker.window_len(), 100);
        assert_eq!(breaker.current_config(), initial);

        breaker.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_operation_records_failure() {
        let breaker = MlCircuitBreaker::builder("cancelled")
            .settings(settings("cancelled"))
            .build()
            .await;

        let call = breaker.execute(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, &'static str>(1)
        });
        tokio::select! {
            _ = call => panic!("operation should not have completed"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }

        // The cancelled call still produced exactly one (failed) record
        assert_eq!(breaker.window_len(), 1);
        assert_eq!(breaker.window_snapshot().error_rate, 1.0);

        breaker.shutdown().await;
    }

    struct AnomalousPredictor;

    impl AdaptivePredictor for AnomalousPredictor {
        fn tick(&mut self, _snapshot: &MetricSnapshot) -> MlResult<TickOutcome> {
            // Knobs far from the initial config, but flagged anomalous:
            // the orchestrator must not act on them
            Ok(TickOutcome {
                prediction: 0.1,
                anomaly_score: 5.0,
                anomalous: true,
                window_size: 10,
                failure_rate_threshold: 0.2,
                open_state_wait: Duration::from_secs(60),
            })
        }
    }

    #[tokio::test]
    async fn test_anomalous_tick_suppresses_reconfiguration() {
        let breaker = MlCircuitBreaker::builder("anomaly")
            .settings(settings("anomaly"))
            .predictor(Box::new(AnomalousPredictor))
            .build()
            .await;

        let initial = breaker.current_config();
        for _ in 0..20 {
            ok_call(&breaker).await.expect("admitted");
        }

        // Prediction still updated, configuration untouched
        assert_eq!(breaker.last_prediction(), 0.1);
        assert_eq!(breaker.current_config(), initial);

        breaker.shutdown().await;
    }

    struct ShiftingPredictor {
        outcome: TickOutcome,
    }

    impl AdaptivePredictor for ShiftingPredictor {
        fn tick(&mut self, _snapshot: &MetricSnapshot) -> MlResult<TickOutcome> {
            Ok(self.outcome.clone())
        }
    }

    #[tokio::test]
    async fn test_significant_shift_replaces_config_preserving_state() {
        let breaker = MlCircuitBreaker::builder("shifting")
            .settings(settings("shifting"))
            .predictor(Box::new(ShiftingPredictor {
                outcome: TickOutcome {
                    prediction: 0.3,
                    anomaly_score: 0.0,
                    anomalous: false,
                    window_size: 80,
                    failure_rate_threshold: 0.62,
                    open_state_wait: Duration::from_millis(45_000),
                },
            }))
            .build()
            .await;

        ok_call(&breaker).await.expect("admitted");

        let config = breaker.current_config();
        assert_eq!(config.window_size, 80);
        assert!((config.failure_rate_threshold - 0.62).abs() < 1e-12);
        assert_eq!(config.open_state_wait, Duration::from_millis(45_000));
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconfiguration_is_rate_limited() {
        let breaker = MlCircuitBreaker::builder("ratelimited")
            .settings(settings("ratelimited"))
            .predictor(Box::new(ShiftingPredictor {
                outcome: TickOutcome {
                    prediction: 0.3,
                    anomaly_score: 0.0,
                    anomalous: false,
                    window_size: 80,
                    failure_rate_threshold: 0.62,
                    open_state_wait: Duration::from_millis(45_000),
                },
            }))
            .build()
            .await;

        for _ in 0..50 {
            ok_call(&breaker).await.expect("admitted");
        }

        // The first tick replaced the config; every later tick inside the
        // 60s minimum interval was skipped even though the knobs would keep
        // moving relative to the initial config.
        assert_eq!(breaker.monitor().change_history().len(), 1);

        breaker.shutdown().await;
    }
}
