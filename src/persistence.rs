// mlbreaker: Optional collaborator seams for metric and model persistence

use crate::error::{MlError, MlResult};
use crate::metrics::MetricSnapshot;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// One-way sink for aggregate snapshots, plus a best-effort warm-start
/// source. Implementations back this with a file, database or time-series
/// store; the breaker calls it only off the call path and treats every error
/// as a logged no-op.
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn store(&self, snapshot: &MetricSnapshot, breaker_name: &str) -> MlResult<()>;

    /// Historical snapshots for warm start, newest last
    async fn load_historical(
        &self,
        breaker_name: &str,
        lookback: Duration,
    ) -> MlResult<Vec<MetricSnapshot>>;

    /// Called exactly once when the owning breaker shuts down
    async fn shutdown(&self) -> MlResult<()>;
}

/// Opaque model blob storage. The breaker serializes its ensemble into a
/// self-describing byte layout; the store never inspects it.
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn save(&self, model: &[u8], service_name: &str) -> MlResult<()>;

    async fn load(&self, service_name: &str) -> MlResult<Option<Vec<u8>>>;
}

/// In-memory metric sink, for tests and single-process warm-start setups
#[derive(Default)]
pub struct InMemoryMetricSink {
    snapshots: Mutex<Vec<(String, MetricSnapshot)>>,
    shutdowns: Mutex<u32>,
}

impl InMemoryMetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored_count(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn shutdown_count(&self) -> u32 {
        *self.shutdowns.lock()
    }

    /// Pre-seed history so a breaker built over this sink warm-starts
    pub fn seed(&self, breaker_name: &str, snapshot: MetricSnapshot) {
        self.snapshots
            .lock()
            .push((breaker_name.to_string(), snapshot));
    }
}

#[async_trait]
impl MetricSink for InMemoryMetricSink {
    async fn store(&self, snapshot: &MetricSnapshot, breaker_name: &str) -> MlResult<()> {
        self.snapshots
            .lock()
            .push((breaker_name.to_string(), snapshot.clone()));
        Ok(())
    }

    async fn load_historical(
        &self,
        breaker_name: &str,
        _lookback: Duration,
    ) -> MlResult<Vec<MetricSnapshot>> {
        Ok(self
            .snapshots
            .lock()
            .iter()
            .filter(|(name, _)| name == breaker_name)
            .map(|(_, snapshot)| snapshot.clone())
            .collect())
    }

    async fn shutdown(&self) -> MlResult<()> {
        *self.shutdowns.lock() += 1;
        Ok(())
    }
}

/// In-memory model store, for tests and single-process restarts
#[derive(Default)]
pub struct InMemoryModelStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, service_name: &str) -> bool {
        self.blobs.lock().contains_key(service_name)
    }
}

#[async_trait]
impl ModelStore for InMemoryModelStore {
    async fn save(&self, model: &[u8], service_name: &str) -> MlResult<()> {
        if model.is_empty() {
            return Err(MlError::Persistence("Refusing to save empty model".to_string()));
        }
        self.blobs
            .lock()
            .insert(service_name.to_string(), model.to_vec());
        Ok(())
    }

    async fn load(&self, service_name: &str) -> MlResult<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(service_name).cloned())
    }
}
