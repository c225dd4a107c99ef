// mlbreaker: Per-call telemetry, the bounded metric window, and aggregate snapshots

use chrono::{Local, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default bound on the metric window
pub const DEFAULT_WINDOW_CAPACITY: usize = 1_000;

/// One immutable observation of a protected call
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Wall-clock milliseconds at completion
    pub timestamp_ms: u64,
    /// Elapsed operation latency, from a monotonic source
    pub latency_us: u64,
    pub success: bool,
    /// Concurrent calls in flight at completion time
    pub in_flight: u32,
    /// 1-minute load average at completion time
    pub system_load: f64,
}

impl MetricRecord {
    /// Build a record stamped with the current wall clock
    pub fn new(latency: Duration, success: bool, in_flight: u32, system_load: f64) -> Self {
        Self {
            timestamp_ms: Utc::now().timestamp_millis() as u64,
            latency_us: latency.as_micros() as u64,
            success,
            in_flight,
            system_load,
        }
    }

    /// Latency in milliseconds
    pub fn latency_ms(&self) -> f64 {
        self.latency_us as f64 / 1_000.0
    }
}

/// Bounded FIFO of recent records.
///
/// Many call threads record concurrently; one aggregate reader per decision.
/// On overflow the oldest record is dropped silently. The aggregate path
/// copies under the lock in a single pass so writers are never blocked for
/// longer than one snapshot sweep.
pub struct MetricWindow {
    records: Mutex<VecDeque<MetricRecord>>,
    capacity: usize,
}

impl Default for MetricWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

impl MetricWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Append a record, evicting the oldest on overflow
    pub fn record(&self, record: MetricRecord) {
        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Immutable aggregate view over a point-in-time copy of the window
    pub fn snapshot(&self) -> MetricSnapshot {
        let mut latencies_ms: Vec<f64>;
        let mut failures = 0u64;
        let mut in_flight_sum = 0.0f64;
        let mut load_sum = 0.0f64;
        let count;

        {
            let records = self.records.lock();
            count = records.len();
            latencies_ms = Vec::with_capacity(count);
            for record in records.iter() {
                latencies_ms.push(record.latency_ms());
                if !record.success {
                    failures += 1;
                }
                in_flight_sum += record.in_flight as f64;
                load_sum += record.system_load;
            }
        }

        if count == 0 {
            return MetricSnapshot::empty();
        }

        latencies_ms.sort_by(|a, b| a.total_cmp(b));
        // ceil(0.95 * N)-th order statistic, 1-based
        let rank = ((0.95 * count as f64).ceil() as usize).clamp(1, count);
        let p95_latency = latencies_ms[rank - 1];

        let error_rate = failures as f64 / count as f64;

        MetricSnapshot {
            p95_latency,
            error_rate,
            success_rate: 1.0 - error_rate,
            concurrency: in_flight_sum / count as f64,
            system_load: load_sum / count as f64,
            time_of_day: current_time_of_day(),
            sample_count: count,
        }
    }
}

/// Read-only aggregates over one instant of the window.
///
/// All derived scalars of an empty window are 0; `time_of_day` is
/// re-evaluated per snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// 95th percentile latency in milliseconds
    pub p95_latency: f64,
    pub error_rate: f64,
    pub success_rate: f64,
    /// Mean in-flight calls
    pub concurrency: f64,
    /// Mean 1-minute load average
    pub system_load: f64,
    /// Current hour divided by 24
    pub time_of_day: f64,
    pub sample_count: usize,
}

impl MetricSnapshot {
    /// The substitute view used when no records exist
    pub fn empty() -> Self {
        Self {
            p95_latency: 0.0,
            error_rate: 0.0,
            success_rate: 1.0,
            concurrency: 0.0,
            system_load: 0.0,
            time_of_day: current_time_of_day(),
            sample_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }
}

fn current_time_of_day() -> f64 {
    Local::now().hour() as f64 / 24.0
}

/// Cached 1-minute load-average sampler.
///
/// The OS query is not free, so samples are reused for up to a second; call
/// paths only pay for a refresh when the cache has aged out.
pub struct SystemLoadProbe {
    cached: Mutex<(Instant, f64)>,
    refresh_after: Duration,
}

impl Default for SystemLoadProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl SystemLoadProbe {
    pub fn new(refresh_after: Duration) -> Self {
        Self {
            cached: Mutex::new((Instant::now(), Self::read_load_average())),
            refresh_after,
        }
    }

    /// Current 1-minute load average, refreshed at most once per interval
    pub fn sample(&self) -> f64 {
        let mut cached = self.cached.lock();
        if cached.0.elapsed() >= self.refresh_after {
            *cached = (Instant::now(), Self::read_load_average());
        }
        cached.1
    }

    fn read_load_average() -> f64 {
        sysinfo::System::load_average().one
    }
}
