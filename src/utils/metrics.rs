use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Latency samples kept per series; older samples are dropped first
pub const MAX_LATENCY_SAMPLES: usize = 1024;

/// Fixed-capacity window of the most recent millisecond samples
#[derive(Debug, Default)]
struct Samples {
    values: VecDeque<u64>,
}

impl Samples {
    fn push(&mut self, value: u64) {
        if self.values.len() == MAX_LATENCY_SAMPLES {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn avg(&self) -> u64 {
        if self.values.is_empty() {
            return 0;
        }
        self.values.iter().sum::<u64>() / self.values.len() as u64
    }

    fn percentile(&self, p: f64) -> u64 {
        if self.values.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.values.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 - 1.0) * p) as usize;
        sorted[idx]
    }
}

/// Global metrics collector for the application.
///
/// Tracks model host usage, retries, cache performance, pool admissions,
/// job outcomes and pipeline durations. Cheap to clone and share.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Model host calls
    upstream_calls_total: AtomicUsize,
    upstream_calls_failed: AtomicUsize,
    upstream_latency_ms: RwLock<Samples>,
    retries_total: AtomicUsize,

    // Cache
    cache_hits: AtomicUsize,
    cache_misses: AtomicUsize,
    cache_corruptions: AtomicUsize,
    cache_size: AtomicUsize,

    // Pools: admissions and cumulative queue wait per class
    pool_admissions: DashMap<String, AtomicUsize>,
    pool_wait_ms: DashMap<String, AtomicU64>,

    // Terminal job states (succeeded, failed, canceled, timed_out)
    job_outcomes: DashMap<String, AtomicUsize>,

    // Pipeline durations keyed by pipeline name
    pipeline_duration_ms: DashMap<String, RwLock<Samples>>,

    // Per-endpoint request counters
    endpoint_counters: DashMap<String, AtomicUsize>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                upstream_calls_total: AtomicUsize::new(0),
                upstream_calls_failed: AtomicUsize::new(0),
                upstream_latency_ms: RwLock::new(Samples::default()),
                retries_total: AtomicUsize::new(0),
                cache_hits: AtomicUsize::new(0),
                cache_misses: AtomicUsize::new(0),
                cache_corruptions: AtomicUsize::new(0),
                cache_size: AtomicUsize::new(0),
                pool_admissions: DashMap::new(),
                pool_wait_ms: DashMap::new(),
                job_outcomes: DashMap::new(),
                pipeline_duration_ms: DashMap::new(),
                endpoint_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    // Model host
    pub fn record_upstream_call(&self, success: bool, duration: Duration) {
        self.inner.upstream_calls_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.inner.upstream_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.upstream_latency_ms.write().push(duration.as_millis() as u64);
    }

    pub fn record_retry(&self) {
        self.inner.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    // Cache
    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_corruption(&self) {
        self.inner.cache_corruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_cache_size(&self, size: usize) {
        self.inner.cache_size.store(size, Ordering::Relaxed);
    }

    // Pools
    pub fn record_pool_admission(&self, class: &str, wait: Duration) {
        self.inner.pool_admissions
            .entry(class.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
        self.inner.pool_wait_ms
            .entry(class.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
    }

    // Jobs
    pub fn record_job_outcome(&self, outcome: &str) {
        self.inner.job_outcomes
            .entry(outcome.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    // Pipelines
    pub fn record_pipeline_duration(&self, pipeline: &str, duration: Duration) {
        self.inner.pipeline_duration_ms
            .entry(pipeline.to_string())
            .or_insert_with(|| RwLock::new(Samples::default()))
            .write()
            .push(duration.as_millis() as u64);
    }

    // Endpoint Metrics
    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner.endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    // Get snapshot for reporting
    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.inner.upstream_latency_ms.read();
        let upstream_latency_avg_ms = latency.avg();
        let upstream_latency_p50_ms = latency.percentile(0.5);
        let upstream_latency_p95_ms = latency.percentile(0.95);
        drop(latency);

        let cache_hits = self.inner.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.inner.cache_misses.load(Ordering::Relaxed);
        let cache_total = cache_hits + cache_misses;
        let cache_hit_rate = if cache_total > 0 {
            cache_hits as f64 / cache_total as f64
        } else {
            0.0
        };

        let pool_admissions = counters(&self.inner.pool_admissions);
        let pool_wait_ms = self.inner.pool_wait_ms
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        let pipeline_avg_ms = self.inner.pipeline_duration_ms
            .iter()
            .map(|e| (e.key().clone(), e.value().read().avg()))
            .collect();

        MetricsSnapshot {
            upstream_calls_total: self.inner.upstream_calls_total.load(Ordering::Relaxed),
            upstream_calls_failed: self.inner.upstream_calls_failed.load(Ordering::Relaxed),
            upstream_latency_avg_ms,
            upstream_latency_p50_ms,
            upstream_latency_p95_ms,
            retries_total: self.inner.retries_total.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            cache_corruptions: self.inner.cache_corruptions.load(Ordering::Relaxed),
            cache_hit_rate,
            cache_size: self.inner.cache_size.load(Ordering::Relaxed),
            pool_admissions,
            pool_wait_ms,
            job_outcomes: counters(&self.inner.job_outcomes),
            pipeline_avg_ms,
            endpoint_requests: counters(&self.inner.endpoint_counters),
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = format!(
            r#"# HELP upstream_calls_total Total number of model host calls made
# TYPE upstream_calls_total counter
upstream_calls_total {{}} {}

# HELP upstream_calls_failed Number of failed model host calls
# TYPE upstream_calls_failed counter
upstream_calls_failed {{}} {}

# HELP upstream_latency_avg_ms Average model host latency in milliseconds
# TYPE upstream_latency_avg_ms gauge
upstream_latency_avg_ms {{}} {}

# HELP retries_total Retries performed by the retry executor
# TYPE retries_total counter
retries_total {{}} {}

# HELP cache_hit_rate Cache hit rate (0.0 to 1.0)
# TYPE cache_hit_rate gauge
cache_hit_rate {{}} {}

# HELP cache_size Current cache size
# TYPE cache_size gauge
cache_size {{}} {}

# HELP cache_corruptions_total Cache entries dropped because of an unexpected shape
# TYPE cache_corruptions_total counter
cache_corruptions_total {{}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}
"#,
            snapshot.upstream_calls_total,
            snapshot.upstream_calls_failed,
            snapshot.upstream_latency_avg_ms,
            snapshot.retries_total,
            snapshot.cache_hit_rate,
            snapshot.cache_size,
            snapshot.cache_corruptions,
            snapshot.uptime_seconds,
        );

        labelled(&mut out, "pool_admissions_total", "counter", "Tasks admitted per workload class", "class", &snapshot.pool_admissions);
        labelled(&mut out, "pool_wait_ms_total", "counter", "Cumulative queue wait per workload class", "class", &snapshot.pool_wait_ms);
        labelled(&mut out, "job_outcomes_total", "counter", "External jobs by terminal state", "state", &snapshot.job_outcomes);
        labelled(&mut out, "pipeline_avg_duration_ms", "gauge", "Average pipeline duration in milliseconds", "pipeline", &snapshot.pipeline_avg_ms);
        labelled(&mut out, "endpoint_requests_total", "counter", "Requests per endpoint", "endpoint", &snapshot.endpoint_requests);
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub upstream_calls_total: usize,
    pub upstream_calls_failed: usize,
    pub upstream_latency_avg_ms: u64,
    pub upstream_latency_p50_ms: u64,
    pub upstream_latency_p95_ms: u64,
    pub retries_total: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub cache_corruptions: usize,
    pub cache_hit_rate: f64,
    pub cache_size: usize,
    pub pool_admissions: BTreeMap<String, u64>,
    pub pool_wait_ms: BTreeMap<String, u64>,
    pub job_outcomes: BTreeMap<String, u64>,
    pub pipeline_avg_ms: BTreeMap<String, u64>,
    pub endpoint_requests: BTreeMap<String, u64>,
    pub uptime_seconds: u64,
}

fn counters(map: &DashMap<String, AtomicUsize>) -> BTreeMap<String, u64> {
    map.iter()
        .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed) as u64))
        .collect()
}

fn labelled(out: &mut String, name: &str, kind: &str, help: &str, label: &str, values: &BTreeMap<String, u64>) {
    if values.is_empty() {
        return;
    }
    let _ = write!(out, "\n# HELP {} {}\n# TYPE {} {}\n", name, help, name, kind);
    for (key, value) in values {
        let _ = writeln!(out, "{}{{{}=\"{}\"}} {}", name, label, key, value);
    }
}
