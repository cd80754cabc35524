use crate::core::config::ConcurrencyConfig;
use crate::core::errors::{ConfigError, JobError};
use crate::core::types::WorkloadClass;
use crate::utils::Metrics;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::debug;

/// The pool for a class was shut down while a task was waiting
#[derive(Debug, Error)]
#[error("{class} pool is closed")]
pub struct AdmissionError {
    pub class: WorkloadClass,
}

impl From<AdmissionError> for JobError {
    fn from(err: AdmissionError) -> Self {
        JobError::Admission {
            class: err.class.as_str(),
        }
    }
}

/// Per-workload-class admission control.
///
/// Each class owns a fair (FIFO) semaphore sized at construction; classes share
/// no capacity, so a saturated `heavy` pool never delays `light` work.
#[derive(Clone)]
pub struct ConcurrencyPools {
    inner: Arc<PoolsInner>,
}

struct PoolsInner {
    light: ClassPool,
    heavy: ClassPool,
    batch: ClassPool,
    metrics: Metrics,
}

struct ClassPool {
    semaphore: Semaphore,
    capacity: usize,
    running: AtomicUsize,
    queued: AtomicUsize,
}

impl ClassPool {
    fn new(capacity: usize) -> Self {
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            running: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        }
    }
}

/// Decrements a gauge when dropped, so cancelled futures still release their slot in the stats
struct GaugeGuard<'a>(&'a AtomicUsize);

impl<'a> GaugeGuard<'a> {
    fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Point-in-time view of one class pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub class: WorkloadClass,
    pub capacity: usize,
    pub running: usize,
    pub queued: usize,
}

impl ConcurrencyPools {
    pub fn new(config: &ConcurrencyConfig, metrics: Metrics) -> Result<Self, ConfigError> {
        for class in WorkloadClass::ALL {
            if config.capacity(class) == 0 {
                return Err(ConfigError::InvalidPoolCapacity { class: class.as_str() });
            }
        }

        Ok(Self {
            inner: Arc::new(PoolsInner {
                light: ClassPool::new(config.light),
                heavy: ClassPool::new(config.heavy),
                batch: ClassPool::new(config.batch),
                metrics,
            }),
        })
    }

    fn pool(&self, class: WorkloadClass) -> &ClassPool {
        match class {
            WorkloadClass::Light => &self.inner.light,
            WorkloadClass::Heavy => &self.inner.heavy,
            WorkloadClass::Batch => &self.inner.batch,
        }
    }

    /// Run `task` once a slot in `class` is free, in arrival order.
    ///
    /// The slot is held until `task` resolves (or the returned future is dropped).
    pub async fn admit<F, T, E>(&self, class: WorkloadClass, task: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<AdmissionError>,
    {
        let pool = self.pool(class);
        let waited_from = Instant::now();

        let permit = {
            let _queued = GaugeGuard::enter(&pool.queued);
            pool.semaphore
                .acquire()
                .await
                .map_err(|_| AdmissionError { class })?
        };

        let wait = waited_from.elapsed();
        self.inner.metrics.record_pool_admission(class.as_str(), wait);
        if !wait.is_zero() {
            debug!("Admitted to {} pool after waiting {:?}", class, wait);
        }

        let _running = GaugeGuard::enter(&pool.running);
        let result = task.await;
        drop(permit);
        result
    }

    pub fn capacity(&self, class: WorkloadClass) -> usize {
        self.pool(class).capacity
    }

    pub fn stats(&self, class: WorkloadClass) -> PoolStats {
        let pool = self.pool(class);
        PoolStats {
            class,
            capacity: pool.capacity,
            running: pool.running.load(Ordering::SeqCst),
            queued: pool.queued.load(Ordering::SeqCst),
        }
    }

    /// Refuse further admissions; waiting tasks fail with [`AdmissionError`]
    pub fn close(&self) {
        for class in WorkloadClass::ALL {
            self.pool(class).semaphore.close();
        }
    }
}
