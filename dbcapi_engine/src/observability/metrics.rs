use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

lazy_static::lazy_static! {
    static ref GLOBAL_METRICS: Arc<EngineMetrics> = Arc::new(EngineMetrics::new());
}

pub fn global_metrics() -> Arc<EngineMetrics> {
    GLOBAL_METRICS.clone()
}

/// Counters for dispatched work and connection churn.
pub struct EngineMetrics {
    inline_tasks: AtomicU64,
    pooled_tasks: AtomicU64,
    completed_tasks: AtomicU64,
    failed_tasks: AtomicU64,
    rows_fetched: AtomicU64,
    work_micros: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    start_time: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub inline_tasks: u64,
    pub pooled_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub rows_fetched: u64,
    pub work_time_us: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub uptime_ms: u64,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn average_work_time(&self) -> Duration {
        if self.completed_tasks == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.work_time_us / self.completed_tasks)
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            inline_tasks: AtomicU64::new(0),
            pooled_tasks: AtomicU64::new(0),
            completed_tasks: AtomicU64::new(0),
            failed_tasks: AtomicU64::new(0),
            rows_fetched: AtomicU64::new(0),
            work_micros: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_submit(&self, pooled: bool) {
        let counter = if pooled {
            &self.pooled_tasks
        } else {
            &self.inline_tasks
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self, success: bool, elapsed: Duration) {
        self.completed_tasks.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_tasks.fetch_add(1, Ordering::Relaxed);
        }
        self.work_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_rows(&self, rows: usize) {
        self.rows_fetched.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            inline_tasks: self.inline_tasks.load(Ordering::Relaxed),
            pooled_tasks: self.pooled_tasks.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            rows_fetched: self.rows_fetched.load(Ordering::Relaxed),
            work_time_us: self.work_micros.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            uptime_ms: self.start_time.elapsed().as_millis() as u64,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}
