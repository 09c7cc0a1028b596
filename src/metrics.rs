//! Counters and gauges maintained by the pool and the API client.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Per-client request counters.
#[derive(Debug, Default)]
pub struct ApiMetrics {
    request_count: AtomicU64,
    failure_count: AtomicU64,
    rate_limited_count: AtomicU64,
    retried_count: AtomicU64,
    response_time_total_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ApiMetricsSnapshot {
    pub request_count: u64,
    pub failure_count: u64,
    pub rate_limited_count: u64,
    pub retried_count: u64,
    pub avg_response_time_ms: f64,
}

impl ApiMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, elapsed: Duration) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.response_time_total_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ApiMetricsSnapshot {
        let requests = self.request_count.load(Ordering::Relaxed);
        let total_ms = self.response_time_total_ms.load(Ordering::Relaxed);
        ApiMetricsSnapshot {
            request_count: requests,
            failure_count: self.failure_count.load(Ordering::Relaxed),
            rate_limited_count: self.rate_limited_count.load(Ordering::Relaxed),
            retried_count: self.retried_count.load(Ordering::Relaxed),
            avg_response_time_ms: if requests == 0 {
                0.0
            } else {
                total_ms as f64 / requests as f64
            },
        }
    }
}

/// Pool-wide counters; updated on the scheduler's control path and by the
/// monitors, read by anyone through `snapshot()`.
#[derive(Debug)]
pub struct PoolMetrics {
    started_at_ms: u64,
    active_workers: AtomicUsize,
    queued_tasks: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    peak_concurrency: AtomicUsize,
    peak_memory_bytes: AtomicU64,
    task_duration_total_ms: AtomicU64,
    worker_limit: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolMetricsSnapshot {
    pub active_workers: usize,
    pub queued_tasks: usize,
    pub completed: u64,
    pub failed: u64,
    pub total_processed: u64,
    pub peak_concurrency: usize,
    pub peak_memory_bytes: u64,
    pub avg_task_duration_ms: f64,
    pub tasks_per_minute: f64,
    pub success_rate_percent: f64,
    pub utilization_percent: f64,
    pub uptime_ms: u64,
}

impl PoolMetrics {
    pub fn new(started_at_ms: u64, worker_limit: usize) -> Self {
        Self {
            started_at_ms,
            active_workers: AtomicUsize::new(0),
            queued_tasks: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            peak_concurrency: AtomicUsize::new(0),
            peak_memory_bytes: AtomicU64::new(0),
            task_duration_total_ms: AtomicU64::new(0),
            worker_limit: AtomicUsize::new(worker_limit),
        }
    }

    pub fn set_active(&self, active: usize) {
        self.active_workers.store(active, Ordering::Relaxed);
        self.peak_concurrency.fetch_max(active, Ordering::Relaxed);
    }

    pub fn set_queued(&self, queued: usize) {
        self.queued_tasks.store(queued, Ordering::Relaxed);
    }

    pub fn set_worker_limit(&self, limit: usize) {
        self.worker_limit.store(limit, Ordering::Relaxed);
    }

    pub fn worker_limit(&self) -> usize {
        self.worker_limit.load(Ordering::Relaxed)
    }

    pub fn observe_memory(&self, bytes: u64) {
        self.peak_memory_bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    pub fn record_completion(&self, success: bool, duration: Duration) {
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.task_duration_total_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, now_ms: u64) -> PoolMetricsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total = completed + failed;
        let uptime_ms = now_ms.saturating_sub(self.started_at_ms);
        let active = self.active_workers.load(Ordering::Relaxed);
        let limit = self.worker_limit.load(Ordering::Relaxed).max(1);

        PoolMetricsSnapshot {
            active_workers: active,
            queued_tasks: self.queued_tasks.load(Ordering::Relaxed),
            completed,
            failed,
            total_processed: total,
            peak_concurrency: self.peak_concurrency.load(Ordering::Relaxed),
            peak_memory_bytes: self.peak_memory_bytes.load(Ordering::Relaxed),
            avg_task_duration_ms: if total == 0 {
                0.0
            } else {
                self.task_duration_total_ms.load(Ordering::Relaxed) as f64 / total as f64
            },
            tasks_per_minute: if uptime_ms == 0 {
                0.0
            } else {
                total as f64 * 60_000.0 / uptime_ms as f64
            },
            success_rate_percent: if total == 0 {
                100.0
            } else {
                completed as f64 * 100.0 / total as f64
            },
            utilization_percent: active as f64 * 100.0 / limit as f64,
            uptime_ms,
        }
    }
}
