//! Server statistics.
//!
//! Lock-free counters updated from the multiplexer and worker threads;
//! snapshots are taken for reporting.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Shared counters for one server instance.
#[derive(Debug)]
pub struct ServerStats {
    connections_accepted: AtomicU64,
    connections_active: AtomicU64,
    requests_enqueued: AtomicU64,
    requests_dropped: AtomicU64,
    requests_completed: AtomicU64,
    total_latency_us: AtomicU64,
    write_failures: AtomicU64,
    started_at: DateTime<Utc>,
    start_time: Instant,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub requests_enqueued: u64,
    pub requests_dropped: u64,
    pub requests_completed: u64,
    pub write_failures: u64,
    /// Mean pipeline latency in microseconds
    pub average_latency_us: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            requests_enqueued: AtomicU64::new(0),
            requests_dropped: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            started_at: Utc::now(),
            start_time: Instant::now(),
        }
    }

    #[inline]
    pub fn record_accept(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_close(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_enqueued(&self) {
        self.requests_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped(&self) {
        self.requests_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_completed(&self, latency: Duration) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero the request counters. Connection gauges are left alone.
    pub fn reset(&self) {
        self.requests_enqueued.store(0, Ordering::Relaxed);
        self.requests_dropped.store(0, Ordering::Relaxed);
        self.requests_completed.store(0, Ordering::Relaxed);
        self.total_latency_us.store(0, Ordering::Relaxed);
        self.write_failures.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let completed = self.requests_completed.load(Ordering::Relaxed);
        let latency = self.total_latency_us.load(Ordering::Relaxed);

        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            requests_enqueued: self.requests_enqueued.load(Ordering::Relaxed),
            requests_dropped: self.requests_dropped.load(Ordering::Relaxed),
            requests_completed: completed,
            write_failures: self.write_failures.load(Ordering::Relaxed),
            average_latency_us: if completed > 0 { latency / completed } else { 0 },
            started_at: self.started_at,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}
