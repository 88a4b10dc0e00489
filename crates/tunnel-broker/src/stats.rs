//! Broker counters exposed on `/stats`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Broker-wide counters
#[derive(Debug)]
pub struct BrokerStats {
    started_at: Instant,

    // Dispatch outcomes
    pub requests_total: AtomicU64,
    pub requests_success: AtomicU64,
    pub requests_worker_failed: AtomicU64,
    pub requests_no_worker: AtomicU64,
    pub requests_timeout: AtomicU64,
    pub requests_disconnected: AtomicU64,
    pub requests_overloaded: AtomicU64,

    // Tunnel lifecycle
    pub connections_total: AtomicU64,
    pub registrations_total: AtomicU64,
    pub protocol_violations: AtomicU64,
    pub evictions_total: AtomicU64,

    // Latency tracking (simplified)
    pub total_latency_ms: AtomicU64,
}

impl Default for BrokerStats {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            requests_total: AtomicU64::new(0),
            requests_success: AtomicU64::new(0),
            requests_worker_failed: AtomicU64::new(0),
            requests_no_worker: AtomicU64::new(0),
            requests_timeout: AtomicU64::new(0),
            requests_disconnected: AtomicU64::new(0),
            requests_overloaded: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            registrations_total: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
            evictions_total: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
        }
    }
}

impl BrokerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registration(&self) {
        self.registrations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a dispatched request by its outcome code
    pub fn record_dispatch(&self, outcome: DispatchOutcome, latency_ms: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            DispatchOutcome::Success => &self.requests_success,
            DispatchOutcome::WorkerFailed => &self.requests_worker_failed,
            DispatchOutcome::NoWorker => &self.requests_no_worker,
            DispatchOutcome::Timeout => &self.requests_timeout,
            DispatchOutcome::Disconnected => &self.requests_disconnected,
            DispatchOutcome::Overloaded => &self.requests_overloaded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Percentage of requests answered by a worker
    pub fn success_rate(&self) -> f64 {
        let total = self.requests_total.load(Ordering::Relaxed);
        let success = self.requests_success.load(Ordering::Relaxed);
        success as f64 / total.max(1) as f64 * 100.0
    }

    pub fn average_latency_ms(&self) -> u64 {
        let total = self.requests_total.load(Ordering::Relaxed);
        self.total_latency_ms.load(Ordering::Relaxed) / total.max(1)
    }

    /// Export as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "requests": {
                "total": self.requests_total.load(Ordering::Relaxed),
                "success": self.requests_success.load(Ordering::Relaxed),
                "worker_failed": self.requests_worker_failed.load(Ordering::Relaxed),
                "no_worker_available": self.requests_no_worker.load(Ordering::Relaxed),
                "timeout": self.requests_timeout.load(Ordering::Relaxed),
                "worker_disconnected": self.requests_disconnected.load(Ordering::Relaxed),
                "overloaded": self.requests_overloaded.load(Ordering::Relaxed),
                "success_rate": self.success_rate(),
                "avg_latency_ms": self.average_latency_ms(),
            },
            "tunnels": {
                "connections": self.connections_total.load(Ordering::Relaxed),
                "registrations": self.registrations_total.load(Ordering::Relaxed),
                "protocol_violations": self.protocol_violations.load(Ordering::Relaxed),
                "evictions": self.evictions_total.load(Ordering::Relaxed),
            },
            "uptime_seconds": self.uptime_secs(),
        })
    }
}

/// Dispatch outcome buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success,
    WorkerFailed,
    NoWorker,
    Timeout,
    Disconnected,
    Overloaded,
}
