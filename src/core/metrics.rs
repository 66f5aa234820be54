/// Handler counters and the metrics sink seam
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Receiver for proxy events. Every method defaults to a no-op so exporters
/// only implement what they report.
pub trait MetricsSink: Send + Sync {
    fn connection_opened(&self, _route: &str) {}

    fn connection_closed(&self, _route: &str) {}

    fn connection_rejected(&self, _route: &str) {}

    fn query(&self, _route: &str, _is_write: bool) {}

    fn query_blocked(&self, _route: &str) {}

    fn backend_error(&self, _route: &str, _backend: &str) {}
}

/// Discards every event
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Per-handler counters
#[derive(Debug, Default)]
pub struct HandlerStats {
    active_connections: AtomicI64,
    total_connections: AtomicU64,
    rejected_connections: AtomicU64,
    queries: AtomicU64,
    write_queries: AtomicU64,
    blocked_queries: AtomicU64,
    backend_errors: AtomicU64,
    bytes_client_to_backend: AtomicU64,
    bytes_backend_to_client: AtomicU64,
}

/// Point-in-time copy of [`HandlerStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub active_connections: i64,
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub queries: u64,
    pub write_queries: u64,
    pub blocked_queries: u64,
    pub backend_errors: u64,
    pub bytes_client_to_backend: u64,
    pub bytes_backend_to_client: u64,
}

impl HandlerStats {
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn query(&self, is_write: bool) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if is_write {
            self.write_queries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn query_blocked(&self) {
        self.blocked_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backend_error(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_to_backend(&self, n: usize) {
        self.bytes_client_to_backend
            .fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_to_client(&self, n: usize) {
        self.bytes_backend_to_client
            .fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            write_queries: self.write_queries.load(Ordering::Relaxed),
            blocked_queries: self.blocked_queries.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            bytes_client_to_backend: self.bytes_client_to_backend.load(Ordering::Relaxed),
            bytes_backend_to_client: self.bytes_backend_to_client.load(Ordering::Relaxed),
        }
    }
}
