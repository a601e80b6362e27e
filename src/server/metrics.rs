// src/server/metrics.rs
//! Server metrics tracking
//!
//! Atomic counters for cache efficiency, upstream traffic and the kind of
//! scripts handed to firmware. Exposed through the admin stats endpoint.

use crate::error::Error;
use crate::provision::Provisioned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Server metrics collector
#[derive(Default)]
pub struct ServerMetrics {
    /// Artifact lookups (from artifact requests and boot resolution)
    requests_total: AtomicU64,
    /// Artifacts already cached
    hits: AtomicU64,
    /// Artifacts fetched from upstream
    misses: AtomicU64,
    bytes_served: AtomicU64,
    /// Successful verified upstream downloads
    upstream_fetches: AtomicU64,
    /// Upstream transport or status failures
    upstream_errors: AtomicU64,
    /// Signature verification failures
    integrity_failures: AtomicU64,
    /// Requests rejected because the key was being written
    conflicts: AtomicU64,
    boot_scripts: AtomicU64,
    retry_scripts: AtomicU64,
    error_scripts: AtomicU64,
    start_time: std::sync::OnceLock<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        let metrics = Self::default();
        let _ = metrics.start_time.set(Instant::now());
        metrics
    }

    /// Record how an artifact was made available
    pub fn record_provisioned(&self, provisioned: Provisioned) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        match provisioned {
            Provisioned::Cached(_) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
            }
            Provisioned::Fetched(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.upstream_fetches.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Count a failure by class
    pub fn record_failure(&self, error: &Error) {
        let counter = match error {
            Error::GpgVerificationFailed(_) => &self.integrity_failures,
            Error::ConflictError(_) => &self.conflicts,
            Error::DownloadError(_) => &self.upstream_errors,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_served(&self, bytes: u64) {
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_boot_script(&self) {
        self.boot_scripts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry_script(&self) {
        self.retry_scripts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error_script(&self) {
        self.error_scripts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self
            .start_time
            .get()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let bytes_served = self.bytes_served.load(Ordering::Relaxed);

        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            hits,
            misses,
            hit_rate,
            bytes_served,
            bytes_served_human: human_bytes(bytes_served),
            upstream_fetches: self.upstream_fetches.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            boot_scripts: self.boot_scripts.load(Ordering::Relaxed),
            retry_scripts: self.retry_scripts.load(Ordering::Relaxed),
            error_scripts: self.error_scripts.load(Ordering::Relaxed),
            uptime_secs: uptime.as_secs(),
        }
    }
}

/// Snapshot of current metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub hits: u64,
    pub misses: u64,
    /// Hit rate percentage
    pub hit_rate: f64,
    pub bytes_served: u64,
    pub bytes_served_human: String,
    pub upstream_fetches: u64,
    pub upstream_errors: u64,
    pub integrity_failures: u64,
    pub conflicts: u64,
    pub boot_scripts: u64,
    pub retry_scripts: u64,
    pub error_scripts: u64,
    pub uptime_secs: u64,
}

/// Format bytes as human-readable string
fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
