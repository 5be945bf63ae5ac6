//! Cache Metrics Collection
//!
//! Lock-free counters updated on the lookup and eviction paths, plus a
//! serialisable snapshot for the CLI and logs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Per-cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,

    // Builds
    builds_started: AtomicU64,
    builds_finished: AtomicU64,
    builds_aborted: AtomicU64,
    build_waits: AtomicU64,
    build_latency_us: AtomicU64,

    // Tier movement
    memory_evictions: AtomicU64,
    demotions: AtomicU64,
    promotions: AtomicU64,
    disk_evictions: AtomicU64,

    allocation_failures: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build_started(&self) {
        self.builds_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed build and fold its duration into the moving average
    pub fn record_build_finished(&self, duration: Duration) {
        self.builds_finished.fetch_add(1, Ordering::Relaxed);
        self.update_latency_ema(&self.build_latency_us, duration);
    }

    pub fn record_build_aborted(&self) {
        self.builds_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build_wait(&self) {
        self.build_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_eviction(&self) {
        self.memory_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_demotion(&self) {
        self.demotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_eviction(&self) {
        self.disk_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allocation_failure(&self) {
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn build_latency(&self) -> Duration {
        Duration::from_micros(self.build_latency_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            builds_started: self.builds_started.load(Ordering::Relaxed),
            builds_finished: self.builds_finished.load(Ordering::Relaxed),
            builds_aborted: self.builds_aborted.load(Ordering::Relaxed),
            build_waits: self.build_waits.load(Ordering::Relaxed),
            build_latency_us: self.build_latency_us.load(Ordering::Relaxed),
            memory_evictions: self.memory_evictions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            disk_evictions: self.disk_evictions.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.builds_started,
            &self.builds_finished,
            &self.builds_aborted,
            &self.build_waits,
            &self.build_latency_us,
            &self.memory_evictions,
            &self.demotions,
            &self.promotions,
            &self.disk_evictions,
            &self.allocation_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of one cache's counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,

    pub builds_started: u64,
    pub builds_finished: u64,
    pub builds_aborted: u64,
    pub build_waits: u64,
    pub build_latency_us: u64,

    pub memory_evictions: u64,
    pub demotions: u64,
    pub promotions: u64,
    pub disk_evictions: u64,

    pub allocation_failures: u64,
}

/// Occupancy and counters of one cache
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub name: String,
    pub entries: usize,
    pub memory_size: usize,
    pub disk_size: usize,
    pub maximum_size: usize,
    pub maximum_memory_size: usize,
    pub metrics: MetricsSnapshot,
}

// =============================================================================
// Tests
// =============================================================================
