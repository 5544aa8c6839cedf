//! Cache statistics.
//!
//! The statistics stage and the transaction, replication and eviction
//! paths record into one [`CacheMetrics`] per cache; [`CacheMetrics::snapshot`]
//! turns it into the public [`CacheStats`].

mod counters;
mod histograms;

pub use counters::Counter;
pub use histograms::{Histogram, LATENCY_BUCKETS};

use crate::types::CacheStats;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub struct CacheMetrics {
    enabled: AtomicBool,
    pub hits: Counter,
    pub misses: Counter,
    pub stores: Counter,
    pub removes: Counter,
    pub evictions: Counter,
    pub prepares: Counter,
    pub commits: Counter,
    pub rollbacks: Counter,
    pub replications: Counter,
    pub replication_failures: Counter,
    pub gravitations: Counter,
    pub read_latency: Histogram,
    pub write_latency: Histogram,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CacheMetrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            hits: Counter::new("hits"),
            misses: Counter::new("misses"),
            stores: Counter::new("stores"),
            removes: Counter::new("removes"),
            evictions: Counter::new("evictions"),
            prepares: Counter::new("prepares"),
            commits: Counter::new("commits"),
            rollbacks: Counter::new("rollbacks"),
            replications: Counter::new("replications"),
            replication_failures: Counter::new("replication_failures"),
            gravitations: Counter::new("gravitations"),
            read_latency: Histogram::default(),
            write_latency: Histogram::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn record_read(&self, hit: bool, latency: Duration) {
        if !self.is_enabled() {
            return;
        }
        if hit {
            self.hits.inc();
        } else {
            self.misses.inc();
        }
        self.read_latency.observe_duration(latency);
    }

    pub fn record_store(&self, latency: Duration) {
        if !self.is_enabled() {
            return;
        }
        self.stores.inc();
        self.write_latency.observe_duration(latency);
    }

    pub fn record_remove(&self) {
        if self.is_enabled() {
            self.removes.inc();
        }
    }

    /// Bump a counter when statistics are on.
    pub fn count(&self, counter: &Counter) {
        if self.is_enabled() {
            counter.inc();
        }
    }

    /// Public statistics. Gauges that live elsewhere are passed in.
    pub fn snapshot(
        &self,
        node_count: usize,
        locks_held: usize,
        active_transactions: usize,
    ) -> CacheStats {
        CacheStats {
            node_count,
            locks_held,
            active_transactions,
            hits: self.hits.get(),
            misses: self.misses.get(),
            stores: self.stores.get(),
            removes: self.removes.get(),
            evictions: self.evictions.get(),
            prepares: self.prepares.get(),
            commits: self.commits.get(),
            rollbacks: self.rollbacks.get(),
            replications: self.replications.get(),
            replication_failures: self.replication_failures.get(),
            gravitations: self.gravitations.get(),
            average_read_time: self.read_latency.mean(),
            average_write_time: self.write_latency.mean(),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.stores,
            &self.removes,
            &self.evictions,
            &self.prepares,
            &self.commits,
            &self.rollbacks,
            &self.replications,
            &self.replication_failures,
            &self.gravitations,
        ] {
            counter.reset();
        }
        self.read_latency.reset();
        self.write_latency.reset();
    }
}
