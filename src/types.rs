//! Core types used throughout the cache.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifier of a cluster member.
pub type MemberId = u64;

/// Attribute map held by every node.
pub type AttributeMap = HashMap<String, Bytes>;

/// Lifecycle status of a cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStatus {
    Instantiated,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl CacheStatus {
    /// Whether invocations are accepted in this status.
    pub fn allows_invocations(&self) -> bool {
        matches!(self, CacheStatus::Running)
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheStatus::Instantiated => "instantiated",
            CacheStatus::Starting => "starting",
            CacheStatus::Running => "running",
            CacheStatus::Stopping => "stopping",
            CacheStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Number of nodes in the tree, root included.
    pub node_count: usize,
    /// Number of node locks currently held.
    pub locks_held: usize,
    /// Number of transactions in the transaction table.
    pub active_transactions: usize,
    /// Reads that found a value.
    pub hits: u64,
    /// Reads that found nothing.
    pub misses: u64,
    /// Write operations.
    pub stores: u64,
    /// Key and node removals.
    pub removes: u64,
    /// Evicted nodes.
    pub evictions: u64,
    /// Transactions prepared.
    pub prepares: u64,
    /// Transactions committed.
    pub commits: u64,
    /// Transactions rolled back.
    pub rollbacks: u64,
    /// Commands sent to peers.
    pub replications: u64,
    /// Failed remote propagations.
    pub replication_failures: u64,
    /// Successful data gravitations.
    pub gravitations: u64,
    /// Mean read latency in seconds.
    pub average_read_time: f64,
    /// Mean write latency in seconds.
    pub average_write_time: f64,
}

impl CacheStats {
    /// Fraction of reads that were hits.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
