//! Configuration types for the tree cache.

use crate::error::{Error, Result};
use crate::lock::IsolationLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How changes propagate to other members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CacheMode {
    /// No propagation.
    #[default]
    Local,
    /// Replicate and wait for every peer to apply.
    ReplSync,
    /// Replicate without waiting.
    ReplAsync,
    /// Tell peers to drop their copies and wait for acknowledgement.
    InvalidationSync,
    /// Tell peers to drop their copies without waiting.
    InvalidationAsync,
}

impl CacheMode {
    pub fn is_clustered(&self) -> bool {
        *self != CacheMode::Local
    }

    pub fn is_synchronous(&self) -> bool {
        matches!(self, CacheMode::ReplSync | CacheMode::InvalidationSync)
    }

    pub fn is_invalidation(&self) -> bool {
        matches!(
            self,
            CacheMode::InvalidationSync | CacheMode::InvalidationAsync
        )
    }

    pub fn is_replication(&self) -> bool {
        matches!(self, CacheMode::ReplSync | CacheMode::ReplAsync)
    }
}

/// Concurrency control scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeLockingScheme {
    /// Per-node read/write locks held for the transaction.
    #[default]
    Pessimistic,
    /// Private workspace validated against node versions at prepare.
    Optimistic,
    /// Workspace with lazy copies and write-only validation.
    Mvcc,
}

impl NodeLockingScheme {
    /// Whether transactions run against a workspace.
    pub fn uses_workspace(&self) -> bool {
        !matches!(self, NodeLockingScheme::Pessimistic)
    }
}

/// Main configuration for the tree cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub cache_mode: CacheMode,
    pub locking: LockingConfig,
    pub replication: ReplicationConfig,
    pub buddy_replication: BuddyReplicationConfig,
    pub loader: LoaderConfig,
    pub eviction: EvictionConfig,
    /// Whether the statistics stage records anything.
    pub statistics_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_mode: CacheMode::Local,
            locking: LockingConfig::default(),
            replication: ReplicationConfig::default(),
            buddy_replication: BuddyReplicationConfig::default(),
            loader: LoaderConfig::default(),
            eviction: EvictionConfig::default(),
            statistics_enabled: true,
        }
    }
}

impl CacheConfig {
    pub fn new(cache_mode: CacheMode) -> Self {
        Self {
            cache_mode,
            ..Default::default()
        }
    }

    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn with_locking(mut self, locking: LockingConfig) -> Self {
        self.locking = locking;
        self
    }

    pub fn with_locking_scheme(mut self, scheme: NodeLockingScheme) -> Self {
        self.locking.scheme = scheme;
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.locking.isolation_level = level;
        self
    }

    pub fn with_lock_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.locking.lock_acquisition_timeout = timeout;
        self
    }

    pub fn with_replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }

    pub fn with_buddy_replication(mut self, buddy: BuddyReplicationConfig) -> Self {
        self.buddy_replication = buddy;
        self
    }

    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_eviction(mut self, eviction: EvictionConfig) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.statistics_enabled = enabled;
        self
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.buddy_replication.enabled {
            if !self.cache_mode.is_clustered() {
                return Err(Error::Config(
                    "buddy replication requires a clustered cache mode".to_string(),
                ));
            }
            if self.cache_mode.is_invalidation() {
                return Err(Error::Config(
                    "buddy replication cannot be combined with invalidation".to_string(),
                ));
            }
            if self.buddy_replication.num_buddies == 0 {
                return Err(Error::Config("num_buddies must be at least 1".to_string()));
            }
        }
        if self.replication.use_repl_queue && self.cache_mode != CacheMode::ReplAsync {
            return Err(Error::Config(
                "the replication queue is only available in asynchronous replication mode"
                    .to_string(),
            ));
        }
        if self.replication.use_repl_queue && self.replication.repl_queue_max_elements == 0 {
            return Err(Error::Config(
                "repl_queue_max_elements must be at least 1".to_string(),
            ));
        }
        if self.locking.scheme == NodeLockingScheme::Mvcc
            && self.locking.lock_parent_for_child_insert_remove
        {
            return Err(Error::UnsupportedConfiguration(
                "lock_parent_for_child_insert_remove cannot be combined with the MVCC scheme"
                    .to_string(),
            ));
        }
        if self.eviction.wakeup_interval.is_zero() {
            return Err(Error::Config(
                "eviction wakeup interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Locking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockingConfig {
    pub scheme: NodeLockingScheme,
    /// Pessimistic scheme only.
    pub isolation_level: IsolationLevel,
    pub lock_acquisition_timeout: Duration,
    /// Write-lock the parent when inserting or removing a child.
    pub lock_parent_for_child_insert_remove: bool,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            scheme: NodeLockingScheme::Pessimistic,
            isolation_level: IsolationLevel::RepeatableRead,
            lock_acquisition_timeout: Duration::from_secs(10),
            lock_parent_for_child_insert_remove: false,
        }
    }
}

impl LockingConfig {
    pub fn with_scheme(mut self, scheme: NodeLockingScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn with_lock_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquisition_timeout = timeout;
        self
    }

    pub fn with_lock_parent_for_child_insert_remove(mut self, enabled: bool) -> Self {
        self.lock_parent_for_child_insert_remove = enabled;
        self
    }
}

/// Replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// How long a synchronous call waits for each peer.
    pub sync_repl_timeout: Duration,
    /// Batch asynchronous replication.
    pub use_repl_queue: bool,
    /// How often the queue is flushed.
    pub repl_queue_interval: Duration,
    /// Flush as soon as this many commands are queued.
    pub repl_queue_max_elements: usize,
    /// Wait for peers to acknowledge commit.
    pub sync_commit_phase: bool,
    /// Wait for peers to acknowledge rollback.
    pub sync_rollback_phase: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            sync_repl_timeout: Duration::from_secs(15),
            use_repl_queue: false,
            repl_queue_interval: Duration::from_millis(100),
            repl_queue_max_elements: 1000,
            sync_commit_phase: false,
            sync_rollback_phase: false,
        }
    }
}

impl ReplicationConfig {
    pub fn with_sync_repl_timeout(mut self, timeout: Duration) -> Self {
        self.sync_repl_timeout = timeout;
        self
    }

    pub fn with_repl_queue(mut self, interval: Duration, max_elements: usize) -> Self {
        self.use_repl_queue = true;
        self.repl_queue_interval = interval;
        self.repl_queue_max_elements = max_elements;
        self
    }

    pub fn with_sync_commit_phase(mut self, enabled: bool) -> Self {
        self.sync_commit_phase = enabled;
        self
    }

    pub fn with_sync_rollback_phase(mut self, enabled: bool) -> Self {
        self.sync_rollback_phase = enabled;
        self
    }
}

/// Buddy replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuddyReplicationConfig {
    pub enabled: bool,
    /// Size of each member's buddy group.
    pub num_buddies: usize,
    /// Gravitate on every local miss without being asked.
    pub auto_data_gravitation: bool,
    /// Owners drop their copy once another member gravitated it.
    pub data_gravitation_remove_on_find: bool,
    /// Also look in backup subtrees when answering a gravitation request.
    pub data_gravitation_search_backup_trees: bool,
    /// Reply timeout for gravitation and buddy group messages.
    pub buddy_communication_timeout: Duration,
}

impl Default for BuddyReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            num_buddies: 1,
            auto_data_gravitation: false,
            data_gravitation_remove_on_find: true,
            data_gravitation_search_backup_trees: true,
            buddy_communication_timeout: Duration::from_secs(10),
        }
    }
}

impl BuddyReplicationConfig {
    pub fn enabled(num_buddies: usize) -> Self {
        Self {
            enabled: true,
            num_buddies,
            ..Default::default()
        }
    }

    pub fn with_auto_data_gravitation(mut self, enabled: bool) -> Self {
        self.auto_data_gravitation = enabled;
        self
    }

    pub fn with_remove_on_find(mut self, enabled: bool) -> Self {
        self.data_gravitation_remove_on_find = enabled;
        self
    }

    pub fn with_search_backup_trees(mut self, enabled: bool) -> Self {
        self.data_gravitation_search_backup_trees = enabled;
        self
    }

    pub fn with_communication_timeout(mut self, timeout: Duration) -> Self {
        self.buddy_communication_timeout = timeout;
        self
    }
}

/// Cache loader behaviour. The loader itself is supplied to the builder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Store on eviction and remove on activation instead of writing through.
    pub passivation: bool,
    /// The store is shared by all members; only the originator writes.
    pub shared: bool,
}

impl LoaderConfig {
    pub fn with_passivation(mut self, enabled: bool) -> Self {
        self.passivation = enabled;
        self
    }

    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }
}

/// Eviction timer configuration. The policy is supplied to the builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    pub wakeup_interval: Duration,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            wakeup_interval: Duration::from_secs(5),
        }
    }
}

impl EvictionConfig {
    pub fn with_wakeup_interval(mut self, interval: Duration) -> Self {
        self.wakeup_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CacheConfig::default();
        assert_eq!(config.cache_mode, CacheMode::Local);
        assert_eq!(config.locking.scheme, NodeLockingScheme::Pessimistic);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::new(CacheMode::ReplSync)
            .with_locking_scheme(NodeLockingScheme::Optimistic)
            .with_lock_acquisition_timeout(Duration::from_millis(250))
            .with_replication(ReplicationConfig::default().with_sync_commit_phase(true))
            .with_buddy_replication(BuddyReplicationConfig::enabled(2));

        assert!(config.statistics_enabled);
        assert!(config.locking.scheme.uses_workspace());
        assert_eq!(
            config.locking.lock_acquisition_timeout,
            Duration::from_millis(250)
        );
        assert!(config.replication.sync_commit_phase);
        assert_eq!(config.buddy_replication.num_buddies, 2);
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_inconsistent_settings() {
        let local_buddies =
            CacheConfig::new(CacheMode::Local).with_buddy_replication(BuddyReplicationConfig::enabled(1));
        assert!(matches!(local_buddies.validate(), Err(Error::Config(_))));

        let invalidation_buddies = CacheConfig::new(CacheMode::InvalidationSync)
            .with_buddy_replication(BuddyReplicationConfig::enabled(1));
        assert!(invalidation_buddies.validate().is_err());

        let sync_queue = CacheConfig::new(CacheMode::ReplSync).with_replication(
            ReplicationConfig::default().with_repl_queue(Duration::from_millis(10), 10),
        );
        assert!(sync_queue.validate().is_err());

        let async_queue = CacheConfig::new(CacheMode::ReplAsync).with_replication(
            ReplicationConfig::default().with_repl_queue(Duration::from_millis(10), 10),
        );
        async_queue.validate().unwrap();
    }

    #[test]
    fn test_mvcc_with_parent_locking_is_unsupported() {
        let config = CacheConfig::default().with_locking(
            LockingConfig::default()
                .with_scheme(NodeLockingScheme::Mvcc)
                .with_lock_parent_for_child_insert_remove(true),
        );
        assert!(matches!(
            config.validate(),
            Err(Error::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn test_config_serde() {
        let config = CacheConfig::new(CacheMode::InvalidationAsync);
        let bytes = bincode::serialize(&config).unwrap();
        let decoded: CacheConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.cache_mode, CacheMode::InvalidationAsync);
    }
}
