//! Tree-structured, transactional, optionally replicated in-process cache.
//!
//! Data lives in a tree of nodes addressed by [`Fqn`] paths; each node
//! holds a map of attributes. Every call is turned into a [`Command`] and
//! run through a pipeline of interceptors that add transactions, locking,
//! persistence, eviction and cluster replication around the tree itself.
//!
//! # Features
//!
//! - Pessimistic node locking with isolation levels, or optimistic and
//!   MVCC schemes with per-transaction workspaces and version checks
//! - Transactions driven by a pluggable [`TransactionManager`]; writes
//!   outside a transaction run in an implicit one where needed
//! - Synchronous or asynchronous replication and invalidation over a
//!   pluggable [`Transport`], with two-phase commit in synchronous modes
//! - Buddy replication with data gravitation
//! - Read-through, write-through and passivation via a [`CacheLoader`]
//! - Background eviction driven by an [`EvictionPolicy`]
//!
//! # Example
//!
//! ```rust,no_run
//! use arbor::{CacheConfig, CacheMode, LocalCluster, TreeCache};
//!
//! # async fn example() -> arbor::Result<()> {
//! let cluster = LocalCluster::new();
//! let config = CacheConfig::new(CacheMode::ReplSync);
//!
//! let a = TreeCache::builder(config.clone())
//!     .with_transport(cluster.join())
//!     .start()
//!     .await?;
//! let b = TreeCache::builder(config)
//!     .with_transport(cluster.join())
//!     .start()
//!     .await?;
//!
//! a.put("/accounts/1", "balance", "100").await?;
//! assert!(b.get("/accounts/1", "balance").await?.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! # Pipeline
//!
//! ```text
//!   TreeCache / Invocation
//!            │
//!            ▼
//!   stats → tx → locking (pessimistic) | validation (optimistic)
//!       → loader → store | passivation → data gravitation
//!       → replication | invalidation → eviction → call
//! ```
//!
//! Commands from peers enter the same pipeline through the
//! [`RpcDispatcher`] with a remote context, so they are never replicated
//! again.

pub mod buddy;
pub mod cache;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod eviction;
pub mod fqn;
pub mod interceptors;
pub mod loader;
pub mod lock;
pub mod metrics;
pub mod notifications;
pub mod optimistic;
pub mod replication;
pub mod testing;
pub mod transport;
pub mod tree;
pub mod tx;
pub mod types;
pub mod version;

pub use cache::{Invocation, TreeCache, TreeCacheBuilder};
pub use command::{Command, CommandResult};
pub use config::{
    BuddyReplicationConfig, CacheConfig, CacheMode, EvictionConfig, LoaderConfig, LockingConfig,
    NodeLockingScheme, ReplicationConfig,
};
pub use context::InvocationOptions;
pub use error::{Error, Result};
pub use fqn::Fqn;
pub use types::{AttributeMap, CacheStats, CacheStatus, MemberId};
pub use version::DataVersion;

// Capabilities
pub use eviction::{EvictionEvent, EvictionPolicy, LruPolicy};
pub use loader::{CacheLoader, InMemoryCacheLoader};
pub use notifications::{CacheEvent, CacheListener, LoggingListener};
pub use transport::{LocalCluster, LocalTransport, Transport};
pub use tx::{LocalTransactionManager, Transaction, TransactionManager, TransactionStatus};

pub use lock::IsolationLevel;
pub use replication::RpcDispatcher;
