//! Persistence capability behind the cache.
//!
//! The cache reads through a [`CacheLoader`] on a miss and writes through
//! to it on every completed write (or, with passivation, only when a node
//! is evicted).

mod memory;

pub use memory::InMemoryCacheLoader;

use crate::error::Result;
use crate::fqn::Fqn;
use crate::types::AttributeMap;
use async_trait::async_trait;

/// Backing store for node data.
#[async_trait]
pub trait CacheLoader: Send + Sync {
    /// Data persisted for `fqn`, if any.
    async fn load(&self, fqn: &Fqn) -> Result<Option<AttributeMap>>;

    /// Replace the data persisted for `fqn`.
    async fn store(&self, fqn: &Fqn, data: &AttributeMap) -> Result<()>;

    /// Drop `fqn` and everything below it.
    async fn remove(&self, fqn: &Fqn) -> Result<()>;

    async fn exists(&self, fqn: &Fqn) -> Result<bool>;
}
