use super::CacheLoader;
use crate::error::{Error, Result};
use crate::fqn::Fqn;
use crate::types::AttributeMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Loader keeping everything in a map. Share one `Arc` between caches to
/// model a shared store.
#[derive(Debug, Default)]
pub struct InMemoryCacheLoader {
    entries: RwLock<BTreeMap<Fqn, AttributeMap>>,
    loads: AtomicU64,
    stores: AtomicU64,
    removes: AtomicU64,
    failing: AtomicBool,
}

impl InMemoryCacheLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store directly, bypassing any cache.
    pub fn insert(&self, fqn: impl Into<Fqn>, data: AttributeMap) {
        self.entries.write().insert(fqn.into(), data);
    }

    pub fn get(&self, fqn: &Fqn) -> Option<AttributeMap> {
        self.entries.read().get(fqn).cloned()
    }

    pub fn contains(&self, fqn: &Fqn) -> bool {
        self.entries.read().contains_key(fqn)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn store_count(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }

    pub fn remove_count(&self) -> u64 {
        self.removes.load(Ordering::Relaxed)
    }

    /// Make every call fail, to exercise error paths.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(Error::Loader("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheLoader for InMemoryCacheLoader {
    async fn load(&self, fqn: &Fqn) -> Result<Option<AttributeMap>> {
        self.check()?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.get(fqn))
    }

    async fn store(&self, fqn: &Fqn, data: &AttributeMap) -> Result<()> {
        self.check()?;
        self.stores.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(fqn.clone(), data.clone());
        Ok(())
    }

    async fn remove(&self, fqn: &Fqn) -> Result<()> {
        self.check()?;
        self.removes.fetch_add(1, Ordering::Relaxed);
        self.entries
            .write()
            .retain(|stored, _| !stored.is_child_or_equals(fqn));
        Ok(())
    }

    async fn exists(&self, fqn: &Fqn) -> Result<bool> {
        self.check()?;
        Ok(self.contains(fqn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn data(value: &'static str) -> AttributeMap {
        AttributeMap::from([("k".to_string(), Bytes::from(value))])
    }

    #[tokio::test]
    async fn test_remove_drops_subtree() {
        let loader = InMemoryCacheLoader::new();
        loader.store(&Fqn::parse("/a"), &data("1")).await.unwrap();
        loader.store(&Fqn::parse("/a/b"), &data("2")).await.unwrap();
        loader.store(&Fqn::parse("/ab"), &data("3")).await.unwrap();

        loader.remove(&Fqn::parse("/a")).await.unwrap();
        assert!(!loader.exists(&Fqn::parse("/a/b")).await.unwrap());
        assert!(loader.exists(&Fqn::parse("/ab")).await.unwrap());
        assert_eq!(loader.store_count(), 3);
    }

    #[tokio::test]
    async fn test_failing_loader() {
        let loader = InMemoryCacheLoader::new();
        loader.set_failing(true);
        let err = loader.load(&Fqn::parse("/a")).await.unwrap_err();
        assert!(matches!(err, Error::Loader(_)));
    }
}
