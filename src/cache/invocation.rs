use super::TreeCache;
use crate::command::{Command, CommandResult};
use crate::context::InvocationOptions;
use crate::error::Result;
use crate::fqn::Fqn;
use crate::tx::Transaction;
use crate::types::AttributeMap;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::time::Duration;

/// One or more calls sharing per-call options and, optionally, a
/// transaction.
///
/// ```rust,no_run
/// # use arbor::{CacheConfig, InvocationOptions, TreeCache};
/// # async fn example(cache: TreeCache) -> arbor::Result<()> {
/// cache
///     .with_options(InvocationOptions::new().cache_mode_local())
///     .put("/local/only", "k", "v")
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Invocation<'a> {
    cache: &'a TreeCache,
    options: InvocationOptions,
    transaction: Option<Transaction>,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(cache: &'a TreeCache) -> Self {
        Self {
            cache,
            options: InvocationOptions::default(),
            transaction: None,
        }
    }

    pub fn options(mut self, options: InvocationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn transaction(mut self, tx: &Transaction) -> Self {
        self.transaction = Some(tx.clone());
        self
    }

    async fn invoke(&self, command: Command) -> Result<CommandResult> {
        self.cache
            .invoke(&command, self.options.clone(), self.transaction.clone())
            .await
    }

    /// Put one attribute; returns the previous value.
    pub async fn put(
        &self,
        fqn: impl Into<Fqn>,
        key: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> Result<Option<Bytes>> {
        Ok(self.invoke(Command::put(fqn, key, value)).await?.into_value())
    }

    /// Merge `data` into the node's attributes.
    pub async fn put_all(&self, fqn: impl Into<Fqn>, data: AttributeMap) -> Result<()> {
        self.invoke(Command::put_all(fqn, data, false)).await?;
        Ok(())
    }

    /// Replace the node's attributes with `data`.
    pub async fn replace_all(&self, fqn: impl Into<Fqn>, data: AttributeMap) -> Result<()> {
        self.invoke(Command::put_all(fqn, data, true)).await?;
        Ok(())
    }

    pub async fn get(&self, fqn: impl Into<Fqn>, key: impl Into<String>) -> Result<Option<Bytes>> {
        Ok(self.invoke(Command::get(fqn, key)).await?.into_value())
    }

    /// A copy of the node's attributes, or `None` if there is no node.
    pub async fn get_data(&self, fqn: impl Into<Fqn>) -> Result<Option<AttributeMap>> {
        let command = Command::GetData { fqn: fqn.into() };
        Ok(self.invoke(command).await?.into_data())
    }

    pub async fn get_keys(&self, fqn: impl Into<Fqn>) -> Result<Option<BTreeSet<String>>> {
        let command = Command::GetKeys { fqn: fqn.into() };
        Ok(self.invoke(command).await?.into_names())
    }

    pub async fn get_children_names(
        &self,
        fqn: impl Into<Fqn>,
    ) -> Result<Option<BTreeSet<String>>> {
        let command = Command::GetChildrenNames { fqn: fqn.into() };
        Ok(self.invoke(command).await?.into_names())
    }

    pub async fn exists(&self, fqn: impl Into<Fqn>) -> Result<bool> {
        let command = Command::Exists { fqn: fqn.into() };
        Ok(self.invoke(command).await?.into_bool())
    }

    /// Remove one attribute; returns its value.
    pub async fn remove(&self, fqn: impl Into<Fqn>, key: impl Into<String>) -> Result<Option<Bytes>> {
        Ok(self.invoke(Command::remove_key(fqn, key)).await?.into_value())
    }

    /// Remove a node and its subtree. Returns whether the node existed.
    pub async fn remove_node(&self, fqn: impl Into<Fqn>) -> Result<bool> {
        Ok(self.invoke(Command::remove_node(fqn)).await?.into_bool())
    }

    pub async fn clear_data(&self, fqn: impl Into<Fqn>) -> Result<()> {
        self.invoke(Command::ClearData { fqn: fqn.into() }).await?;
        Ok(())
    }

    /// Move `from` and its subtree below `to_parent`.
    pub async fn move_node(&self, from: impl Into<Fqn>, to_parent: impl Into<Fqn>) -> Result<()> {
        let command = Command::Move {
            from: from.into(),
            to_parent: to_parent.into(),
        };
        self.invoke(command).await?;
        Ok(())
    }

    /// Drop a node from memory on this member only. Returns whether
    /// anything was evicted.
    pub async fn evict(&self, fqn: impl Into<Fqn>, recursive: bool) -> Result<bool> {
        let command = Command::Evict {
            fqn: fqn.into(),
            recursive,
        };
        Ok(self.invoke(command).await?.into_bool())
    }

    /// Cache a value read from an external source. Never overwrites an
    /// existing key, never joins the caller's transaction, never waits
    /// for a lock and never fails.
    pub async fn put_for_external_read(
        &self,
        fqn: impl Into<Fqn>,
        key: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        let options = self
            .options
            .clone()
            .fail_silently()
            .with_lock_acquisition_timeout(Duration::ZERO);
        let command = Command::PutKeyValue {
            fqn: fqn.into(),
            key: key.into(),
            value: value.into(),
            put_for_external_read: true,
        };
        self.cache.invoke(&command, options, None).await?;
        Ok(())
    }
}
