//! Lock table for the pessimistic scheme.

use super::{LockMode, LockOwner, NodeLock};
use crate::error::{Error, Result};
use crate::fqn::Fqn;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Per-node locks, created on demand and dropped once idle.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: DashMap<Fqn, Arc<NodeLock>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `mode` on `fqn` for `owner`, waiting at most `timeout`.
    ///
    /// Fails with [`Error::LockTimeout`] when the wait expires.
    pub async fn acquire(
        &self,
        fqn: &Fqn,
        owner: &LockOwner,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let lock = self
                .locks
                .entry(fqn.clone())
                .or_insert_with(|| Arc::new(NodeLock::new()))
                .clone();

            let remaining = deadline.saturating_duration_since(Instant::now());
            if !lock.acquire(owner, mode, remaining).await {
                debug!(fqn = %fqn, %owner, %mode, ?timeout, "Lock acquisition timed out");
                return Err(Error::LockTimeout {
                    fqn: fqn.clone(),
                    mode,
                    owner: owner.to_string(),
                    timeout,
                });
            }

            // An idle lock may have been dropped from the table while we
            // waited on it; only a lock that is still current counts.
            let current = self
                .locks
                .get(fqn)
                .map(|l| Arc::ptr_eq(l.value(), &lock))
                .unwrap_or(false);
            if current {
                trace!(fqn = %fqn, %owner, %mode, "Lock acquired");
                return Ok(());
            }
            lock.release(owner);
        }
    }

    /// Release whatever `owner` holds on `fqn`.
    pub fn release(&self, fqn: &Fqn, owner: &LockOwner) {
        let Some(lock) = self.locks.get(fqn).map(|l| l.value().clone()) else {
            return;
        };
        if lock.release(owner) {
            trace!(fqn = %fqn, %owner, "Lock released");
        }
        self.locks.remove_if(fqn, |_, l| l.is_idle());
    }

    /// Release the locks on every path in `fqns`, deepest first.
    pub fn release_all<'a>(&self, fqns: impl IntoIterator<Item = &'a Fqn>, owner: &LockOwner) {
        let mut fqns: Vec<&Fqn> = fqns.into_iter().collect();
        fqns.sort_by(|a, b| b.cmp(a));
        for fqn in fqns {
            self.release(fqn, owner);
        }
    }

    /// Whether any owner holds a lock on `fqn`.
    pub fn is_locked(&self, fqn: &Fqn) -> bool {
        self.locks.get(fqn).map(|l| !l.is_idle()).unwrap_or(false)
    }

    pub fn is_write_locked(&self, fqn: &Fqn) -> bool {
        self.locks
            .get(fqn)
            .map(|l| l.is_write_locked())
            .unwrap_or(false)
    }

    pub fn holds_lock(&self, fqn: &Fqn, owner: &LockOwner) -> bool {
        self.locks
            .get(fqn)
            .map(|l| l.is_held_by(owner))
            .unwrap_or(false)
    }

    /// Number of nodes currently locked.
    pub fn lock_count(&self) -> usize {
        self.locks.iter().filter(|e| !e.value().is_idle()).count()
    }
}

/// Locks that belong to a single call. Released on drop, so every exit
/// path of the call gives them back.
#[derive(Debug)]
pub struct LockScope {
    manager: Arc<LockManager>,
    held: Vec<(Fqn, LockOwner)>,
}

impl LockScope {
    pub fn new(manager: Arc<LockManager>) -> Self {
        Self {
            manager,
            held: Vec::new(),
        }
    }

    pub fn record(&mut self, fqn: Fqn, owner: LockOwner) {
        if !self.held.iter().any(|(f, o)| *f == fqn && *o == owner) {
            self.held.push((fqn, owner));
        }
    }

    pub fn held(&self) -> Vec<Fqn> {
        self.held.iter().map(|(f, _)| f.clone()).collect()
    }

    /// Release everything now, deepest first.
    pub fn release_all(&mut self) {
        let mut held = std::mem::take(&mut self.held);
        held.sort_by(|a, b| b.0.cmp(&a.0));
        for (fqn, owner) in held {
            self.manager.release(&fqn, &owner);
        }
    }
}

impl Drop for LockScope {
    fn drop(&mut self) {
        self.release_all();
    }
}
