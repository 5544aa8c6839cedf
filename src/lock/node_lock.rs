//! A single node's read/write lock.

use super::{LockMode, LockOwner};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct LockState {
    readers: HashSet<LockOwner>,
    writer: Option<LockOwner>,
}

/// Reentrant, upgradeable read/write lock keyed by owner rather than by
/// task. Waiters park on a [`Notify`] and re-check on every release.
#[derive(Debug, Default)]
pub struct NodeLock {
    state: Mutex<LockState>,
    released: Notify,
}

impl NodeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock without waiting.
    ///
    /// A writer implicitly holds read access. A sole reader may upgrade
    /// to write.
    pub fn try_acquire(&self, owner: &LockOwner, mode: LockMode) -> bool {
        let mut state = self.state.lock();
        if state.writer.as_ref() == Some(owner) {
            return true;
        }
        if state.writer.is_some() {
            return false;
        }
        match mode {
            LockMode::Read => {
                state.readers.insert(owner.clone());
                true
            }
            LockMode::Write => {
                if state.readers.iter().any(|r| r != owner) {
                    return false;
                }
                state.readers.remove(owner);
                state.writer = Some(owner.clone());
                true
            }
        }
    }

    /// Wait up to `timeout` for the lock. A zero timeout never waits.
    pub async fn acquire(&self, owner: &LockOwner, mode: LockMode, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not lost.
            notified.as_mut().enable();

            if self.try_acquire(owner, mode) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_acquire(owner, mode);
            }
        }
    }

    /// Drop whatever `owner` holds. Returns false if it held nothing.
    pub fn release(&self, owner: &LockOwner) -> bool {
        let released = {
            let mut state = self.state.lock();
            let was_writer = state.writer.as_ref() == Some(owner);
            if was_writer {
                state.writer = None;
            }
            state.readers.remove(owner) || was_writer
        };
        if released {
            self.released.notify_waiters();
        }
        released
    }

    pub fn is_held_by(&self, owner: &LockOwner) -> bool {
        let state = self.state.lock();
        state.writer.as_ref() == Some(owner) || state.readers.contains(owner)
    }

    pub fn holds_write(&self, owner: &LockOwner) -> bool {
        self.state.lock().writer.as_ref() == Some(owner)
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.writer.is_none() && state.readers.is_empty()
    }

    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }
}
