//! Cache events and listeners.

use crate::fqn::Fqn;
use crate::tx::GlobalTransaction;
use crate::types::MemberId;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Something that happened to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A node came into existence.
    NodeCreated(Fqn),

    /// A node's attributes changed.
    NodeModified(Fqn),

    /// A node and its subtree were removed.
    NodeRemoved(Fqn),

    /// A subtree was moved.
    NodeMoved { from: Fqn, to: Fqn },

    /// A node was evicted from memory.
    NodeEvicted(Fqn),

    /// A node was read in from the cache loader.
    NodeLoaded(Fqn),

    /// A passivated node was brought back into memory.
    NodeActivated(Fqn),

    /// A node was written to the cache loader before eviction.
    NodePassivated(Fqn),

    /// A node was invalidated on behalf of another member.
    NodeInvalidated(Fqn),

    /// A transaction finished.
    TransactionCompleted {
        gtx: GlobalTransaction,
        committed: bool,
    },

    /// Cluster membership changed.
    ViewChanged { members: Vec<MemberId> },
}

impl CacheEvent {
    /// The node this event concerns, if any.
    pub fn fqn(&self) -> Option<&Fqn> {
        match self {
            CacheEvent::NodeCreated(fqn)
            | CacheEvent::NodeModified(fqn)
            | CacheEvent::NodeRemoved(fqn)
            | CacheEvent::NodeEvicted(fqn)
            | CacheEvent::NodeLoaded(fqn)
            | CacheEvent::NodeActivated(fqn)
            | CacheEvent::NodePassivated(fqn)
            | CacheEvent::NodeInvalidated(fqn) => Some(fqn),
            CacheEvent::NodeMoved { to, .. } => Some(to),
            CacheEvent::TransactionCompleted { .. } | CacheEvent::ViewChanged { .. } => None,
        }
    }
}

/// Receives cache events. `origin_local` is false when the change was
/// triggered by a peer.
pub trait CacheListener: Send + Sync + 'static {
    fn on_event(&self, event: &CacheEvent, origin_local: bool);
}

/// Listener that logs every event.
pub struct LoggingListener;

impl CacheListener for LoggingListener {
    fn on_event(&self, event: &CacheEvent, origin_local: bool) {
        match event {
            CacheEvent::ViewChanged { members } => {
                info!(?members, "View changed");
            }
            CacheEvent::TransactionCompleted { gtx, committed } => {
                debug!(gtx = %gtx, committed, "Transaction completed");
            }
            other => {
                debug!(event = ?other, origin_local, "Cache event");
            }
        }
    }
}

/// Fans events out to registered listeners. A panicking listener is
/// logged and skipped.
#[derive(Default)]
pub struct Notifier {
    listeners: RwLock<Vec<Arc<dyn CacheListener>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn CacheListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.read().is_empty()
    }

    pub fn notify(&self, event: &CacheEvent, origin_local: bool) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_event(event, origin_local)));
            if outcome.is_err() {
                error!(event = ?event, "Cache listener panicked");
            }
        }
    }

    pub fn notify_all(&self, events: &[CacheEvent], origin_local: bool) {
        if events.is_empty() || !self.has_listeners() {
            return;
        }
        for event in events {
            self.notify(event, origin_local);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<CacheEvent>>);

    impl CacheListener for Collect {
        fn on_event(&self, event: &CacheEvent, _origin_local: bool) {
            self.0.lock().push(event.clone());
        }
    }

    struct Panics;

    impl CacheListener for Panics {
        fn on_event(&self, _event: &CacheEvent, _origin_local: bool) {
            panic!("listener failure");
        }
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let notifier = Notifier::new();
        let collect = Arc::new(Collect::default());
        notifier.add_listener(Arc::new(Panics));
        notifier.add_listener(collect.clone());

        notifier.notify(&CacheEvent::NodeCreated(Fqn::parse("/a")), true);
        assert_eq!(collect.0.lock().len(), 1);
    }

    #[test]
    fn test_event_fqn() {
        let moved = CacheEvent::NodeMoved {
            from: Fqn::parse("/a"),
            to: Fqn::parse("/b/a"),
        };
        assert_eq!(moved.fqn(), Some(&Fqn::parse("/b/a")));
        assert_eq!(CacheEvent::ViewChanged { members: vec![1] }.fqn(), None);
    }

    #[test]
    fn test_remove_listener() {
        let notifier = Notifier::new();
        let listener: Arc<dyn CacheListener> = Arc::new(Collect::default());
        notifier.add_listener(listener.clone());
        assert!(notifier.has_listeners());
        notifier.remove_listener(&listener);
        assert!(!notifier.has_listeners());
    }
}
