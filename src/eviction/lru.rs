use super::{EvictionEvent, EvictionPolicy};
use crate::buddy::BuddyManager;
use crate::fqn::Fqn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Least-recently-used eviction, bounded by node count, idle age, or
/// both. A `max_nodes` of zero means no count bound.
#[derive(Debug)]
pub struct LruPolicy {
    max_nodes: usize,
    max_age: Option<Duration>,
    last_access: Mutex<HashMap<Fqn, Instant>>,
}

impl LruPolicy {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            max_nodes,
            max_age: None,
            last_access: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn tracked(&self) -> usize {
        self.last_access.lock().len()
    }

    fn touch(&self, fqn: Fqn) {
        if fqn.is_root() || fqn == BuddyManager::backup_root() {
            return;
        }
        self.last_access.lock().insert(fqn, Instant::now());
    }
}

impl EvictionPolicy for LruPolicy {
    fn on_event(&self, event: EvictionEvent) {
        match event {
            EvictionEvent::Visited(fqn)
            | EvictionEvent::Created(fqn)
            | EvictionEvent::Modified(fqn) => self.touch(fqn),
            EvictionEvent::Removed(fqn) => self
                .last_access
                .lock()
                .retain(|tracked, _| !tracked.is_child_or_equals(&fqn)),
            EvictionEvent::Evicted(fqn) => {
                self.last_access.lock().remove(&fqn);
            }
        }
    }

    fn select_victims(&self) -> Vec<Fqn> {
        let mut entries: Vec<(Fqn, Instant)> = self
            .last_access
            .lock()
            .iter()
            .map(|(fqn, at)| (fqn.clone(), *at))
            .collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.depth().cmp(&a.0.depth())));

        let over_capacity = if self.max_nodes > 0 {
            entries.len().saturating_sub(self.max_nodes)
        } else {
            0
        };
        let now = Instant::now();
        entries
            .into_iter()
            .enumerate()
            .filter(|(i, (_, at))| {
                *i < over_capacity
                    || self
                        .max_age
                        .is_some_and(|age| now.duration_since(*at) >= age)
            })
            .map(|(_, (fqn, _))| fqn)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_least_recently_used_are_selected_first() {
        let policy = LruPolicy::new(2);
        for path in ["/a", "/b", "/c"] {
            policy.on_event(EvictionEvent::Modified(Fqn::parse(path)));
            std::thread::sleep(Duration::from_millis(2));
        }
        policy.on_event(EvictionEvent::Visited(Fqn::parse("/a")));

        assert_eq!(policy.select_victims(), vec![Fqn::parse("/b")]);
    }

    #[test]
    fn test_removal_forgets_subtree() {
        let policy = LruPolicy::new(0);
        policy.on_event(EvictionEvent::Created(Fqn::parse("/a")));
        policy.on_event(EvictionEvent::Created(Fqn::parse("/a/b")));
        policy.on_event(EvictionEvent::Created(Fqn::parse("/ab")));
        policy.on_event(EvictionEvent::Evicted(Fqn::parse("/ab")));
        assert_eq!(policy.tracked(), 2);

        policy.on_event(EvictionEvent::Removed(Fqn::parse("/a")));
        assert_eq!(policy.tracked(), 0);
        assert!(policy.select_victims().is_empty());
    }

    #[test]
    fn test_idle_nodes_expire() {
        let policy = LruPolicy::new(0).with_max_age(Duration::from_millis(5));
        policy.on_event(EvictionEvent::Modified(Fqn::parse("/old")));
        std::thread::sleep(Duration::from_millis(10));
        policy.on_event(EvictionEvent::Modified(Fqn::parse("/new")));

        assert_eq!(policy.select_victims(), vec![Fqn::parse("/old")]);
    }

    #[test]
    fn test_root_is_never_tracked() {
        let policy = LruPolicy::new(0);
        policy.on_event(EvictionEvent::Visited(Fqn::root()));
        policy.on_event(EvictionEvent::Visited(BuddyManager::backup_root()));
        assert_eq!(policy.tracked(), 0);
    }
}
