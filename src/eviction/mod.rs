//! Eviction: a policy tracks node activity and picks victims; a
//! background loop evicts them through the pipeline.

mod lru;

pub use lru::LruPolicy;

use crate::cache::CacheComponents;
use crate::command::{Command, CommandResult};
use crate::context::{InvocationContext, InvocationOptions};
use crate::fqn::Fqn;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Node activity reported to the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionEvent {
    /// A read found the node.
    Visited(Fqn),
    /// A write created the node.
    Created(Fqn),
    /// A write changed the node.
    Modified(Fqn),
    /// The node and its subtree are gone.
    Removed(Fqn),
    /// The node's data left memory; its children stay.
    Evicted(Fqn),
}

/// Decides which nodes leave memory.
pub trait EvictionPolicy: Send + Sync {
    fn on_event(&self, event: EvictionEvent);

    /// Nodes to evict now, most urgent first.
    fn select_victims(&self) -> Vec<Fqn>;
}

/// Evict every victim the policy currently selects. Returns how many
/// were evicted.
///
/// Evictions are local, never wait for a lock, and skip nodes that are
/// busy; those stay tracked and are retried on the next pass.
pub async fn evict_victims(components: &CacheComponents, policy: &dyn EvictionPolicy) -> usize {
    let victims = policy.select_victims();
    if victims.is_empty() {
        return 0;
    }
    debug!(count = victims.len(), "Evicting nodes");

    let mut evicted = 0;
    for fqn in victims {
        let options = InvocationOptions::new()
            .cache_mode_local()
            .fail_silently()
            .with_lock_acquisition_timeout(Duration::ZERO);
        let mut ctx = InvocationContext::local(options, None);
        let command = Command::Evict {
            fqn: fqn.clone(),
            recursive: false,
        };
        match components.invoke(&mut ctx, &command).await {
            Ok(CommandResult::Bool(true)) => evicted += 1,
            Ok(CommandResult::Bool(false)) => policy.on_event(EvictionEvent::Removed(fqn)),
            Ok(_) => trace!(fqn = %fqn, "Node busy, eviction deferred"),
            Err(e) => debug!(fqn = %fqn, error = %e, "Eviction failed"),
        }
    }
    evicted
}

/// Run [`evict_victims`] every `interval` until shutdown or until the
/// cache is gone.
pub async fn run_eviction_loop(
    components: Weak<CacheComponents>,
    policy: Arc<dyn EvictionPolicy>,
    interval: Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(components) = components.upgrade() else {
                    break;
                };
                evict_victims(&components, policy.as_ref()).await;
            }
            _ = shutdown_rx.recv() => {
                info!("Eviction loop shutting down");
                break;
            }
        }
    }
}
