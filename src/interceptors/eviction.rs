use super::{Interceptor, Next};
use crate::command::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::error::Result;
use crate::eviction::{EvictionEvent, EvictionPolicy};
use async_trait::async_trait;
use std::sync::Arc;

/// Reports node activity to the eviction policy once a command succeeds.
/// Every node a command brought into the tree, implicitly created
/// ancestors included, is reported as created rather than modified.
pub struct EvictionInterceptor {
    policy: Arc<dyn EvictionPolicy>,
}

impl EvictionInterceptor {
    pub fn new(policy: Arc<dyn EvictionPolicy>) -> Self {
        Self { policy }
    }

    fn events(command: &Command, result: &CommandResult) -> Vec<EvictionEvent> {
        match command {
            c if c.is_read() => match (c.fqn(), result.is_hit()) {
                (Some(fqn), true) => vec![EvictionEvent::Visited(fqn.clone())],
                _ => Vec::new(),
            },
            Command::PutKeyValue { fqn, .. }
            | Command::PutDataMap { fqn, .. }
            | Command::RemoveKey { fqn, .. }
            | Command::ClearData { fqn } => vec![EvictionEvent::Modified(fqn.clone())],
            Command::RemoveNode { fqn }
            | Command::Invalidate { fqn, version: None } => {
                vec![EvictionEvent::Removed(fqn.clone())]
            }
            Command::Invalidate { fqn, .. } => vec![EvictionEvent::Evicted(fqn.clone())],
            Command::Evict { fqn, recursive } if result.is_hit() => {
                if *recursive {
                    vec![EvictionEvent::Removed(fqn.clone())]
                } else {
                    vec![EvictionEvent::Evicted(fqn.clone())]
                }
            }
            Command::Move { from, to_parent } => {
                let mut events = vec![EvictionEvent::Removed(from.clone())];
                if let Some(name) = from.last_element() {
                    events.push(EvictionEvent::Modified(to_parent.child(name)));
                }
                events
            }
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl Interceptor for EvictionInterceptor {
    fn name(&self) -> &'static str {
        "eviction"
    }

    async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        let result = next.invoke(ctx, command).await;
        let created = ctx.take_created();
        let result = result?;
        for fqn in &created {
            self.policy.on_event(EvictionEvent::Created(fqn.clone()));
        }
        for event in Self::events(command, &result) {
            if matches!(&event, EvictionEvent::Modified(fqn) if created.contains(fqn)) {
                continue;
            }
            self.policy.on_event(event);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fqn::Fqn;

    #[test]
    fn test_command_events() {
        let hit = CommandResult::Value(Some("v".into()));
        let miss = CommandResult::Value(None);
        let get = Command::get("/a", "k");
        assert_eq!(
            EvictionInterceptor::events(&get, &hit),
            vec![EvictionEvent::Visited(Fqn::parse("/a"))]
        );
        assert!(EvictionInterceptor::events(&get, &miss).is_empty());

        let evict = Command::Evict {
            fqn: Fqn::parse("/a"),
            recursive: false,
        };
        assert_eq!(
            EvictionInterceptor::events(&evict, &CommandResult::Bool(true)),
            vec![EvictionEvent::Evicted(Fqn::parse("/a"))]
        );
        assert!(EvictionInterceptor::events(&evict, &CommandResult::Bool(false)).is_empty());

        let moved = Command::Move {
            from: Fqn::parse("/a/b"),
            to_parent: Fqn::parse("/c"),
        };
        assert_eq!(
            EvictionInterceptor::events(&moved, &CommandResult::None),
            vec![
                EvictionEvent::Removed(Fqn::parse("/a/b")),
                EvictionEvent::Modified(Fqn::parse("/c/b")),
            ]
        );
    }
}
