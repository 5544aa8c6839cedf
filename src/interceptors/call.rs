use super::{Interceptor, Next};
use crate::cache::CacheComponents;
use crate::command::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::error::Result;
use crate::notifications::CacheEvent;
use async_trait::async_trait;
use std::sync::Arc;

/// Innermost stage: applies the command to the tree and publishes the
/// resulting events. Pessimistic transactions get an undo log, as do
/// writes whose synchronous propagation may still fail.
pub struct CallInterceptor {
    components: Arc<CacheComponents>,
}

impl CallInterceptor {
    pub fn new(components: Arc<CacheComponents>) -> Self {
        Self { components }
    }
}

#[async_trait]
impl Interceptor for CallInterceptor {
    fn name(&self) -> &'static str {
        "call"
    }

    async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        _next: Next<'_>,
    ) -> Result<CommandResult> {
        let container = &self.components.container;
        let entry = ctx
            .entry()
            .filter(|_| !self.components.scheme().uses_workspace())
            .cloned();
        let outcome = match entry {
            Some(entry) => entry.with_undo(|undo| command.apply(container, Some(undo)))?,
            None => command.apply(container, ctx.call_undo_mut())?,
        };

        if let (true, Some(version), Some(fqn)) = (
            command.is_write(),
            ctx.options.data_version.as_ref(),
            command.fqn(),
        ) {
            if let Some(node) = container.peek_valid(fqn) {
                node.set_version(version.clone());
            }
        }

        ctx.note_created(&outcome.events);
        let metrics = &self.components.metrics;
        for event in &outcome.events {
            if matches!(event, CacheEvent::NodeEvicted(_)) {
                metrics.count(&metrics.evictions);
            }
        }
        self.components
            .notifier
            .notify_all(&outcome.events, ctx.is_origin_local());
        Ok(outcome.result)
    }
}
