use super::{Interceptor, Next};
use crate::cache::CacheComponents;
use crate::command::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// Outermost stage: hit/miss, store and remove counts and latencies.
pub struct CacheMgmtInterceptor {
    components: Arc<CacheComponents>,
}

impl CacheMgmtInterceptor {
    pub fn new(components: Arc<CacheComponents>) -> Self {
        Self { components }
    }
}

#[async_trait]
impl Interceptor for CacheMgmtInterceptor {
    fn name(&self) -> &'static str {
        "stats"
    }

    async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        let metrics = &self.components.metrics;
        if !metrics.is_enabled() {
            return next.invoke(ctx, command).await;
        }

        let start = Instant::now();
        let result = next.invoke(ctx, command).await;
        if let Ok(outcome) = &result {
            match command {
                c if c.is_read() => metrics.record_read(outcome.is_hit(), start.elapsed()),
                Command::PutKeyValue { .. } | Command::PutDataMap { .. } => {
                    metrics.record_store(start.elapsed())
                }
                Command::RemoveKey { .. } | Command::RemoveNode { .. } => metrics.record_remove(),
                _ => {}
            }
        }
        result
    }
}
