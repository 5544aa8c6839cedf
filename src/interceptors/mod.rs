//! The command pipeline.
//!
//! Every operation runs as a [`Command`] through an [`InterceptorChain`]:
//! an ordered list of stages built once at cache start from the
//! configuration. A stage does its work before and/or after handing the
//! command to the rest of the chain through [`Next`], or short-circuits
//! by returning without calling it.
//!
//! Stage order:
//!
//! ```text
//! stats -> tx -> (pessimistic lock | optimistic validator)
//!       -> [cache loader] -> [cache store | passivation]
//!       -> [data gravitator] -> [replication | invalidation]
//!       -> [eviction] -> [optimistic node] -> call
//! ```
//!
//! The transaction stage wraps locking so that completion releases every
//! lock the transaction took; locking wraps loading so a load never races
//! a write to the same node.

mod call;
mod eviction;
mod gravitation;
mod invalidation;
mod loader;
mod optimistic;
mod pessimistic;
mod replication;
mod stats;
mod tx;

pub use call::CallInterceptor;
pub use eviction::EvictionInterceptor;
pub use gravitation::DataGravitatorInterceptor;
pub use invalidation::InvalidationInterceptor;
pub use loader::{CacheLoaderInterceptor, CacheStoreInterceptor};
pub use optimistic::{OptimisticNodeInterceptor, OptimisticValidatorInterceptor};
pub use pessimistic::PessimisticLockInterceptor;
pub use replication::ReplicationInterceptor;
pub use stats::CacheMgmtInterceptor;
pub use tx::TxInterceptor;

use crate::cache::CacheComponents;
use crate::command::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// One stage of the pipeline.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Stage name, for logging.
    fn name(&self) -> &'static str;

    /// Handle `command`, delegating to `next` unless this stage answers
    /// it itself.
    async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult>;
}

/// Handle on the remainder of the chain after the current stage.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a InterceptorChain,
    index: usize,
}

impl<'a> Next<'a> {
    /// Run the rest of the chain.
    pub async fn invoke(
        self,
        ctx: &mut InvocationContext,
        command: &Command,
    ) -> Result<CommandResult> {
        self.chain.invoke_at(self.index, ctx, command).await
    }

    /// The whole chain, for stages that issue nested commands from the
    /// top.
    pub fn chain(&self) -> &'a InterceptorChain {
        self.chain
    }
}

/// Ordered list of stages.
pub struct InterceptorChain {
    stages: Vec<Arc<dyn Interceptor>>,
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.stage_names()).finish()
    }
}

impl InterceptorChain {
    pub fn new(stages: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { stages }
    }

    /// Build the chain for a cache from its configuration and plugged-in
    /// capabilities.
    pub fn build(components: &Arc<CacheComponents>) -> Self {
        let config = &components.config;
        let scheme = config.locking.scheme;
        let mut stages: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(CacheMgmtInterceptor::new(components.clone())),
            Arc::new(TxInterceptor::new(components.clone())),
        ];

        if scheme.uses_workspace() {
            stages.push(Arc::new(OptimisticValidatorInterceptor::new(
                components.clone(),
            )));
        } else {
            stages.push(Arc::new(PessimisticLockInterceptor::new(components.clone())));
        }

        if let Some(loader) = &components.loader {
            stages.push(Arc::new(CacheLoaderInterceptor::new(
                components.clone(),
                loader.clone(),
            )));
            stages.push(Arc::new(CacheStoreInterceptor::new(
                components.clone(),
                loader.clone(),
            )));
        }

        if components.buddy.is_some() {
            stages.push(Arc::new(DataGravitatorInterceptor::new(components.clone())));
        }

        if config.cache_mode.is_replication() {
            stages.push(Arc::new(ReplicationInterceptor::new(components.clone())));
        } else if config.cache_mode.is_invalidation() {
            stages.push(Arc::new(InvalidationInterceptor::new(components.clone())));
        }

        if let Some(policy) = &components.eviction {
            stages.push(Arc::new(EvictionInterceptor::new(policy.clone())));
        }

        if scheme.uses_workspace() {
            stages.push(Arc::new(OptimisticNodeInterceptor::new(components.clone())));
        }

        stages.push(Arc::new(CallInterceptor::new(components.clone())));

        let chain = Self::new(stages);
        debug!(stages = ?chain.stage_names(), "Built interceptor chain");
        chain
    }

    /// Run `command` through the whole chain.
    pub async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
    ) -> Result<CommandResult> {
        self.invoke_at(0, ctx, command).await
    }

    async fn invoke_at(
        &self,
        index: usize,
        ctx: &mut InvocationContext,
        command: &Command,
    ) -> Result<CommandResult> {
        match self.stages.get(index) {
            Some(stage) => {
                let next = Next {
                    chain: self,
                    index: index + 1,
                };
                stage.invoke(ctx, command, next).await
            }
            None => Ok(CommandResult::None),
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InvocationOptions;
    use crate::fqn::Fqn;
    use parking_lot::Mutex;

    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Interceptor for Record {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn invoke(
            &self,
            ctx: &mut InvocationContext,
            command: &Command,
            next: Next<'_>,
        ) -> Result<CommandResult> {
            self.log.lock().push(format!("{}:before", self.name));
            let result = next.invoke(ctx, command).await;
            self.log.lock().push(format!("{}:after", self.name));
            result
        }
    }

    struct Answer;

    #[async_trait]
    impl Interceptor for Answer {
        fn name(&self) -> &'static str {
            "answer"
        }

        async fn invoke(
            &self,
            _ctx: &mut InvocationContext,
            _command: &Command,
            _next: Next<'_>,
        ) -> Result<CommandResult> {
            Ok(CommandResult::Bool(true))
        }
    }

    #[tokio::test]
    async fn test_stages_wrap_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::new(vec![
            Arc::new(Record {
                name: "outer",
                log: log.clone(),
            }),
            Arc::new(Record {
                name: "inner",
                log: log.clone(),
            }),
            Arc::new(Answer),
        ]);
        assert_eq!(chain.stage_names(), vec!["outer", "inner", "answer"]);

        let mut ctx = InvocationContext::local(InvocationOptions::new(), None);
        let result = chain
            .invoke(&mut ctx, &Command::Exists { fqn: Fqn::root() })
            .await
            .unwrap();
        assert!(result.into_bool());
        assert_eq!(
            *log.lock(),
            vec!["outer:before", "inner:before", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn test_end_of_chain_returns_none() {
        let chain = InterceptorChain::new(Vec::new());
        let mut ctx = InvocationContext::local(InvocationOptions::new(), None);
        let result = chain
            .invoke(&mut ctx, &Command::Exists { fqn: Fqn::root() })
            .await
            .unwrap();
        assert_eq!(result, CommandResult::None);
        assert!(chain.is_empty());
    }
}
