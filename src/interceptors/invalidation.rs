use super::{Interceptor, Next};
use crate::cache::CacheComponents;
use crate::command::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::error::{Error, Result};
use crate::fqn::Fqn;
use crate::tree::undo::undo_all;
use crate::version::DataVersion;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Tells peers to drop their copy of every path a local write changed,
/// instead of shipping the new data. Under the workspace schemes the
/// invalidation carries the committed version so peers holding a newer
/// copy keep it.
pub struct InvalidationInterceptor {
    components: Arc<CacheComponents>,
}

impl InvalidationInterceptor {
    pub fn new(components: Arc<CacheComponents>) -> Self {
        Self { components }
    }

    async fn invalidate(
        &self,
        targets: Vec<(Fqn, Option<DataVersion>)>,
        sync: bool,
    ) -> Result<()> {
        let rpc = self
            .components
            .rpc
            .as_ref()
            .ok_or_else(|| Error::Internal("invalidating cache has no transport".to_string()))?;
        let metrics = &self.components.metrics;
        for (fqn, version) in targets {
            debug!(fqn = %fqn, ?version, sync, "Invalidating peers");
            let command = Command::Invalidate { fqn, version };
            match rpc.replicate(&command, sync, self.components.sync_timeout()).await {
                Ok(()) => metrics.count(&metrics.replications),
                Err(e) => {
                    metrics.count(&metrics.replication_failures);
                    if sync {
                        return Err(e);
                    }
                    warn!(command = %command, error = %e, "Asynchronous invalidation failed");
                }
            }
        }
        Ok(())
    }
}

/// Paths changed by `commands`, first occurrence first. Puts for
/// external reads never invalidate.
fn dedup_fqns(commands: &[Command]) -> Vec<Fqn> {
    let mut fqns: Vec<Fqn> = Vec::new();
    let invalidating = commands.iter().filter(|c| {
        !matches!(
            c,
            Command::PutKeyValue {
                put_for_external_read: true,
                ..
            }
        )
    });
    for fqn in invalidating.flat_map(|c| c.modified_fqns()) {
        if !fqns.contains(&fqn) {
            fqns.push(fqn);
        }
    }
    fqns
}

#[async_trait]
impl Interceptor for InvalidationInterceptor {
    fn name(&self) -> &'static str {
        "invalidation"
    }

    async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        if !ctx.is_origin_local() || ctx.options.cache_mode_local {
            return next.invoke(ctx, command).await;
        }

        match command {
            Command::Commit { .. } => {
                let entry = ctx.entry().cloned();
                let result = next.invoke(ctx, command).await?;
                let Some(entry) = entry else {
                    return Ok(result);
                };
                let versions = entry.prepared_versions();
                let targets: Vec<_> = dedup_fqns(&entry.modifications())
                    .into_iter()
                    .map(|fqn| {
                        let version = versions
                            .iter()
                            .find(|(f, _)| *f == fqn)
                            .map(|(_, v)| v.clone());
                        (fqn, version)
                    })
                    .collect();
                self.invalidate(targets, self.components.is_synchronous(ctx))
                    .await?;
                Ok(result)
            }
            c if c.is_write() && !ctx.in_transaction() => {
                let sync = self.components.is_synchronous(ctx);
                let targets: Vec<_> = dedup_fqns(std::slice::from_ref(command))
                    .into_iter()
                    .map(|fqn| (fqn, None))
                    .collect();
                let owns_undo = sync && ctx.begin_call_undo();
                let outcome = match next.invoke(ctx, command).await {
                    Ok(result) => match self.invalidate(targets, sync).await {
                        Err(e) if ctx.options.fail_silently => {
                            debug!(command = %command, error = %e, "Ignoring invalidation failure");
                            Ok(result)
                        }
                        other => other.map(|()| result),
                    },
                    Err(e) => Err(e),
                };
                let undo = if owns_undo { ctx.end_call_undo() } else { Vec::new() };
                if outcome.is_err() && !undo.is_empty() {
                    debug!(command = %command, "Reverting local write after failed invalidation");
                    undo_all(undo, &self.components.container);
                }
                outcome
            }
            _ => next.invoke(ctx, command).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modified_paths_are_deduplicated_in_order() {
        let commands = vec![
            Command::put("/a", "k", "1"),
            Command::put("/b", "k", "2"),
            Command::put("/a", "j", "3"),
            Command::Move {
                from: Fqn::parse("/b"),
                to_parent: Fqn::parse("/c"),
            },
            Command::PutKeyValue {
                fqn: Fqn::parse("/d"),
                key: "k".to_string(),
                value: "4".into(),
                put_for_external_read: true,
            },
        ];
        assert_eq!(
            dedup_fqns(&commands),
            vec![Fqn::parse("/a"), Fqn::parse("/b"), Fqn::parse("/c/b")]
        );
    }
}
