use super::RpcManager;
use crate::command::Command;
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

/// Collects asynchronously replicated commands and ships them as one
/// ordered batch, either on a timer or once `max_elements` are pending.
pub struct ReplicationQueue {
    rpc: Arc<RpcManager>,
    pending: Mutex<Vec<Command>>,
    max_elements: usize,
    timeout: Duration,
    flush_now: Notify,
    /// Held from taking a batch until it is sent, so batches leave in order.
    flushing: AsyncMutex<()>,
}

impl ReplicationQueue {
    pub fn new(rpc: Arc<RpcManager>, max_elements: usize, timeout: Duration) -> Self {
        Self {
            rpc,
            pending: Mutex::new(Vec::new()),
            max_elements,
            timeout,
            flush_now: Notify::new(),
            flushing: AsyncMutex::new(()),
        }
    }

    pub fn enqueue(&self, command: Command) {
        let len = {
            let mut pending = self.pending.lock();
            pending.push(command);
            pending.len()
        };
        if self.max_elements > 0 && len >= self.max_elements {
            self.flush_now.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Send everything pending as one batch.
    pub async fn flush(&self) -> Result<usize> {
        let _flushing = self.flushing.lock().await;
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        self.rpc.replicate_batch(&batch, self.timeout).await?;
        debug!(count, "Flushed replication queue");
        Ok(count)
    }

    /// Flush every `interval`, or sooner when the queue fills, until a
    /// shutdown signal arrives. Pending commands are flushed on the way
    /// out.
    pub async fn run_flush_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.flush_now.notified() => {}
                _ = shutdown_rx.recv() => {
                    if let Err(e) = self.flush().await {
                        warn!(error = %e, "Final replication queue flush failed");
                    }
                    info!("Replication queue flush loop shutting down");
                    break;
                }
            }
            if let Err(e) = self.flush().await {
                warn!(error = %e, "Replication queue flush failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalCluster;

    #[tokio::test]
    async fn test_enqueue_and_flush_without_peers() {
        let cluster = LocalCluster::new();
        let transport = cluster.join();
        let rpc = Arc::new(RpcManager::new(transport, None));
        let queue = ReplicationQueue::new(rpc, 10, Duration::from_secs(1));

        queue.enqueue(Command::put("/a", "k", "v"));
        queue.enqueue(Command::remove_node("/a"));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.flush().await.unwrap(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.flush().await.unwrap(), 0);
    }
}
