use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::node::NodeContext;
use crate::worker::{ExecutionResult, JobExecutor};

/// Claims work from the shared queues and starts executing it.
///
/// Every queue is strictly serial across the whole fleet: a queue whose
/// oldest unfinished job is already running is skipped until that job
/// finishes, whichever node runs it.
pub struct Dispatcher {
    ctx: Arc<NodeContext>,
    executor: JobExecutor,
}

impl Dispatcher {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        let executor = JobExecutor::new(ctx.clone());
        Self { ctx, executor }
    }

    /// One dispatch tick over every queue. Returns the executions started.
    pub async fn poll_once(&self) -> Vec<JoinHandle<ExecutionResult>> {
        let mut started = Vec::new();
        if self.ctx.is_draining() {
            return started;
        }

        let queues = match self.ctx.store.queue_names().await {
            Ok(queues) => queues,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list queues");
                return started;
            }
        };

        for qname in queues {
            let Ok(permit) = self.ctx.slots().clone().try_acquire_owned() else {
                tracing::debug!(
                    running = self.ctx.running_jobs(),
                    "Node at capacity, not claiming"
                );
                break;
            };

            let job = match self
                .ctx
                .store
                .claim_next(&qname, self.ctx.node_id, self.ctx.now())
                .await
            {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(qname = %qname, error = %e, "Failed to claim from queue");
                    continue;
                }
            };

            tracing::info!(job_id = %job.id, qname = %qname, "Job claimed");
            let executor = self.executor.clone();
            started.push(tokio::spawn(async move {
                let _permit = permit;
                executor.execute(job).await
            }));
        }
        started
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.ctx.config.dispatch_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.poll_once().await;
                }
            }
        }
        tracing::debug!("Dispatcher stopped");
    }
}
