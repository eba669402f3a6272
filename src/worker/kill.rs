use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::node::NodeContext;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::store::StoreError;

/// Stops the containers of jobs on this node that were asked to terminate.
///
/// The coordinator only signals the container. The executor running the job
/// notices the kill request when the container exits (or at its next
/// checkpoint) and records the job as failed.
pub struct KillCoordinator {
    ctx: Arc<NodeContext>,
}

impl KillCoordinator {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Handle every pending kill request once. Returns the stop tasks spawned.
    pub async fn poll_once(&self) -> Result<Vec<JoinHandle<()>>, StoreError> {
        let jobs = self.ctx.store.kill_requested(self.ctx.node_id).await?;
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            if job.container_id.is_empty() {
                // No container yet; the executor's own checkpoints catch it.
                tracing::debug!(job_id = %job.id, "Kill requested before container creation");
                continue;
            }

            let Some(job) = self.ctx.store.mark_stopping(job.id, self.ctx.node_id).await? else {
                tracing::debug!(job_id = %job.id, "Job finished before it could be stopped");
                continue;
            };
            tracing::info!(job_id = %job.id, container_id = %job.container_id, "Stopping container");

            let runtime = self.ctx.runtime.clone();
            let timeout = self.ctx.config.stop_timeout;
            handles.push(tokio::spawn(stop_then_kill(
                runtime,
                job.container_id,
                timeout,
            )));
        }
        Ok(handles)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.ctx.config.kill_poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!(error = %e, "Kill request poll failed");
                    }
                }
            }
        }
        tracing::debug!("Kill coordinator stopped");
    }
}

/// Graceful stop with a grace period, then a forced kill.
pub async fn stop_then_kill(runtime: Arc<dyn ContainerRuntime>, id: String, timeout: Duration) {
    if let Err(e) = runtime.stop(&id, timeout).await {
        tracing::error!(container_id = %id, error = %e, "Stop container request failed");
    }
    match runtime.kill(&id).await {
        Ok(()) => tracing::info!(container_id = %id, "Killed container"),
        Err(RuntimeError::NotRunning(_)) => {
            tracing::debug!(container_id = %id, "Container already stopped");
        }
        Err(e) => tracing::error!(container_id = %id, error = %e, "Kill container request failed"),
    }
}
