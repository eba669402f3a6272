use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::job::NodeId;
use super::timer::splayed;
use crate::node::NodeContext;
use crate::store::StoreError;

/// What one liveness cycle changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub stale_nodes: Vec<NodeId>,
    /// Jobs of stale nodes moved to `unknown`
    pub orphaned_jobs: u64,
    /// Finished jobs removed after the retention window
    pub expired_jobs: u64,
}

/// Keeps this node's heartbeat fresh and cleans up after nodes that died.
///
/// There is no leader: every node runs the same cycle, and the store
/// operations it issues are idempotent, so concurrent cycles on several
/// nodes are harmless.
pub struct LivenessMonitor {
    ctx: Arc<NodeContext>,
}

impl LivenessMonitor {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub async fn cycle(&self) -> Result<CycleReport, StoreError> {
        let store = &self.ctx.store;
        let config = &self.ctx.config;
        let now = self.ctx.now();

        store.heartbeat(self.ctx.node_id, now).await?;

        let mut report = CycleReport::default();
        let stale: Vec<NodeId> = store
            .stale_nodes(now - config.stale_node_threshold)
            .await?
            .into_iter()
            .filter(|id| *id != self.ctx.node_id)
            .collect();

        if !stale.is_empty() {
            report.orphaned_jobs = store.orphan_jobs(&stale, now).await?;
            store.remove_nodes(&stale).await?;
            tracing::warn!(
                stale_nodes = ?stale,
                orphaned_jobs = report.orphaned_jobs,
                "Recovered jobs of stale nodes"
            );
            report.stale_nodes = stale;
        }

        report.expired_jobs = store.remove_ended_before(now - config.job_retention).await?;
        if report.expired_jobs > 0 {
            tracing::info!(expired_jobs = report.expired_jobs, "Removed expired jobs");
        }
        tracing::debug!(node_uuid = %self.ctx.node_id, "Heartbeat");
        Ok(report)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let config = &self.ctx.config;
        loop {
            let delay = splayed(config.heartbeat_interval, config.heartbeat_splay);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(e) = self.cycle().await {
                tracing::error!(error = %e, "Liveness cycle failed");
            }
        }
        tracing::debug!("Liveness monitor stopped");
    }
}
