use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api;
use crate::clock::{Clock, SystemClock};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::images::{ImageCleaner, ImageRegistry};
use crate::runtime::ContainerRuntime;
use crate::scheduler::job::NodeId;
use crate::scheduler::{Dispatcher, LivenessMonitor};
use crate::store::JobStore;
use crate::vault::SecretBroker;
use crate::worker::KillCoordinator;

/// Whether this node takes new work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    Active,
    /// Finishing in-flight jobs before exiting; nothing new is claimed.
    Draining,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Active => "active",
            NodeState::Draining => "draining",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a broker node's loops and handlers share.
///
/// One context is built per process and handed to every component behind an
/// `Arc`; nothing in the crate reaches for global state.
#[derive(Debug)]
pub struct NodeContext {
    pub node_id: NodeId,
    pub config: NodeConfig,
    pub store: Arc<dyn JobStore>,
    pub broker: Arc<dyn SecretBroker>,
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Images used by jobs on this node and when
    pub images: ImageRegistry,
    pub clock: Arc<dyn Clock>,
    state: Mutex<NodeState>,
    slots: Arc<Semaphore>,
}

impl NodeContext {
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn JobStore>,
        broker: Arc<dyn SecretBroker>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        Self {
            node_id: Uuid::new_v4(),
            config,
            store,
            broker,
            runtime,
            images: ImageRegistry::default(),
            clock: Arc::new(SystemClock),
            state: Mutex::new(NodeState::Active),
            slots,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_draining(&self) -> bool {
        self.state() == NodeState::Draining
    }

    /// Stop taking new work. Returns false if the node was already draining.
    pub fn begin_drain(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let was_active = *state == NodeState::Active;
        *state = NodeState::Draining;
        was_active
    }

    /// Execution slots; a job holds one permit for as long as it runs.
    pub fn slots(&self) -> &Arc<Semaphore> {
        &self.slots
    }

    /// Jobs currently executing on this node.
    pub fn running_jobs(&self) -> usize {
        self.config
            .max_concurrent_jobs
            .saturating_sub(self.slots.available_permits())
    }
}

/// A broker node: the HTTP API plus the periodic loops, all sharing one
/// [`NodeContext`].
pub struct Node {
    ctx: Arc<NodeContext>,
}

impl Node {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// 1. Validates the configuration, then runs one liveness cycle
    ///    synchronously; a store failure here is fatal
    /// 2. Spawns the dispatcher, liveness, kill and image cleanup loops
    /// 3. Spawns the drain watcher, which cancels `shutdown` once a draining
    ///    node has no jobs left
    /// 4. Serves the HTTP API until `shutdown` is cancelled
    ///
    /// # Errors
    ///
    /// Returns an error if the first liveness cycle fails or the API cannot
    /// bind its listen address. Invalid configuration is rejected up front.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.ctx.config.validate()?;
        let liveness = LivenessMonitor::new(self.ctx.clone());
        let report = liveness.cycle().await?;
        tracing::info!(
            node_uuid = %self.ctx.node_id,
            stale_nodes = report.stale_nodes.len(),
            "Node registered"
        );

        let listener = tokio::net::TcpListener::bind(self.ctx.config.listen_addr).await?;

        let dispatcher = Dispatcher::new(self.ctx.clone());
        tokio::spawn(dispatcher.run(shutdown.clone()));
        tokio::spawn(liveness.run(shutdown.clone()));
        tokio::spawn(KillCoordinator::new(self.ctx.clone()).run(shutdown.clone()));
        tokio::spawn(ImageCleaner::new(self.ctx.clone()).run(shutdown.clone()));
        tokio::spawn(Self::drain_watcher(self.ctx.clone(), shutdown.clone()));

        tracing::info!(
            addr = %self.ctx.config.listen_addr,
            node_uuid = %self.ctx.node_id,
            "Broker API listening"
        );
        axum::serve(listener, api::router(self.ctx.clone()))
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await?;

        tracing::info!(running_jobs = self.ctx.running_jobs(), "Node stopped");
        Ok(())
    }

    /// Cancel `shutdown` once the node is draining and idle.
    async fn drain_watcher(ctx: Arc<NodeContext>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => {
                    if ctx.is_draining() && ctx.running_jobs() == 0 {
                        tracing::info!("Drain complete, shutting down");
                        shutdown.cancel();
                        return;
                    }
                }
            }
        }
    }
}
