use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{BrokerError, Result};

/// Container hardening applied to every job container.
///
/// Jobs run as an unprivileged service account inside the container; these
/// flags add resource limits and drop privileges on top of that.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container runtime CLI to invoke
    pub docker_binary: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
    /// Drop all Linux capabilities and forbid privilege escalation
    pub drop_privileges: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            network_disabled: false,
            memory_limit: None,
            cpu_limit: None,
            drop_privileges: true,
        }
    }
}

/// Secret broker (Vault) connection settings.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Base address, e.g. `https://vault.example.com:8200`
    pub addr: String,
    /// AppRole role id this broker authenticates jobs under.
    pub role_id: String,
    /// AppRole role name; also names the transit key used to decrypt payloads.
    pub role_name: String,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            addr: "http://127.0.0.1:8200".to_string(),
            role_id: String::new(),
            role_name: String::new(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Which job store backend to use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StoreConfig {
    /// Process-local store; only useful for a single node or tests.
    #[default]
    Memory,
    /// Shared PostgreSQL database.
    Postgres { url: String, pool_size: u32 },
}

/// Timings, thresholds and limits for one broker node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    /// How often the dispatcher looks for claimable work
    pub dispatch_interval: Duration,
    /// Base heartbeat interval of the liveness monitor
    pub heartbeat_interval: Duration,
    /// Upper bound of the random splay added to each heartbeat interval
    pub heartbeat_splay: Duration,
    /// A node not seen for this long is presumed crashed. Must exceed
    /// `heartbeat_interval + heartbeat_splay`, the longest legitimate gap
    /// between two heartbeats.
    pub stale_node_threshold: chrono::Duration,
    /// Finished jobs are removed this long after they ended
    pub job_retention: chrono::Duration,
    /// How often the kill coordinator polls for kill requests
    pub kill_poll_interval: Duration,
    /// Grace period given to a container before it is killed
    pub stop_timeout: Duration,
    /// Upper bound on jobs executing concurrently on this node
    pub max_concurrent_jobs: usize,
    /// Number of attempts for an image pull before the job fails
    pub pull_attempts: usize,
    /// Base delay between image pull attempts
    pub pull_backoff: Duration,
    /// Registry used to qualify image names without a registry host
    pub default_registry: String,
    pub image_cleanup_interval: Duration,
    pub image_cleanup_splay: Duration,
    /// Images unused by any job for this long are removed from the host
    pub image_retention: chrono::Duration,
    pub sandbox: SandboxConfig,
    pub vault: VaultConfig,
    pub store: StoreConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "0.0.0.0:3232"
                .parse()
                .expect("default listen address is valid"),
            dispatch_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_splay: Duration::from_secs(60),
            stale_node_threshold: chrono::Duration::minutes(3),
            job_retention: chrono::Duration::hours(6),
            kill_poll_interval: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(15),
            max_concurrent_jobs: 8,
            pull_attempts: 5,
            pull_backoff: Duration::from_secs(1),
            default_registry: "docker.io".to_string(),
            image_cleanup_interval: Duration::from_secs(60),
            image_cleanup_splay: Duration::from_secs(60),
            image_retention: chrono::Duration::hours(24),
            sandbox: SandboxConfig::default(),
            vault: VaultConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_vault(mut self, vault: VaultConfig) -> Self {
        self.vault = vault;
        self
    }

    /// Reject settings under which healthy peers would be declared stale.
    pub fn validate(&self) -> Result<()> {
        let max_gap = chrono::Duration::from_std(self.heartbeat_interval + self.heartbeat_splay)
            .map_err(|e| BrokerError::Config(format!("heartbeat interval out of range: {e}")))?;
        if self.stale_node_threshold <= max_gap {
            return Err(BrokerError::Config(format!(
                "stale node threshold ({}s) must exceed heartbeat interval plus splay ({}s)",
                self.stale_node_threshold.num_seconds(),
                max_gap.num_seconds(),
            )));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(BrokerError::Config(
                "max concurrent jobs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
