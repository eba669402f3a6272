//! Shared job store.
//!
//! The store is the only coordination point between broker nodes: there is
//! no leader and no lock service. Every operation on [`JobStore`] that
//! changes a job is atomic with respect to that one job, and the dispatcher
//! relies on [`JobStore::claim_next`] being atomic for mutual exclusion.
//!
//! # Backends
//!
//! - [`MemoryJobStore`]: a mutex-guarded map, for single-node use and tests
//! - [`PostgresJobStore`]: a shared PostgreSQL database for a real fleet

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::job::{Job, JobStatus, JobUpdate, NodeId};

pub mod memory;
pub mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PostgresJobStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job store is at capacity")]
    Full,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}

/// Fleet membership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(rename = "_id")]
    pub id: NodeId,
    pub last_seen: DateTime<Utc>,
}

/// One page of jobs, newest submission first.
#[derive(Debug, Clone, Default)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
}

/// Result of a delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// The job has not reached a terminal status and was left in place.
    NotTerminal(JobStatus),
}

#[async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    async fn insert_job(&self, job: Job) -> Result<(), StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn list_jobs(&self, skip: u64, limit: u64) -> Result<JobPage, StoreError>;

    /// Number of jobs in each status; statuses with no jobs may be absent.
    async fn count_by_status(&self) -> Result<Vec<(JobStatus, u64)>, StoreError>;

    /// Distinct queue names currently present in the store.
    async fn queue_names(&self) -> Result<Vec<String>, StoreError>;

    /// Atomically claim the head of a FIFO queue.
    ///
    /// The head is the oldest job (by `submitted`) in `qname` whose status is
    /// `queued` or `running`. If the head is `queued` it becomes `running`,
    /// owned by `node` and started at `now`, all in one update, and the
    /// updated job is returned. If the head is already `running` the queue
    /// is busy and `None` is returned; so is an empty queue.
    async fn claim_next(
        &self,
        qname: &str,
        node: NodeId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Apply `update` to one job and return the updated record.
    async fn update_job(&self, id: Uuid, update: JobUpdate) -> Result<Job, StoreError>;

    /// Flag a job for termination.
    ///
    /// A job still `queued` is failed with "job killed" in the same update
    /// so that it can never be claimed. Returns the updated job, or `None`
    /// if it does not exist.
    async fn request_kill(&self, id: Uuid, now: DateTime<Utc>)
        -> Result<Option<Job>, StoreError>;

    /// Jobs owned by `node` that were flagged for termination and are still
    /// queued or running.
    async fn kill_requested(&self, node: NodeId) -> Result<Vec<Job>, StoreError>;

    /// Move a job owned by `node` from `running` to `stopping`.
    ///
    /// Returns `None`, leaving the job untouched, if it is missing, owned by
    /// another node or no longer `running`. A job that finished after its
    /// kill request was read keeps its terminal status.
    async fn mark_stopping(&self, id: Uuid, node: NodeId) -> Result<Option<Job>, StoreError>;

    /// Delete a job, but only once it has reached a terminal status.
    async fn delete_job(&self, id: Uuid) -> Result<DeleteOutcome, StoreError>;

    /// Upsert the heartbeat record of `node`.
    async fn heartbeat(&self, node: NodeId, now: DateTime<Utc>) -> Result<(), StoreError>;

    async fn nodes(&self) -> Result<Vec<NodeRecord>, StoreError>;

    /// Nodes whose last heartbeat is older than `seen_before`.
    async fn stale_nodes(&self, seen_before: DateTime<Utc>) -> Result<Vec<NodeId>, StoreError>;

    /// Mark every running or stopping job owned by one of `nodes` as
    /// `unknown`, ending it at `now`. Returns the number of jobs changed.
    async fn orphan_jobs(&self, nodes: &[NodeId], now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn remove_nodes(&self, nodes: &[NodeId]) -> Result<u64, StoreError>;

    /// Remove jobs that ended before `threshold`.
    async fn remove_ended_before(&self, threshold: DateTime<Utc>) -> Result<u64, StoreError>;
}
