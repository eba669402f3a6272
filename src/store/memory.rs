use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{DeleteOutcome, JobPage, JobStore, NodeRecord, StoreError};
use crate::scheduler::job::{Job, JobStatus, JobUpdate, NodeId};

const DEFAULT_MAX_JOBS: usize = 10_000;

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    nodes: HashMap<NodeId, DateTime<Utc>>,
}

/// Process-local job store.
///
/// Every operation holds a single lock for its whole duration, which makes
/// each of them atomic with respect to every other caller sharing the store.
#[derive(Debug)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    max_jobs: usize,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_jobs,
        }
    }

    /// Returns the current number of jobs in the store
    pub async fn len(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    /// Returns true if the store holds no jobs
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: Job) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.jobs.len() >= self.max_jobs {
            return Err(StoreError::Full);
        }
        inner.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.lock().await.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, skip: u64, limit: u64) -> Result<JobPage, StoreError> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<&Job> = inner.jobs.values().collect();
        jobs.sort_by(|a, b| b.submitted.cmp(&a.submitted));
        Ok(JobPage {
            total: jobs.len() as u64,
            jobs: jobs
                .into_iter()
                .skip(skip as usize)
                .take(limit as usize)
                .cloned()
                .collect(),
        })
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, u64)>, StoreError> {
        let inner = self.inner.lock().await;
        let mut counts: HashMap<JobStatus, u64> = HashMap::new();
        for job in inner.jobs.values() {
            *counts.entry(job.status).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn queue_names(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        let names: BTreeSet<&String> = inner.jobs.values().map(|j| &j.qname).collect();
        Ok(names.into_iter().cloned().collect())
    }

    async fn claim_next(
        &self,
        qname: &str,
        node: NodeId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.lock().await;

        let head = inner
            .jobs
            .values_mut()
            .filter(|j| {
                j.qname == qname && matches!(j.status, JobStatus::Queued | JobStatus::Running)
            })
            .min_by_key(|j| j.submitted);

        match head {
            Some(job) if job.status == JobStatus::Queued => {
                job.status = JobStatus::Running;
                job.node_uuid = Some(node);
                job.started = Some(now);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn update_job(&self, id: Uuid, update: JobUpdate) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        update.apply(job);
        Ok(job.clone())
    }

    async fn request_kill(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.kill_requested = true;
        if job.status == JobStatus::Queued {
            JobUpdate::finished(JobStatus::Failed, "job killed", now).apply(job);
        }
        Ok(Some(job.clone()))
    }

    async fn kill_requested(&self, node: NodeId) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| {
                j.node_uuid == Some(node)
                    && j.kill_requested
                    && matches!(j.status, JobStatus::Queued | JobStatus::Running)
            })
            .cloned()
            .collect())
    }

    async fn mark_stopping(&self, id: Uuid, node: NodeId) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(&id) {
            Some(job) if job.node_uuid == Some(node) && job.status == JobStatus::Running => {
                job.status = JobStatus::Stopping;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_job(&self, id: Uuid) -> Result<DeleteOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get(&id).map(|j| j.status) {
            None => Ok(DeleteOutcome::NotFound),
            Some(status) if !status.is_terminal() => Ok(DeleteOutcome::NotTerminal(status)),
            Some(_) => {
                inner.jobs.remove(&id);
                Ok(DeleteOutcome::Deleted)
            }
        }
    }

    async fn heartbeat(&self, node: NodeId, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.lock().await.nodes.insert(node, now);
        Ok(())
    }

    async fn nodes(&self) -> Result<Vec<NodeRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .nodes
            .iter()
            .map(|(id, last_seen)| NodeRecord {
                id: *id,
                last_seen: *last_seen,
            })
            .collect())
    }

    async fn stale_nodes(&self, seen_before: DateTime<Utc>) -> Result<Vec<NodeId>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .nodes
            .iter()
            .filter(|(_, last_seen)| **last_seen < seen_before)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn orphan_jobs(&self, nodes: &[NodeId], now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut changed = 0;
        for job in inner.jobs.values_mut() {
            let owned = job.node_uuid.is_some_and(|owner| nodes.contains(&owner));
            if owned && job.status.is_active() {
                job.status = JobStatus::Unknown;
                job.ended.get_or_insert(now);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn remove_nodes(&self, nodes: &[NodeId]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.nodes.len();
        inner.nodes.retain(|id, _| !nodes.contains(id));
        Ok((before - inner.nodes.len()) as u64)
    }

    async fn remove_ended_before(&self, threshold: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, job| !job.ended.is_some_and(|ended| ended < threshold));
        Ok((before - inner.jobs.len()) as u64)
    }
}
