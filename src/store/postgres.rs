//! PostgreSQL job store.
//!
//! The queue head claim is a single `UPDATE ... FROM (SELECT ... FOR UPDATE)`
//! statement. A competing claimer blocks on the row lock of the head; when it
//! resumes it sees the head as `running` and backs off, so only one node can
//! ever move a given job out of `queued`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{DeleteOutcome, JobPage, JobStore, NodeRecord, StoreError};
use crate::scheduler::job::{Job, JobStatus, JobUpdate, NodeId};

static MIGRATOR: Migrator = sqlx::migrate!();

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    node_uuid: Option<Uuid>,
    qname: String,
    wrap_secret_id: String,
    cubby_token: String,
    cubby_path: String,
    payload: String,
    container_image: String,
    image_pull_policy: String,
    content: String,
    entrypoint: Vec<String>,
    run: Vec<String>,
    working_directory: String,
    env_vars: Vec<String>,
    secret_refs: Vec<String>,
    secret_file_type: String,
    cont_on_warnings: bool,
    status: String,
    return_code: i32,
    submitted: DateTime<Utc>,
    started: Option<DateTime<Utc>>,
    ended: Option<DateTime<Utc>>,
    output: String,
    container_id: String,
    kill_requested: bool,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<JobStatus>().map_err(|e| StoreError::Corrupt {
            id: row.id,
            reason: e.to_string(),
        })?;
        Ok(Job {
            id: row.id,
            node_uuid: row.node_uuid,
            qname: row.qname,
            wrap_secret_id: row.wrap_secret_id,
            cubby_token: row.cubby_token,
            cubby_path: row.cubby_path,
            payload: row.payload,
            container_image: row.container_image,
            image_pull_policy: row.image_pull_policy,
            content: row.content,
            entrypoint: row.entrypoint,
            run: row.run,
            working_directory: row.working_directory,
            env_vars: row.env_vars,
            secret_refs: row.secret_refs,
            secret_file_type: row.secret_file_type,
            cont_on_warnings: row.cont_on_warnings,
            status,
            return_code: row.return_code,
            submitted: row.submitted,
            started: row.started,
            ended: row.ended,
            output: row.output,
            container_id: row.container_id,
            kill_requested: row.kill_requested,
        })
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, StoreError> {
    rows.into_iter().map(Job::try_from).collect()
}

/// Job store backed by a shared PostgreSQL database.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Connect to the database and run any pending migrations.
    pub async fn connect(url: &str, pool_size: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        MIGRATOR.run(&pool).await?;
        tracing::info!(pool_size, "Connected to job store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_job(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<Job>, StoreError> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn write_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), StoreError> {
        let query = indoc::indoc! {r#"
            UPDATE jobs SET
                node_uuid = $2, qname = $3, wrap_secret_id = $4, cubby_token = $5,
                cubby_path = $6, payload = $7, container_image = $8,
                image_pull_policy = $9, content = $10, entrypoint = $11, run = $12,
                working_directory = $13, env_vars = $14, secret_refs = $15,
                secret_file_type = $16, cont_on_warnings = $17, status = $18,
                return_code = $19, submitted = $20, started = $21, ended = $22,
                output = $23, container_id = $24, kill_requested = $25
            WHERE id = $1
        "#};
        sqlx::query(query)
            .bind(job.id)
            .bind(job.node_uuid)
            .bind(&job.qname)
            .bind(&job.wrap_secret_id)
            .bind(&job.cubby_token)
            .bind(&job.cubby_path)
            .bind(&job.payload)
            .bind(&job.container_image)
            .bind(&job.image_pull_policy)
            .bind(&job.content)
            .bind(&job.entrypoint)
            .bind(&job.run)
            .bind(&job.working_directory)
            .bind(&job.env_vars)
            .bind(&job.secret_refs)
            .bind(&job.secret_file_type)
            .bind(job.cont_on_warnings)
            .bind(job.status.as_str())
            .bind(job.return_code)
            .bind(job.submitted)
            .bind(job.started)
            .bind(job.ended)
            .bind(&job.output)
            .bind(&job.container_id)
            .bind(job.kill_requested)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Read-modify-write one job under a row lock.
    async fn modify<F>(&self, id: Uuid, f: F) -> Result<Option<Job>, StoreError>
    where
        F: FnOnce(&mut Job) + Send,
    {
        let mut tx = self.pool.begin().await?;
        let Some(mut job) = Self::lock_job(&mut tx, id).await? else {
            return Ok(None);
        };
        f(&mut job);
        Self::write_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(Some(job))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert_job(&self, job: Job) -> Result<(), StoreError> {
        let query = indoc::indoc! {r#"
            INSERT INTO jobs (
                id, node_uuid, qname, wrap_secret_id, cubby_token, cubby_path, payload,
                container_image, image_pull_policy, content, entrypoint, run,
                working_directory, env_vars, secret_refs, secret_file_type,
                cont_on_warnings, status, return_code, submitted, started, ended,
                output, container_id, kill_requested
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25
            )
        "#};
        sqlx::query(query)
            .bind(job.id)
            .bind(job.node_uuid)
            .bind(&job.qname)
            .bind(&job.wrap_secret_id)
            .bind(&job.cubby_token)
            .bind(&job.cubby_path)
            .bind(&job.payload)
            .bind(&job.container_image)
            .bind(&job.image_pull_policy)
            .bind(&job.content)
            .bind(&job.entrypoint)
            .bind(&job.run)
            .bind(&job.working_directory)
            .bind(&job.env_vars)
            .bind(&job.secret_refs)
            .bind(&job.secret_file_type)
            .bind(job.cont_on_warnings)
            .bind(job.status.as_str())
            .bind(job.return_code)
            .bind(job.submitted)
            .bind(job.started)
            .bind(job.ended)
            .bind(&job.output)
            .bind(&job.container_id)
            .bind(job.kill_requested)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn list_jobs(&self, skip: u64, limit: u64) -> Result<JobPage, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        let rows: Vec<JobRow> =
            sqlx::query_as("SELECT * FROM jobs ORDER BY submitted DESC OFFSET $1 LIMIT $2")
                .bind(skip as i64)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;
        Ok(JobPage {
            jobs: into_jobs(rows)?,
            total: total as u64,
        })
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, u64)>, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(status, count)| {
                let status = status.parse::<JobStatus>().map_err(|e| StoreError::Corrupt {
                    id: Uuid::nil(),
                    reason: e.to_string(),
                })?;
                Ok((status, count as u64))
            })
            .collect()
    }

    async fn queue_names(&self) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar("SELECT DISTINCT qname FROM jobs ORDER BY qname")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    async fn claim_next(
        &self,
        qname: &str,
        node: NodeId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let query = indoc::indoc! {r#"
            WITH head AS (
                SELECT id, status FROM jobs
                WHERE qname = $1 AND status IN ('queued', 'running')
                ORDER BY submitted ASC
                LIMIT 1
                FOR UPDATE
            )
            UPDATE jobs SET status = 'running', node_uuid = $2, started = $3
            FROM head
            WHERE jobs.id = head.id AND head.status = 'queued'
            RETURNING jobs.*
        "#};
        let row: Option<JobRow> = sqlx::query_as(query)
            .bind(qname)
            .bind(node)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn update_job(&self, id: Uuid, update: JobUpdate) -> Result<Job, StoreError> {
        self.modify(id, |job| update.apply(job))
            .await?
            .ok_or(StoreError::JobNotFound(id))
    }

    async fn request_kill(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        self.modify(id, |job| {
            job.kill_requested = true;
            if job.status == JobStatus::Queued {
                JobUpdate::finished(JobStatus::Failed, "job killed", now).apply(job);
            }
        })
        .await
    }

    async fn kill_requested(&self, node: NodeId) -> Result<Vec<Job>, StoreError> {
        let query = indoc::indoc! {r#"
            SELECT * FROM jobs
            WHERE node_uuid = $1
              AND kill_requested
              AND status IN ('queued', 'running')
        "#};
        let rows: Vec<JobRow> = sqlx::query_as(query)
            .bind(node)
            .fetch_all(&self.pool)
            .await?;
        into_jobs(rows)
    }

    async fn mark_stopping(&self, id: Uuid, node: NodeId) -> Result<Option<Job>, StoreError> {
        let query = indoc::indoc! {r#"
            UPDATE jobs SET status = 'stopping'
            WHERE id = $1 AND node_uuid = $2 AND status = 'running'
            RETURNING *
        "#};
        let row: Option<JobRow> = sqlx::query_as(query)
            .bind(id)
            .bind(node)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn delete_job(&self, id: Uuid) -> Result<DeleteOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some(job) = Self::lock_job(&mut tx, id).await? else {
            return Ok(DeleteOutcome::NotFound);
        };
        if !job.status.is_terminal() {
            return Ok(DeleteOutcome::NotTerminal(job.status));
        }
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(DeleteOutcome::Deleted)
    }

    async fn heartbeat(&self, node: NodeId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let query = indoc::indoc! {r#"
            INSERT INTO nodes (id, last_seen) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET last_seen = EXCLUDED.last_seen
        "#};
        sqlx::query(query)
            .bind(node)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nodes(&self) -> Result<Vec<NodeRecord>, StoreError> {
        let rows: Vec<(Uuid, DateTime<Utc>)> =
            sqlx::query_as("SELECT id, last_seen FROM nodes ORDER BY last_seen DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, last_seen)| NodeRecord { id, last_seen })
            .collect())
    }

    async fn stale_nodes(&self, seen_before: DateTime<Utc>) -> Result<Vec<NodeId>, StoreError> {
        let ids = sqlx::query_scalar("SELECT id FROM nodes WHERE last_seen < $1")
            .bind(seen_before)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn orphan_jobs(&self, nodes: &[NodeId], now: DateTime<Utc>) -> Result<u64, StoreError> {
        let query = indoc::indoc! {r#"
            UPDATE jobs SET status = 'unknown', ended = COALESCE(ended, $2)
            WHERE node_uuid = ANY($1) AND status IN ('running', 'stopping')
        "#};
        let res = sqlx::query(query)
            .bind(nodes)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn remove_nodes(&self, nodes: &[NodeId]) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM nodes WHERE id = ANY($1)")
            .bind(nodes)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn remove_ended_before(&self, threshold: DateTime<Utc>) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM jobs WHERE ended < $1")
            .bind(threshold)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}
