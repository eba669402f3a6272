//! Job submission and management API, mounted at `/v1/api`.
//!
//! Every route except `GET /v1/api/health` requires an `X-Auth-Token`
//! header holding a secret broker token; the token is verified with a
//! self-lookup before the request reaches its handler.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::node::NodeContext;
use crate::scheduler::job::{Job, JobStatus, NodeId};
use crate::store::DeleteOutcome;

pub mod error;

pub use error::ApiError;

/// Header carrying the caller's secret broker token.
pub const AUTH_HEADER: &str = "X-Auth-Token";

/// Jobs returned per page by the list endpoint.
pub const PAGE_LIMIT: u64 = 10;

pub fn router(ctx: Arc<NodeContext>) -> Router {
    let api = Router::new()
        .route("/job", post(submit_job).get(list_jobs))
        .route("/job/{id}", get(get_job).delete(delete_job))
        .route("/job/kill/{id}", post(kill_job))
        .route_layer(middleware::from_fn_with_state(ctx.clone(), authenticate))
        .route("/health", get(health));

    Router::new()
        .nest("/v1/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn authenticate(
    State(ctx): State<Arc<NodeContext>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::invalid_request(format!("Missing {AUTH_HEADER}")))?;

    let policies = ctx.broker.lookup_self(token).await.map_err(|e| {
        tracing::warn!(error = %e, "Authentication failure with token");
        ApiError::invalid_request(e)
    })?;
    tracing::debug!(policies = ?policies, "Authenticated request");

    Ok(next.run(req).await)
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ApiError::invalid_job_request("job ID missing from path"));
    }
    Uuid::parse_str(raw).map_err(|_| ApiError::invalid_job_request("Invalid job ID (not a UUID)"))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SubmitJobRequest {
    pub qname: String,
    pub wrap_secret_id: String,
    pub cubby_token: String,
    pub cubby_path: String,
    pub payload: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub status: JobStatus,
    pub qname: String,
}

/// Public view of a job; submission and execution inputs stay private.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobView {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub status: JobStatus,
    pub node_uuid: Option<NodeId>,
    pub qname: String,
    pub container_image: String,
    pub submitted: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    pub output: String,
    pub return_code: i32,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            node_uuid: job.node_uuid,
            qname: job.qname.clone(),
            container_image: job.container_image.clone(),
            submitted: job.submitted,
            started: job.started,
            ended: job.ended,
            output: job.output.clone(),
            return_code: job.return_code,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub data: Vec<JobView>,
    pub skip: u64,
    pub limit: u64,
    pub total: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteJobResponse {
    #[serde(rename = "_id")]
    pub id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KillJobResponse {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub container_id: String,
    pub status: JobStatus,
    pub kill_requested: bool,
}

async fn submit_job(
    State(ctx): State<Arc<NodeContext>>,
    body: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Result<Json<SubmitJobResponse>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::invalid_job_request(e.body_text()))?;

    if req.wrap_secret_id.is_empty() {
        return Err(ApiError::invalid_job_request(
            "AppRole SecretID's Wrapping Token must be present in the job request",
        ));
    }

    let mut job = Job::new(req.qname, req.wrap_secret_id)
        .with_payload(req.payload)
        .submitted_at(ctx.now());

    // Without cubbyhole coordinates the payload travels in the request itself.
    if !req.cubby_token.is_empty() && !req.cubby_path.is_empty() {
        job.payload = ctx
            .broker
            .read_cubbyhole(&req.cubby_token, &req.cubby_path)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to read payload from cubbyhole");
                ApiError::internal(format!(
                    "POSSIBLE SECURITY/INTERCEPTION ALERT!!! Failed to read cubbyhole from vault, error: {e}"
                ))
            })?;
        job.cubby_token = req.cubby_token;
        job.cubby_path = req.cubby_path;
    }

    let response = SubmitJobResponse {
        id: job.id,
        status: job.status,
        qname: job.qname.clone(),
    };
    ctx.store.insert_job(job).await?;
    tracing::info!(job_id = %response.id, qname = %response.qname, "Job submitted");
    Ok(Json(response))
}

async fn get_job(
    State(ctx): State<Arc<NodeContext>>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let id = parse_id(&id)?;
    let job = ctx
        .store
        .get_job(id)
        .await?
        .ok_or_else(|| ApiError::not_found("not found"))?;
    Ok(Json(JobView::from(&job)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    skip: Option<String>,
}

async fn list_jobs(
    State(ctx): State<Arc<NodeContext>>,
    Query(params): Query<ListParams>,
) -> Result<Json<JobListResponse>, ApiError> {
    let skip = params
        .skip
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let page = ctx.store.list_jobs(skip, PAGE_LIMIT).await?;
    Ok(Json(JobListResponse {
        data: page.jobs.iter().map(JobView::from).collect(),
        skip,
        limit: PAGE_LIMIT,
        total: page.total,
    }))
}

async fn delete_job(
    State(ctx): State<Arc<NodeContext>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteJobResponse>, ApiError> {
    let id = parse_id(&id)?;
    match ctx.store.delete_job(id).await? {
        DeleteOutcome::Deleted => {
            tracing::info!(job_id = %id, "Job deleted");
            Ok(Json(DeleteJobResponse { id }))
        }
        DeleteOutcome::NotFound => Err(ApiError::not_found("not found")),
        DeleteOutcome::NotTerminal(status) => Err(ApiError::invalid_job_request(format!(
            "Cannot delete a {status} job"
        ))),
    }
}

async fn kill_job(
    State(ctx): State<Arc<NodeContext>>,
    Path(id): Path<String>,
) -> Result<Json<KillJobResponse>, ApiError> {
    let id = parse_id(&id)?;
    let job = ctx
        .store
        .request_kill(id, ctx.now())
        .await?
        .ok_or_else(|| ApiError::not_found("not found"))?;
    tracing::warn!(job_id = %id, status = %job.status, "Kill requested");
    Ok(Json(KillJobResponse {
        id: job.id,
        container_id: job.container_id,
        status: job.status,
        kill_requested: job.kill_requested,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct HealthParams {
    k: Option<String>,
}

const ALL_STATUSES: [JobStatus; 7] = [
    JobStatus::Queued,
    JobStatus::Running,
    JobStatus::NotAuthorised,
    JobStatus::Stopping,
    JobStatus::Success,
    JobStatus::Failed,
    JobStatus::Unknown,
];

/// Node and fleet health. `?k=<metric>` returns a single metric as text.
async fn health(
    State(ctx): State<Arc<NodeContext>>,
    Query(params): Query<HealthParams>,
) -> Result<Response, ApiError> {
    let mut metrics = BTreeMap::new();
    metrics.insert("node_uuid".to_string(), ctx.node_id.to_string());
    metrics.insert("state".to_string(), ctx.state().to_string());
    metrics.insert("running_here".to_string(), ctx.running_jobs().to_string());
    metrics.insert(
        "max_concurrent_jobs".to_string(),
        ctx.config.max_concurrent_jobs.to_string(),
    );

    let counts = ctx.store.count_by_status().await?;
    let total: u64 = counts.iter().map(|(_, n)| n).sum();
    metrics.insert("all_jobs".to_string(), total.to_string());
    for status in ALL_STATUSES {
        let n = counts
            .iter()
            .find(|(s, _)| *s == status)
            .map_or(0, |(_, n)| *n);
        metrics.insert(format!("{status}_jobs"), n.to_string());
    }

    match params.k {
        Some(key) => metrics
            .remove(&key)
            .map(IntoResponse::into_response)
            .ok_or_else(|| ApiError::invalid_request("Invalid health metric key")),
        None => Ok(Json(metrics).into_response()),
    }
}
