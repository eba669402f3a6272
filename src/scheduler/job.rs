use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a broker node, generated at process start.
pub type NodeId = Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    NotAuthorised,
    Stopping,
    Success,
    Failed,
    Unknown,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::NotAuthorised => "notauthorised",
            JobStatus::Stopping => "stopping",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Unknown => "unknown",
        }
    }

    /// No further transition will happen to a job in this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::NotAuthorised | JobStatus::Success | JobStatus::Failed | JobStatus::Unknown
        )
    }

    /// A node currently owns the job and may hold a container for it.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Stopping)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid job status: {0}")]
pub struct ParseJobStatusError(String);

impl FromStr for JobStatus {
    type Err = ParseJobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "notauthorised" => Ok(JobStatus::NotAuthorised),
            "stopping" => Ok(JobStatus::Stopping),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            "unknown" => Ok(JobStatus::Unknown),
            other => Err(ParseJobStatusError(other.to_string())),
        }
    }
}

/// A job record as persisted in the job store.
///
/// Submission-only fields (`wrap_secret_id`, `cubby_*`, `payload`) are
/// cleared once the payload has been decrypted. The execution inputs are
/// only ever filled from the decrypted payload, never from the submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub node_uuid: Option<NodeId>,
    pub qname: String,

    // Submission
    pub wrap_secret_id: String,
    pub cubby_token: String,
    pub cubby_path: String,
    pub payload: String,

    // Execution inputs, resolved from the payload
    pub container_image: String,
    pub image_pull_policy: String,
    pub content: String,
    pub entrypoint: Vec<String>,
    pub run: Vec<String>,
    pub working_directory: String,
    pub env_vars: Vec<String>,
    pub secret_refs: Vec<String>,
    pub secret_file_type: String,
    pub cont_on_warnings: bool,

    // Results
    pub status: JobStatus,
    pub return_code: i32,
    pub submitted: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    pub output: String,
    pub container_id: String,
    pub kill_requested: bool,
}

impl Job {
    pub fn new(qname: impl Into<String>, wrap_secret_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            qname: qname.into().to_lowercase(),
            wrap_secret_id: wrap_secret_id.into(),
            status: JobStatus::Queued,
            submitted: Utc::now(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn submitted_at(mut self, submitted: DateTime<Utc>) -> Self {
        self.submitted = submitted;
        self
    }

    /// A job with no owner that is waiting at the back of its queue.
    pub fn is_queued(&self) -> bool {
        self.status == JobStatus::Queued
    }
}

/// Execution parameters decrypted from a job's payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionInputs {
    pub qname: String,
    pub container_image: String,
    pub image_pull_policy: String,
    pub content: String,
    pub entrypoint: Vec<String>,
    pub run: Vec<String>,
    pub working_directory: String,
    pub env_vars: Vec<String>,
    pub secret_refs: Vec<String>,
    pub secret_file_type: String,
    pub cont_on_warnings: bool,
}

/// A partial update applied atomically to one job record.
///
/// Only `Some` fields are written, mirroring a document store `$set`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub output: Option<String>,
    pub ended: Option<DateTime<Utc>>,
    pub return_code: Option<i32>,
    pub container_id: Option<String>,
    pub kill_requested: Option<bool>,
    /// Replace the execution inputs; `content` is kept out of the record.
    pub inputs: Option<ExecutionInputs>,
    /// Secret references actually resolved, across all meta layers.
    pub secret_refs: Option<Vec<String>>,
    /// Blank the wrapping token, cubbyhole coordinates and raw payload.
    pub clear_submission: bool,
}

impl JobUpdate {
    /// Move the job to a terminal status with a human-readable output.
    pub fn finished(status: JobStatus, output: impl Into<String>, ended: DateTime<Utc>) -> Self {
        Self {
            status: Some(status),
            output: Some(output.into()),
            ended: Some(ended),
            ..Default::default()
        }
    }

    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn container(container_id: impl Into<String>) -> Self {
        Self {
            container_id: Some(container_id.into()),
            ..Default::default()
        }
    }

    pub fn with_return_code(mut self, return_code: i32) -> Self {
        self.return_code = Some(return_code);
        self
    }

    pub fn with_inputs(mut self, inputs: ExecutionInputs) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_secret_refs(mut self, refs: Vec<String>) -> Self {
        self.secret_refs = Some(refs);
        self
    }

    pub fn clearing_submission(mut self) -> Self {
        self.clear_submission = true;
        self
    }

    pub fn apply(&self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(ref output) = self.output {
            job.output = output.clone();
        }
        if let Some(ended) = self.ended {
            job.ended = Some(ended);
        }
        if let Some(return_code) = self.return_code {
            job.return_code = return_code;
        }
        if let Some(ref container_id) = self.container_id {
            job.container_id = container_id.clone();
        }
        if let Some(kill_requested) = self.kill_requested {
            job.kill_requested = kill_requested;
        }
        if let Some(ref inputs) = self.inputs {
            job.container_image = inputs.container_image.clone();
            job.image_pull_policy = inputs.image_pull_policy.clone();
            job.entrypoint = inputs.entrypoint.clone();
            job.run = inputs.run.clone();
            job.working_directory = inputs.working_directory.clone();
            job.env_vars = inputs.env_vars.clone();
            job.secret_refs = inputs.secret_refs.clone();
            job.secret_file_type = inputs.secret_file_type.clone();
            job.cont_on_warnings = inputs.cont_on_warnings;
        }
        if let Some(ref refs) = self.secret_refs {
            job.secret_refs = refs.clone();
        }
        if self.clear_submission {
            job.wrap_secret_id.clear();
            job.cubby_token.clear();
            job.cubby_path.clear();
            job.payload.clear();
        }
    }
}
