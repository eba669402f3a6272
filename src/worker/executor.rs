use std::str::FromStr;
use std::sync::Arc;

use backon::{ExponentialBuilder, Retryable};
use secrecy::SecretString;
use tracing::Instrument;
use uuid::Uuid;

use super::archive::{self, TarEntry};
use super::meta::{CONTENT_META_FILE, IMAGE_META_FILE, LayeredMeta, Meta};
use super::secrets::{SecretFileType, SecretResolver};
use crate::node::NodeContext;
use crate::runtime::{ContainerSpec, ImageReference, RuntimeError};
use crate::scheduler::job::{ExecutionInputs, Job, JobStatus, JobUpdate};

/// Unprivileged account every job container runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceAccount {
    pub name: &'static str,
    pub uid: u32,
    pub gid: u32,
    pub home: &'static str,
    pub shell: &'static str,
}

pub const SERVICE_ACCOUNT: ServiceAccount = ServiceAccount {
    name: "broker",
    uid: 2001,
    gid: 2001,
    home: "/tmp",
    shell: "/bin/sh",
};

impl ServiceAccount {
    /// `uid:gid` for the container runtime.
    pub fn user(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }

    pub fn passwd_line(&self) -> String {
        format!(
            "{name}:x:{uid}:{gid}:{name}:{home}:{shell}\n",
            name = self.name,
            uid = self.uid,
            gid = self.gid,
            home = self.home,
            shell = self.shell
        )
    }

    /// Append this account to the contents of an `/etc/passwd` file.
    pub fn append_to_passwd(&self, mut passwd: Vec<u8>) -> Vec<u8> {
        if !passwd.is_empty() && !passwd.ends_with(b"\n") {
            passwd.push(b'\n');
        }
        passwd.extend_from_slice(self.passwd_line().as_bytes());
        passwd
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PullPolicy {
    #[default]
    IfNotPresent,
    Always,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::IfNotPresent => "IfNotPresent",
            PullPolicy::Always => "Always",
        }
    }
}

impl FromStr for PullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "IfNotPresent" => Ok(PullPolicy::IfNotPresent),
            "Always" => Ok(PullPolicy::Always),
            other => Err(format!("Incorrect value for image_pull_policy: {other}")),
        }
    }
}

/// Why a job stopped short of running to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub status: JobStatus,
    pub message: String,
}

impl JobFailure {
    pub fn failed(message: impl ToString) -> Self {
        Self {
            status: JobStatus::Failed,
            message: message.to_string(),
        }
    }

    pub fn not_authorised(message: impl ToString) -> Self {
        Self {
            status: JobStatus::NotAuthorised,
            message: message.to_string(),
        }
    }

    pub fn killed() -> Self {
        Self::failed(KILLED)
    }
}

/// Output recorded for a job terminated on request.
pub const KILLED: &str = "job killed";

/// Result of job execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub return_code: Option<i32>,
    pub output: String,
}

/// Content and secrets ready to be copied into a created container.
struct Injection {
    content: Option<Vec<u8>>,
    secrets: Vec<u8>,
}

/// Runs one claimed job from authentication to container removal.
///
/// Nothing escapes [`JobExecutor::execute`]: every failure is written back
/// to the job record as a terminal status with a message.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    ctx: Arc<NodeContext>,
}

impl JobExecutor {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub async fn execute(&self, job: Job) -> ExecutionResult {
        let span = tracing::info_span!("job", job_id = %job.id, qname = %job.qname);
        self.execute_in_span(job).instrument(span).await
    }

    async fn execute_in_span(&self, job: Job) -> ExecutionResult {
        let job_id = job.id;
        tracing::info!("Executing job");

        let (status, output, return_code) = match self.run(job).await {
            Ok((status, output, code)) => (status, output, Some(code)),
            Err(failure) => (failure.status, failure.message, None),
        };

        let mut update = JobUpdate::finished(status, output.clone(), self.ctx.now());
        if let Some(code) = return_code {
            update = update.with_return_code(code);
        }
        if let Err(e) = self.ctx.store.update_job(job_id, update).await {
            tracing::error!(error = %e, "Failed to record job result");
        }

        match status {
            JobStatus::Success => tracing::info!(return_code, "Job succeeded"),
            _ => tracing::warn!(status = %status, return_code, output = %output, "Job did not succeed"),
        }

        ExecutionResult {
            job_id,
            status,
            return_code,
            output,
        }
    }

    async fn run(&self, job: Job) -> Result<(JobStatus, String, i32), JobFailure> {
        if self.kill_requested(job.id).await {
            return Err(JobFailure::killed());
        }

        let token = self
            .ctx
            .broker
            .login(&job.wrap_secret_id)
            .await
            .map_err(JobFailure::not_authorised)?;

        let result = self.run_authenticated(&job, &token).await;
        self.revoke(token);
        result
    }

    /// Revoke the job token in the background; failures are only logged.
    fn revoke(&self, token: SecretString) {
        let broker = self.ctx.broker.clone();
        tokio::spawn(
            async move {
                match broker.revoke_self(&token).await {
                    Ok(()) => tracing::debug!("Revoked job token"),
                    Err(e) => tracing::error!(error = %e, "Failed to revoke job token"),
                }
            }
            .in_current_span(),
        );
    }

    async fn kill_requested(&self, id: Uuid) -> bool {
        match self.ctx.store.get_job(id).await {
            Ok(job) => job.is_some_and(|j| j.kill_requested),
            Err(e) => {
                tracing::warn!(error = %e, "Could not check for kill request");
                false
            }
        }
    }

    async fn persist(&self, id: Uuid, update: JobUpdate) -> Result<(), JobFailure> {
        self.ctx
            .store
            .update_job(id, update)
            .await
            .map(drop)
            .map_err(|e| JobFailure::failed(format!("Failed to update job record: {e}")))
    }

    async fn run_authenticated(
        &self,
        job: &Job,
        token: &SecretString,
    ) -> Result<(JobStatus, String, i32), JobFailure> {
        let plaintext = self
            .ctx
            .broker
            .decrypt(token, &job.payload)
            .await
            .map_err(|e| JobFailure::failed(format!("Failed to decrypt payload via vault: {e}")))?;
        let inputs: ExecutionInputs = serde_json::from_slice(&plaintext)
            .map_err(|e| JobFailure::failed(format!("Failed unmarshaling json from payload: {e}")))?;

        if !inputs.qname.eq_ignore_ascii_case(&job.qname) {
            return Err(JobFailure::failed(format!(
                "payload qname and job request qname do not match: '{}' != '{}'",
                inputs.qname, job.qname
            )));
        }
        self.persist(job.id, JobUpdate::default().clearing_submission())
            .await?;

        let content = match inputs.content.as_str() {
            "" => None,
            encoded => Some(archive::decode_content(encoded).map_err(JobFailure::failed)?),
        };
        let content_meta = match content {
            Some(ref tar) => match archive::read_entry(tar, CONTENT_META_FILE)
                .map_err(|e| JobFailure::failed(format!("Failed content tar: {e}")))?
            {
                Some(bytes) => {
                    Meta::from_yaml(CONTENT_META_FILE, &bytes).map_err(JobFailure::failed)?
                }
                None => Meta::default(),
            },
            None => Meta::default(),
        };

        let layers = LayeredMeta::new(
            content_meta,
            Meta {
                container_image: inputs.container_image.clone(),
                secret_refs: inputs.secret_refs.clone(),
            },
        );
        if layers.container_image().is_empty() {
            return Err(JobFailure::failed("ContainerImage is empty"));
        }
        let policy: PullPolicy = inputs.image_pull_policy.parse().map_err(JobFailure::failed)?;
        let file_type: SecretFileType = inputs.secret_file_type.parse().map_err(JobFailure::failed)?;
        let reference =
            ImageReference::parse(layers.container_image(), &self.ctx.config.default_registry);

        let resolved = ExecutionInputs {
            container_image: reference.local.clone(),
            image_pull_policy: policy.as_str().to_string(),
            secret_file_type: match file_type {
                SecretFileType::Yaml => "yaml".to_string(),
                SecretFileType::Json => "json".to_string(),
            },
            ..inputs.clone()
        };
        self.persist(job.id, JobUpdate::default().with_inputs(resolved))
            .await?;

        let image_id = self.ensure_image(&reference, policy).await?;

        let spec = ContainerSpec {
            image: reference.local.clone(),
            entrypoint: inputs.entrypoint.clone(),
            cmd: inputs.run.clone(),
            working_dir: Some(inputs.working_directory.clone()).filter(|d| !d.is_empty()),
            env: inputs.env_vars.clone(),
            user: SERVICE_ACCOUNT.user(),
        };
        let container_id = self
            .ctx
            .runtime
            .create_container(&spec)
            .await
            .map_err(|e| JobFailure::failed(format!("Failed to create container: {e}")))?;
        tracing::info!(container_id = %container_id, image = %reference.local, "Created container");
        self.ctx
            .images
            .mark_used(image_id.as_deref().unwrap_or(&reference.local), self.ctx.now());

        let result = self
            .run_container(job, &inputs, layers, content, file_type, token, &container_id)
            .await;
        self.remove_container(&container_id).await;
        result
    }

    /// Everything between container creation and removal.
    #[allow(clippy::too_many_arguments)]
    async fn run_container(
        &self,
        job: &Job,
        inputs: &ExecutionInputs,
        layers: LayeredMeta,
        content: Option<Vec<u8>>,
        file_type: SecretFileType,
        token: &SecretString,
        container_id: &str,
    ) -> Result<(JobStatus, String, i32), JobFailure> {
        self.persist(job.id, JobUpdate::container(container_id)).await?;

        let layers = layers.with_image(self.image_meta(container_id).await?);
        let refs = layers.secret_refs();
        self.persist(job.id, JobUpdate::default().with_secret_refs(refs.clone()))
            .await?;

        let mut resolver =
            SecretResolver::new(self.ctx.broker.as_ref(), token, inputs.cont_on_warnings);
        let secrets = resolver.resolve(&refs).await.map_err(JobFailure::failed)?;
        tracing::debug!(refs = refs.len(), paths = resolver.paths_read(), "Resolved secrets");

        let rendered = file_type.render(&secrets).map_err(JobFailure::failed)?;
        let secrets = archive::create_tar(&[TarEntry::new(file_type.file_name(), rendered)])
            .map_err(JobFailure::failed)?;

        if self.kill_requested(job.id).await {
            return Err(JobFailure::killed());
        }

        self.start_container(container_id, Injection { content, secrets })
            .await
            .map_err(|e| JobFailure::failed(format!("Run container failed: {e}")))?;

        let code = self
            .ctx
            .runtime
            .wait(container_id)
            .await
            .map_err(|e| JobFailure::failed(format!("Run container failed: {e}")))?;
        tracing::info!(container_id, exit_code = code, "Container exited");

        let output = match self.ctx.runtime.logs(container_id).await {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(container_id, error = %e, "Failed to collect container logs");
                String::new()
            }
        };

        if self.kill_requested(job.id).await {
            return Ok((JobStatus::Failed, KILLED.to_string(), code));
        }
        let status = if code == 0 {
            JobStatus::Success
        } else {
            JobStatus::Failed
        };
        Ok((status, output, code))
    }

    /// Look up the image locally, pulling it when missing or when the
    /// policy says so. Returns the local image id when it can be found.
    async fn ensure_image(
        &self,
        reference: &ImageReference,
        policy: PullPolicy,
    ) -> Result<Option<String>, JobFailure> {
        let local = self.find_image(&reference.local).await?;
        if local.is_some() && policy == PullPolicy::IfNotPresent {
            tracing::info!(image = %reference.local, "Image already present");
            return Ok(local);
        }

        let config = &self.ctx.config;
        let backoff = ExponentialBuilder::default()
            .with_min_delay(config.pull_backoff)
            .with_max_times(config.pull_attempts.saturating_sub(1));

        (|| async { self.ctx.runtime.pull_image(&reference.remote).await })
            .retry(backoff)
            .notify(|err: &RuntimeError, dur| {
                tracing::warn!(
                    image = %reference.remote,
                    error = %err,
                    "Image pull failed, retrying in {:.1}s",
                    dur.as_secs_f32()
                );
            })
            .await
            .map_err(|e| {
                tracing::error!(image = %reference.remote, error = %e, "Image pull exceeded retries");
                JobFailure::failed(e)
            })?;

        // A forced pull may have replaced the local image.
        self.find_image(&reference.local).await
    }

    async fn find_image(&self, local: &str) -> Result<Option<String>, JobFailure> {
        let images = self
            .ctx
            .runtime
            .list_images()
            .await
            .map_err(|e| JobFailure::failed(format!("Failed to list images: {e}")))?;
        Ok(images
            .into_iter()
            .find(|img| img.reference() == local)
            .map(|img| img.id))
    }

    /// Meta file baked into the image; absent when the image has none.
    async fn image_meta(&self, container_id: &str) -> Result<Meta, JobFailure> {
        let tar = match self.ctx.runtime.copy_from(container_id, IMAGE_META_FILE).await {
            Ok(tar) => tar,
            Err(RuntimeError::NoSuchPath { .. }) => {
                tracing::debug!(container_id, "Image carries no meta file");
                return Ok(Meta::default());
            }
            Err(e) => {
                tracing::error!(container_id, error = %e, "Failed to read image meta file");
                return Ok(Meta::default());
            }
        };
        let file_name = IMAGE_META_FILE.trim_start_matches('/');
        match archive::read_entry(&tar, file_name) {
            Ok(Some(bytes)) => Meta::from_yaml(IMAGE_META_FILE, &bytes).map_err(JobFailure::failed),
            Ok(None) => Ok(Meta::default()),
            Err(e) => Err(JobFailure::failed(format!(
                "Failed {IMAGE_META_FILE} extraction tar: {e}"
            ))),
        }
    }

    /// Copy content and secrets to `/`, add the service account to
    /// `/etc/passwd`, then start the container.
    async fn start_container(&self, id: &str, injection: Injection) -> Result<(), String> {
        let runtime = &self.ctx.runtime;

        if let Some(content) = injection.content {
            runtime.copy_to(id, "/", content).await.map_err(|e| e.to_string())?;
        }
        runtime
            .copy_to(id, "/", injection.secrets)
            .await
            .map_err(|e| e.to_string())?;

        let passwd = match runtime.copy_from(id, "/etc/passwd").await {
            Ok(tar) => tar,
            Err(RuntimeError::NoSuchPath { .. }) => archive::create_tar(&[]).map_err(|e| e.to_string())?,
            Err(e) => return Err(e.to_string()),
        };
        let passwd = archive::transform_entry(&passwd, "passwd", |bytes| {
            SERVICE_ACCOUNT.append_to_passwd(bytes)
        })
        .map_err(|e| e.to_string())?;
        runtime.copy_to(id, "/etc", passwd).await.map_err(|e| e.to_string())?;

        runtime.start(id).await.map_err(|e| e.to_string())
    }

    async fn remove_container(&self, id: &str) {
        tracing::debug!(container_id = id, "Removing container");
        match self.ctx.runtime.remove(id).await {
            Ok(()) => {}
            Err(RuntimeError::NoSuchContainer(_)) => {
                tracing::debug!(container_id = id, "Container already removed");
            }
            Err(e) => tracing::error!(container_id = id, error = %e, "Failed to remove container"),
        }
    }
}
