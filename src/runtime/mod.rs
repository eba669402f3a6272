//! Container runtime integration.
//!
//! [`ContainerRuntime`] covers the handful of operations a job needs: make
//! sure an image is present, create a stopped container, copy archives in and
//! out of it, run it to completion and throw it away. [`DockerCli`] drives the
//! `docker` command line through `tokio::process`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

pub mod docker;

pub use docker::DockerCli;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to invoke container runtime: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("no such container: {0}")]
    NoSuchContainer(String),

    #[error("no such path {path} in container {container}")]
    NoSuchPath { container: String, path: String },

    #[error("container {0} is not running")]
    NotRunning(String),

    #[error("failed to pull image {reference}: {detail}")]
    Pull { reference: String, detail: String },

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("unexpected runtime output: {0}")]
    Malformed(String),
}

/// What to run in a new container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    /// Entrypoint override; empty keeps the image's entrypoint
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub working_dir: Option<String>,
    /// `KEY=value` pairs
    pub env: Vec<String>,
    /// `uid:gid` the container process runs as
    pub user: String,
}

/// A locally present image.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageSummary {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Repository")]
    pub repository: String,
    #[serde(rename = "Tag")]
    pub tag: String,
}

impl ImageSummary {
    /// `repository:tag` as the image would be referred to by a job.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

/// An image named by a job, resolved to the local name and the pull source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Name the image is listed under locally, always tagged
    pub local: String,
    /// Fully qualified name to pull from
    pub remote: String,
}

impl ImageReference {
    /// Tag an untagged name with `latest` and qualify a name without any
    /// path component with `default_registry`.
    pub fn parse(image: &str, default_registry: &str) -> Self {
        let last_segment = image.rsplit('/').next().unwrap_or(image);
        let local = if last_segment.contains(':') || last_segment.contains('@') {
            image.to_string()
        } else {
            format!("{image}:latest")
        };
        let remote = if local.contains('/') {
            local.clone()
        } else {
            format!("{default_registry}/{local}")
        };
        Self { local, remote }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync + std::fmt::Debug {
    async fn list_images(&self) -> Result<Vec<ImageSummary>, RuntimeError>;

    /// Pull an image, failing on the first error the registry reports.
    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError>;

    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError>;

    /// Create a stopped container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Extract a tar archive into the container at `dest`.
    async fn copy_to(&self, id: &str, dest: &str, archive: Vec<u8>) -> Result<(), RuntimeError>;

    /// Read `src` out of the container as a tar archive.
    async fn copy_from(&self, id: &str, src: &str) -> Result<Vec<u8>, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Block until the container exits and return its exit code.
    async fn wait(&self, id: &str) -> Result<i32, RuntimeError>;

    async fn logs(&self, id: &str) -> Result<String, RuntimeError>;

    /// Ask the container to stop, killing it after `timeout`.
    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-remove the container and its volumes. Removing a container
    /// that no longer exists succeeds.
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}
