use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::{ContainerRuntime, ContainerSpec, ImageSummary, RuntimeError};
use crate::config::SandboxConfig;

/// Drives the `docker` command line.
///
/// Every job container is created with the hardening options of
/// [`SandboxConfig`]:
/// - Network isolation (when enabled)
/// - Dropped capabilities and no privilege escalation
/// - Memory and CPU limits
///
/// The root filesystem stays writable because content and secrets are
/// copied into the stopped container before it starts.
#[derive(Debug, Clone)]
pub struct DockerCli {
    config: SandboxConfig,
}

impl DockerCli {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Arguments for `docker create`, image and command last.
    pub fn create_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--tty".to_string()];

        if !spec.user.is_empty() {
            args.push(format!("--user={}", spec.user));
        }
        if let Some(ref dir) = spec.working_dir {
            args.push(format!("--workdir={dir}"));
        }
        for var in &spec.env {
            args.push("--env".to_string());
            args.push(var.clone());
        }

        // Network isolation
        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }

        // Memory limit
        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }

        // CPU limit
        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        if self.config.drop_privileges {
            args.push("--cap-drop=ALL".to_string());
            args.push("--security-opt=no-new-privileges".to_string());
        }

        // The CLI only takes a single entrypoint word; the rest leads the command.
        let mut entrypoint = spec.entrypoint.iter();
        if let Some(first) = entrypoint.next() {
            args.push(format!("--entrypoint={first}"));
        }

        args.push(spec.image.clone());
        args.extend(entrypoint.cloned());
        args.extend(spec.cmd.iter().cloned());
        args
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.config.docker_binary);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run the CLI to completion, feeding `stdin` if given, and return stdout.
    async fn run(&self, args: Vec<String>, stdin: Option<Vec<u8>>) -> Result<Vec<u8>, RuntimeError> {
        tracing::debug!(args = ?args, "Invoking container runtime");

        let mut cmd = self.command(&args);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = cmd.spawn()?;

        let feeder = match (stdin, child.stdin.take()) {
            (Some(data), Some(mut pipe)) => Some(tokio::spawn(async move {
                pipe.write_all(&data).await?;
                pipe.shutdown().await
            })),
            _ => None,
        };

        let output = child.wait_with_output().await?;
        if let Some(feeder) = feeder {
            match feeder.await {
                Ok(Ok(())) => {}
                // The CLI may exit before draining stdin; its stderr says why.
                Ok(Err(e)) => tracing::debug!(error = %e, "Runtime closed stdin early"),
                Err(e) => tracing::warn!(error = %e, "Stdin feeder task failed"),
            }
        }

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(classify(&args, stderr))
        }
    }

    async fn run_text(&self, args: Vec<String>) -> Result<String, RuntimeError> {
        let stdout = self.run(args, None).await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }
}

/// Map CLI stderr to the error variants callers branch on.
fn classify(args: &[String], stderr: String) -> RuntimeError {
    let subject = args.last().cloned().unwrap_or_default();
    if stderr.contains("is not running") {
        return RuntimeError::NotRunning(subject);
    }
    if stderr.contains("Could not find the file") || stderr.contains("No such container:path") {
        let (container, path) = subject.split_once(':').unwrap_or((&subject, ""));
        return RuntimeError::NoSuchPath {
            container: container.to_string(),
            path: path.to_string(),
        };
    }
    if stderr.contains("No such container") {
        return RuntimeError::NoSuchContainer(subject);
    }
    RuntimeError::Command {
        command: format!("docker {}", args.first().cloned().unwrap_or_default()),
        stderr,
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_images(&self) -> Result<Vec<ImageSummary>, RuntimeError> {
        let out = self
            .run_text(vec![
                "image".into(),
                "ls".into(),
                "--all".into(),
                "--no-trunc".into(),
                "--format={{json .}}".into(),
            ])
            .await?;
        out.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(|e| RuntimeError::Malformed(e.to_string())))
            .collect()
    }

    /// Pull `reference`, logging progress lines as they arrive.
    ///
    /// The CLI reports failures on stderr and through its exit status; the
    /// exit status decides, stderr becomes the error detail.
    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let args = vec!["pull".to_string(), reference.to_string()];
        let mut child = self.command(&args).stdin(Stdio::null()).spawn()?;

        let mut stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(ref mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                tracing::info!(image = reference, progress = %line, "Pulling image");
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if status.success() {
            return Ok(());
        }
        let detail = match stderr.trim() {
            "" => format!("pull exited with {status}"),
            detail => detail.to_string(),
        };
        Err(RuntimeError::Pull {
            reference: reference.to_string(),
            detail,
        })
    }

    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(vec!["image".into(), "rm".into(), id.to_string()], None)
            .await
            .map(drop)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let id = self.run_text(self.create_args(spec)).await?;
        if id.is_empty() {
            return Err(RuntimeError::Malformed(
                "create returned no container id".to_string(),
            ));
        }
        Ok(id)
    }

    async fn copy_to(&self, id: &str, dest: &str, archive: Vec<u8>) -> Result<(), RuntimeError> {
        let args = vec!["cp".into(), "-".into(), format!("{id}:{dest}")];
        self.run(args, Some(archive)).await.map(drop)
    }

    async fn copy_from(&self, id: &str, src: &str) -> Result<Vec<u8>, RuntimeError> {
        let args = vec!["cp".into(), format!("{id}:{src}"), "-".into()];
        match self.run(args, None).await {
            Err(RuntimeError::NoSuchPath { .. }) => Err(RuntimeError::NoSuchPath {
                container: id.to_string(),
                path: src.to_string(),
            }),
            other => other,
        }
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(vec!["start".into(), id.to_string()], None)
            .await
            .map(drop)
    }

    async fn wait(&self, id: &str) -> Result<i32, RuntimeError> {
        let out = self.run_text(vec!["wait".into(), id.to_string()]).await?;
        out.lines()
            .last()
            .unwrap_or_default()
            .trim()
            .parse()
            .map_err(|_| RuntimeError::Malformed(format!("exit code {out:?}")))
    }

    async fn logs(&self, id: &str) -> Result<String, RuntimeError> {
        let out = self.run(vec!["logs".into(), id.to_string()], None).await?;
        Ok(String::from_utf8_lossy(&out).to_string())
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let args = vec![
            "stop".into(),
            format!("--time={}", timeout.as_secs()),
            id.to_string(),
        ];
        self.run(args, None).await.map(drop)
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(vec!["kill".into(), id.to_string()], None)
            .await
            .map(drop)
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let args = vec!["rm".into(), "--force".into(), "--volumes".into(), id.to_string()];
        match self.run(args, None).await {
            Ok(_) | Err(RuntimeError::NoSuchContainer(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
