//! Test harness for broker integration tests.
//!
//! Provides in-process fakes for the secret broker and the container runtime,
//! plus a node context wired to an in-memory store and a manual clock.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use flate2::Compression;
use flate2::write::GzEncoder;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use fleet_broker::clock::{Clock, ManualClock};
use fleet_broker::config::NodeConfig;
use fleet_broker::node::NodeContext;
use fleet_broker::runtime::{ContainerRuntime, ContainerSpec, ImageSummary, RuntimeError};
use fleet_broker::scheduler::job::{ExecutionInputs, Job};
use fleet_broker::store::{JobStore, MemoryJobStore};
use fleet_broker::vault::{SecretBroker, SecretResponse, VaultError};
use fleet_broker::worker::archive::{self, TarEntry};

/// Token handed out by [`FakeBroker::login`].
pub const JOB_TOKEN: &str = "job-token";

/// Caller token accepted by [`FakeBroker::lookup_self`].
pub const CALLER_TOKEN: &str = "caller-token";

pub const PASSWD: &str = "root:x:0:0:root:/root:/bin/sh\n";

/// A secret broker that answers from memory.
#[derive(Debug, Default)]
pub struct FakeBroker {
    deny_login: bool,
    plaintext: Vec<u8>,
    secrets: HashMap<String, SecretResponse>,
    cubbyholes: HashMap<(String, String), String>,
    callers: HashSet<String>,
    reads: AtomicUsize,
    revokes: AtomicUsize,
    logins: AtomicUsize,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self {
            callers: HashSet::from([CALLER_TOKEN.to_string()]),
            ..Default::default()
        }
    }

    /// Payloads decrypt to these inputs.
    pub fn with_inputs(mut self, inputs: &ExecutionInputs) -> Self {
        self.plaintext = serde_json::to_vec(inputs).unwrap();
        self
    }

    pub fn with_plaintext(mut self, plaintext: impl Into<Vec<u8>>) -> Self {
        self.plaintext = plaintext.into();
        self
    }

    /// Store `data` at `path`. `data` must be a JSON object.
    pub fn with_secret(self, path: &str, data: Value) -> Self {
        self.with_secret_warnings(path, data, &[])
    }

    pub fn with_secret_warnings(mut self, path: &str, data: Value, warnings: &[&str]) -> Self {
        let data = match data {
            Value::Object(map) => Some(map),
            _ => panic!("secret data must be an object"),
        };
        let warnings = if warnings.is_empty() {
            None
        } else {
            Some(warnings.iter().map(|w| w.to_string()).collect())
        };
        self.secrets
            .insert(path.to_string(), SecretResponse { data, warnings });
        self
    }

    pub fn with_cubbyhole(mut self, token: &str, path: &str, payload: &str) -> Self {
        self.cubbyholes
            .insert((token.to_string(), path.to_string()), payload.to_string());
        self
    }

    pub fn denying_login(mut self) -> Self {
        self.deny_login = true;
        self
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn revokes(&self) -> usize {
        self.revokes.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }
}

fn forbidden() -> VaultError {
    VaultError::Api {
        status: 403,
        message: "permission denied".to_string(),
    }
}

#[async_trait]
impl SecretBroker for FakeBroker {
    async fn login(&self, wrapped_secret_id: &str) -> Result<SecretString, VaultError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if wrapped_secret_id.is_empty() {
            return Err(VaultError::NoWrappingToken);
        }
        if self.deny_login {
            return Err(VaultError::Unwrap(Box::new(forbidden())));
        }
        Ok(SecretString::from(JOB_TOKEN.to_string()))
    }

    async fn decrypt(&self, token: &SecretString, _ciphertext: &str) -> Result<Vec<u8>, VaultError> {
        if token.expose_secret() != JOB_TOKEN {
            return Err(forbidden());
        }
        Ok(self.plaintext.clone())
    }

    async fn read(
        &self,
        token: &SecretString,
        path: &str,
    ) -> Result<Option<SecretResponse>, VaultError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if token.expose_secret() != JOB_TOKEN {
            return Err(forbidden());
        }
        Ok(self.secrets.get(path).cloned())
    }

    async fn read_cubbyhole(&self, token: &str, path: &str) -> Result<String, VaultError> {
        self.cubbyholes
            .get(&(token.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(forbidden)
    }

    async fn lookup_self(&self, token: &str) -> Result<Vec<String>, VaultError> {
        if self.callers.contains(token) {
            Ok(vec!["default".to_string()])
        } else {
            Err(forbidden())
        }
    }

    async fn revoke_self(&self, _token: &SecretString) -> Result<(), VaultError> {
        self.revokes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// An archive copied into a container.
#[derive(Debug, Clone)]
pub struct Copied {
    pub container: String,
    pub dest: String,
    pub archive: Vec<u8>,
}

impl Copied {
    pub fn entry(&self, name: &str) -> Option<String> {
        archive::read_entry(&self.archive, name)
            .unwrap()
            .map(|b| String::from_utf8(b).unwrap())
    }
}

/// A container runtime that records calls instead of running anything.
#[derive(Debug)]
pub struct FakeRuntime {
    calls: Mutex<Vec<String>>,
    images: Mutex<Vec<ImageSummary>>,
    copied: Mutex<Vec<Copied>>,
    removed_images: Mutex<Vec<String>>,
    removed_containers: Mutex<HashSet<String>>,
    pull_failures: AtomicUsize,
    pulls: AtomicUsize,
    next_container: AtomicUsize,
    exit_code: i32,
    logs: String,
    image_meta: Option<String>,
    passwd: Option<String>,
    fail_create: bool,
    block_until_stopped: bool,
    remove_on_exit: bool,
    stopped: Notify,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            calls: Mutex::default(),
            images: Mutex::default(),
            copied: Mutex::default(),
            removed_images: Mutex::default(),
            removed_containers: Mutex::default(),
            pull_failures: AtomicUsize::new(0),
            pulls: AtomicUsize::new(0),
            next_container: AtomicUsize::new(1),
            exit_code: 0,
            logs: String::new(),
            image_meta: None,
            passwd: Some(PASSWD.to_string()),
            fail_create: false,
            block_until_stopped: false,
            remove_on_exit: false,
            stopped: Notify::new(),
        }
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(self, id: &str, repository: &str, tag: &str) -> Self {
        self.images.lock().unwrap().push(ImageSummary {
            id: id.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        });
        self
    }

    pub fn with_exit(mut self, code: i32, logs: &str) -> Self {
        self.exit_code = code;
        self.logs = logs.to_string();
        self
    }

    pub fn with_image_meta(mut self, yaml: &str) -> Self {
        self.image_meta = Some(yaml.to_string());
        self
    }

    pub fn without_passwd(mut self) -> Self {
        self.passwd = None;
        self
    }

    /// The next `n` pulls fail.
    pub fn failing_pulls(self, n: usize) -> Self {
        self.pull_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// `wait` blocks until the container is stopped, then reports 137.
    pub fn blocking(mut self) -> Self {
        self.block_until_stopped = true;
        self
    }

    /// Containers are gone as soon as they exit, like `docker run --rm`.
    pub fn removing_on_exit(mut self) -> Self {
        self.remove_on_exit = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn copied(&self) -> Vec<Copied> {
        self.copied.lock().unwrap().clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.removed_images.lock().unwrap().clone()
    }

    pub fn image_ids(&self) -> Vec<String> {
        self.images
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.id.clone())
            .collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_images(&self) -> Result<Vec<ImageSummary>, RuntimeError> {
        Ok(self.images.lock().unwrap().clone())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        self.record(format!("pull {reference}"));
        let failures = self.pull_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.pull_failures.store(failures - 1, Ordering::SeqCst);
            return Err(RuntimeError::Pull {
                reference: reference.to_string(),
                detail: "toomanyrequests".to_string(),
            });
        }

        // Every successful pull lands a fresh image id for the reference.
        let local = reference.strip_prefix("docker.io/").unwrap_or(reference);
        let (repository, tag) = local.rsplit_once(':').unwrap_or((local, "latest"));
        let n = self.pulls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut images = self.images.lock().unwrap();
        images.retain(|i| i.reference() != local);
        images.push(ImageSummary {
            id: format!("sha256:pulled{n:04}"),
            repository: repository.to_string(),
            tag: tag.to_string(),
        });
        Ok(())
    }

    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(format!("rmi {id}"));
        self.images.lock().unwrap().retain(|i| i.id != id);
        self.removed_images.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.record(format!("create {}", spec.image));
        if self.fail_create {
            return Err(RuntimeError::Command {
                command: "docker create".to_string(),
                stderr: "no space left on device".to_string(),
            });
        }
        let n = self.next_container.fetch_add(1, Ordering::SeqCst);
        Ok(format!("container-{n}"))
    }

    async fn copy_to(&self, id: &str, dest: &str, archive: Vec<u8>) -> Result<(), RuntimeError> {
        self.record(format!("copy_to {id} {dest}"));
        self.copied.lock().unwrap().push(Copied {
            container: id.to_string(),
            dest: dest.to_string(),
            archive,
        });
        Ok(())
    }

    async fn copy_from(&self, id: &str, src: &str) -> Result<Vec<u8>, RuntimeError> {
        self.record(format!("copy_from {id} {src}"));
        let (name, content) = match src {
            "/etc/passwd" => ("passwd", self.passwd.clone()),
            "/broker_image.yml" => ("broker_image.yml", self.image_meta.clone()),
            _ => ("", None),
        };
        match content {
            Some(content) => Ok(archive::create_tar(&[TarEntry::new(name, content)]).unwrap()),
            None => Err(RuntimeError::NoSuchPath {
                container: id.to_string(),
                path: src.to_string(),
            }),
        }
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(format!("start {id}"));
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i32, RuntimeError> {
        self.record(format!("wait {id}"));
        let code = if self.block_until_stopped {
            self.stopped.notified().await;
            137
        } else {
            self.exit_code
        };
        if self.remove_on_exit {
            self.removed_containers.lock().unwrap().insert(id.to_string());
        }
        Ok(code)
    }

    async fn logs(&self, id: &str) -> Result<String, RuntimeError> {
        self.record(format!("logs {id}"));
        Ok(self.logs.clone())
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<(), RuntimeError> {
        self.record(format!("stop {id}"));
        self.stopped.notify_one();
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(format!("kill {id}"));
        Err(RuntimeError::NotRunning(id.to_string()))
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(format!("remove {id}"));
        if !self.removed_containers.lock().unwrap().insert(id.to_string()) {
            return Err(RuntimeError::NoSuchContainer(id.to_string()));
        }
        Ok(())
    }
}

/// `targz,<base64>` content holding the given files.
pub fn targz_content(files: &[(&str, &str)]) -> String {
    let entries: Vec<TarEntry> = files
        .iter()
        .map(|(name, content)| TarEntry::new(*name, content.as_bytes()))
        .collect();
    let tar = archive::create_tar(&entries).unwrap();
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&tar).unwrap();
    format!("targz,{}", STANDARD.encode(gz.finish().unwrap()))
}

/// Node configuration with short intervals for faster tests.
pub fn test_config() -> NodeConfig {
    NodeConfig {
        dispatch_interval: Duration::from_millis(10),
        kill_poll_interval: Duration::from_millis(10),
        stop_timeout: Duration::from_millis(10),
        pull_attempts: 3,
        pull_backoff: Duration::from_millis(1),
        max_concurrent_jobs: 4,
        ..NodeConfig::new("127.0.0.1:0".parse().unwrap())
    }
}

/// One broker node wired to fakes.
pub struct TestNode {
    pub ctx: Arc<NodeContext>,
    pub store: Arc<MemoryJobStore>,
    pub broker: Arc<FakeBroker>,
    pub runtime: Arc<FakeRuntime>,
    pub clock: Arc<ManualClock>,
}

impl TestNode {
    pub fn new(broker: FakeBroker, runtime: FakeRuntime) -> Self {
        Self::with_config(test_config(), broker, runtime)
    }

    pub fn with_config(config: NodeConfig, broker: FakeBroker, runtime: FakeRuntime) -> Self {
        Self::sharing(Arc::new(MemoryJobStore::new()), config, broker, runtime)
    }

    /// A node on an existing store, as a second member of the same fleet.
    pub fn sharing(
        store: Arc<MemoryJobStore>,
        config: NodeConfig,
        broker: FakeBroker,
        runtime: FakeRuntime,
    ) -> Self {
        let broker = Arc::new(broker);
        let runtime = Arc::new(runtime);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ctx = NodeContext::new(config, store.clone(), broker.clone(), runtime.clone())
            .with_clock(clock.clone());
        Self {
            ctx: Arc::new(ctx),
            store,
            broker,
            runtime,
            clock,
        }
    }

    /// Queue a job on `qname`, one second after the previous submission.
    pub async fn submit(&self, qname: &str) -> Job {
        let job = Job::new(qname, "wrapped-secret-id")
            .with_payload("vault:v1:ciphertext")
            .submitted_at(self.clock.now());
        self.clock.advance(chrono::Duration::seconds(1));
        self.store.insert_job(job.clone()).await.unwrap();
        job
    }

    /// Submit a job and claim it for this node, as the dispatcher would.
    pub async fn claimed(&self, qname: &str) -> Job {
        let job = self.submit(qname).await;
        self.store
            .claim_next(qname, self.ctx.node_id, self.clock.now())
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("job {} should be claimable", job.id))
    }

    pub async fn job(&self, id: Uuid) -> Job {
        self.store.get_job(id).await.unwrap().unwrap()
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition().await
}

/// Inputs running `echo hi` on alpine.
pub fn echo_inputs(qname: &str) -> ExecutionInputs {
    ExecutionInputs {
        qname: qname.to_string(),
        container_image: "alpine".to_string(),
        run: vec!["echo".to_string(), "hi".to_string()],
        ..Default::default()
    }
}
