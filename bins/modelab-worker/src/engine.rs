//! Execution Engine - runs an untrusted harness and captures raw output
//!
//! **Core Responsibility:**
//! Execute a synthesized Python harness in isolation and hand back stdout,
//! stderr, exit code and timing.
//!
//! **Boundary:**
//! - Engine knows HOW to execute (child process or Docker container)
//! - Engine does NOT parse the harness summary or assign scores
//! - A timed-out or crashed execution never affects any other execution
//! - Captured stdout/stderr are capped at `MAX_OUTPUT_BYTES` per stream
//!
//! Backends:
//! - `ProcessEngine`: `python3 -I` in a fresh temporary directory, killed on timeout
//! - `DockerEngine`: one container per execution, network disabled, memory/CPU
//!   limits, read-only root with a small tmpfs, removed by a drop guard

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::config::{SandboxConfig, SandboxKind};

/// Harness sources above this size are rejected before anything is spawned
pub const MAX_HARNESS_BYTES: usize = 1024 * 1024;

/// A single environment entry must fit in one execve argument (Linux MAX_ARG_STRLEN)
const MAX_ENV_ENTRY_BYTES: usize = 128 * 1024;

/// Bytes kept per output stream; the rest is read and discarded
pub const MAX_OUTPUT_BYTES: usize = 256 * 1024;

const HARNESS_FILE: &str = "harness.py";
const HARNESS_ENV: &str = "HARNESS_B64";
const TIMEOUT_MARKER: &str = "[Execution timed out]";
const TRUNCATED_MARKER: &str = "\n[Output truncated]";

/// Decodes the harness from the environment and runs it as `__main__`
const CONTAINER_BOOTSTRAP: &str = "import base64, os; \
     exec(compile(base64.b64decode(os.environ['HARNESS_B64']).decode('utf-8'), '<harness>', 'exec'))";

/// Raw output of one sandboxed execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawExecution {
    pub stdout: String,
    pub stderr: String,
    /// None when the child was killed by a signal or never reported
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    /// stdout or stderr went past `MAX_OUTPUT_BYTES`
    pub output_truncated: bool,
    pub execution_time_ms: u64,
}

impl RawExecution {
    fn timed_out(elapsed: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: TIMEOUT_MARKER.to_string(),
            exit_code: None,
            timed_out: true,
            output_truncated: false,
            execution_time_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Output buffer that stops growing at its limit
#[derive(Debug)]
struct CappedOutput {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedOutput {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit - self.bytes.len();
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATED_MARKER);
        }
        text
    }
}

/// Read a pipe to EOF, keeping at most `limit` bytes
async fn drain_capped<R: AsyncRead + Unpin>(mut pipe: R, limit: usize) -> std::io::Result<CappedOutput> {
    let mut output = CappedOutput::new(limit);
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Ok(output);
        }
        output.push(&chunk[..n]);
    }
}

fn check_harness_size(source: &str) -> Result<()> {
    if source.len() > MAX_HARNESS_BYTES {
        bail!(
            "Harness source exceeds maximum size of {} bytes ({} bytes)",
            MAX_HARNESS_BYTES,
            source.len()
        );
    }
    Ok(())
}

/// Local child-process backend
pub struct ProcessEngine {
    python: String,
}

impl ProcessEngine {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }

    /// Run the harness with a hard wall-clock timeout.
    ///
    /// The child runs in isolated mode (`-I`: no user site, no PYTHON* env
    /// vars) without writing bytecode, inside a temporary directory that is
    /// removed afterwards. Both pipes are drained concurrently through capped
    /// buffers. On timeout the collecting future is dropped and the child is
    /// killed with it.
    #[tracing::instrument(skip_all, fields(backend = "process", bytes = source.len()))]
    pub async fn execute(&self, source: &str, timeout: Duration) -> Result<RawExecution> {
        check_harness_size(source)?;

        let workdir = tempfile::tempdir().context("Failed to create sandbox directory")?;
        let script = workdir.path().join(HARNESS_FILE);
        tokio::fs::write(&script, source)
            .await
            .context("Failed to write harness file")?;

        let mut command = tokio::process::Command::new(&self.python);
        command
            .arg("-I")
            .arg("-B")
            .arg(&script)
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn interpreter '{}'", self.python))?;
        let stdout = child.stdout.take().context("Harness stdout was not captured")?;
        let stderr = child.stderr.take().context("Harness stderr was not captured")?;

        let collect = async {
            let (stdout, stderr) = tokio::try_join!(
                drain_capped(stdout, MAX_OUTPUT_BYTES),
                drain_capped(stderr, MAX_OUTPUT_BYTES)
            )?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((stdout, stderr, status))
        };

        match tokio::time::timeout(timeout, collect).await {
            Ok(Ok((stdout, stderr, status))) => {
                let output_truncated = stdout.truncated || stderr.truncated;
                let execution = RawExecution {
                    stdout: stdout.into_string(),
                    stderr: stderr.into_string(),
                    exit_code: status.code().map(i64::from),
                    timed_out: false,
                    output_truncated,
                    execution_time_ms: start.elapsed().as_millis() as u64,
                };
                debug!(
                    exit_code = ?execution.exit_code,
                    truncated = execution.output_truncated,
                    execution_ms = execution.execution_time_ms,
                    "Harness process exited"
                );
                Ok(execution)
            }
            Ok(Err(e)) => Err(e).context("Failed to collect harness output"),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Harness process timed out, killed");
                Ok(RawExecution::timed_out(start.elapsed()))
            }
        }
    }
}

/// Container cleanup guard - removes the container on drop, including on
/// cancellation or panic
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let container_id = std::mem::take(&mut self.container_id);
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to remove sandbox container");
            }
        });
    }
}

/// Docker backend: one short-lived container per execution
pub struct DockerEngine {
    docker: Docker,
    image: String,
    memory_limit_mb: u32,
    cpu_limit: f32,
}

impl DockerEngine {
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;

        Ok(Self {
            docker,
            image: config.image.clone(),
            memory_limit_mb: config.memory_limit_mb,
            cpu_limit: config.cpu_limit,
        })
    }

    fn memory_limit_bytes(&self) -> i64 {
        (self.memory_limit_mb as i64) * 1024 * 1024
    }

    fn nano_cpus(&self) -> i64 {
        (self.cpu_limit as f64 * 1_000_000_000.0) as i64
    }

    /// Make sure the sandbox image is present, pulling it on a cache miss
    pub async fn ensure_image(&self) -> Result<()> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            debug!(image = %self.image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %self.image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: self.image.as_str(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.context("Failed to pull Docker image")?;
        }

        info!(image = %self.image, "Image pulled");
        Ok(())
    }

    fn container_config(&self, encoded: String) -> Config<String> {
        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,noexec,nosuid,size=16m".to_string());

        Config {
            image: Some(self.image.clone()),
            cmd: Some(vec![
                "python".to_string(),
                "-I".to_string(),
                "-c".to_string(),
                CONTAINER_BOOTSTRAP.to_string(),
            ]),
            env: Some(vec![format!("{}={}", HARNESS_ENV, encoded)]),
            working_dir: Some("/tmp".to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(self.memory_limit_bytes()),
                memory_swap: Some(self.memory_limit_bytes()),
                nano_cpus: Some(self.nano_cpus()),
                pids_limit: Some(64),
                readonly_rootfs: Some(true),
                tmpfs: Some(tmpfs),
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Run the harness in a fresh container with a hard timeout.
    ///
    /// Errors are infrastructure failures (daemon unreachable, image pull,
    /// create/start); a harness that crashes or times out is a normal result.
    #[tracing::instrument(skip_all, fields(backend = "docker", bytes = source.len()))]
    pub async fn execute(&self, source: &str, timeout: Duration) -> Result<RawExecution> {
        check_harness_size(source)?;

        let encoded = general_purpose::STANDARD.encode(source);
        if encoded.len() + HARNESS_ENV.len() + 1 > MAX_ENV_ENTRY_BYTES {
            bail!(
                "Encoded harness ({} bytes) does not fit in a container environment entry",
                encoded.len()
            );
        }

        self.ensure_image()
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", self.image))?;

        let container_name = format!("modelab-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), self.container_config(encoded))
            .await
            .context("Failed to create Docker container")?;

        let container_id = container.id.clone();
        let _guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container_id.clone(),
        };

        let start = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        let execution_future = async {
            let mut stdout = CappedOutput::new(MAX_OUTPUT_BYTES);
            let mut stderr = CappedOutput::new(MAX_OUTPUT_BYTES);

            let logs_options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            });
            let mut logs = self.docker.logs(&container_id, logs_options);
            while let Some(chunk) = logs.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Error reading container logs");
                        break;
                    }
                }
            }

            let wait_options = Some(WaitContainerOptions {
                condition: "not-running",
            });
            let mut wait = self.docker.wait_container(&container_id, wait_options);
            let exit_code = match wait.next().await {
                Some(Ok(response)) => Some(response.status_code),
                // bollard reports non-zero exits as an error carrying the code
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Some(code)
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to read container exit code");
                    None
                }
                None => None,
            };

            (stdout, stderr, exit_code)
        };

        match tokio::time::timeout(timeout, execution_future).await {
            Ok((stdout, stderr, exit_code)) => {
                let output_truncated = stdout.truncated || stderr.truncated;
                let stdout = stdout.into_string();
                let mut stderr = stderr.into_string();
                match exit_code {
                    Some(137) => stderr.push_str("\n[Container killed: likely exceeded memory limit]"),
                    Some(139) => stderr.push_str("\n[Container killed: segmentation fault]"),
                    _ => {}
                }
                let execution = RawExecution {
                    stdout,
                    stderr,
                    exit_code,
                    timed_out: false,
                    output_truncated,
                    execution_time_ms: start.elapsed().as_millis() as u64,
                };
                debug!(
                    exit_code = ?execution.exit_code,
                    truncated = execution.output_truncated,
                    execution_ms = execution.execution_time_ms,
                    "Container exited"
                );
                Ok(execution)
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Container timed out, killing");
                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(error = %e, "Failed to kill timed-out container");
                }
                Ok(RawExecution::timed_out(start.elapsed()))
            }
        }
    }
}

/// Seam between the scorer and whatever executes the harness
#[async_trait]
pub trait HarnessRunner: Send + Sync {
    async fn run(&self, source: &str, timeout: Duration) -> Result<RawExecution>;
}

/// Configured sandbox backend
pub enum Sandbox {
    Process(ProcessEngine),
    Docker(DockerEngine),
}

impl Sandbox {
    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        match config.backend {
            SandboxKind::Process => Ok(Sandbox::Process(ProcessEngine::new(&config.python))),
            SandboxKind::Docker => Ok(Sandbox::Docker(DockerEngine::new(config)?)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Sandbox::Process(_) => "process",
            Sandbox::Docker(_) => "docker",
        }
    }

    /// One-time warm-up before the run starts
    pub async fn prepare(&self) -> Result<()> {
        match self {
            Sandbox::Process(_) => Ok(()),
            Sandbox::Docker(engine) => engine.ensure_image().await,
        }
    }

    pub async fn execute(&self, source: &str, timeout: Duration) -> Result<RawExecution> {
        match self {
            Sandbox::Process(engine) => engine.execute(source, timeout).await,
            Sandbox::Docker(engine) => engine.execute(source, timeout).await,
        }
    }
}

#[async_trait]
impl HarnessRunner for Sandbox {
    async fn run(&self, source: &str, timeout: Duration) -> Result<RawExecution> {
        self.execute(source, timeout).await
    }
}
