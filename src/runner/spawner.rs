//! Spawning and supervising runner processes.
//!
//! The scheduler treats spawning as opaque: it hands a [`SpawnSpec`] to a
//! [`RunnerSpawner`] and gets back a [`RunnerHandle`] it can health-poll,
//! watch for exit, and stop. Production uses [`SubprocessSpawner`] (the
//! runner binary over loopback TCP); tests inject an in-memory fake.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::watch;

use crate::discover::{DeviceDescriptor, LibraryTag};
use crate::estimate::MemoryEstimate;
use crate::model::{ModelKey, OptionsKey, RunnerOptions};
use crate::runner::HealthResponse;

/// Everything needed to start one runner process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub model_name: String,
    pub model_key: ModelKey,
    pub options_key: OptionsKey,
    pub weights_path: PathBuf,
    pub options: RunnerOptions,
    pub estimate: MemoryEstimate,
    /// Devices the placement uses, in assignment order. All share one
    /// library; the scheduler never mixes backends in a single runner.
    pub devices: Vec<DeviceDescriptor>,
}

/// Why a spawn failed. Cloned to every request queued on the load.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpawnError {
    #[error("runner binary not found: {0}")]
    BinaryMissing(String),

    #[error("failed to start runner: {0}")]
    Spawn(String),

    #[error("runner reported an error while loading: {0}")]
    Health(String),

    #[error("runner did not become ready in time")]
    LoadTimeout,

    #[error("runner ran out of device memory")]
    OutOfMemory,

    #[error("runner exited during load with status {0}")]
    Exited(i32),
}

impl SpawnError {
    pub fn is_oom(&self) -> bool {
        matches!(self, SpawnError::OutOfMemory)
    }
}

/// Map a runner health-endpoint error detail to a failure kind.
pub fn classify_health_error(detail: &str) -> SpawnError {
    let lower = detail.to_lowercase();
    if lower.contains("out of memory")
        || lower.contains("oom")
        || lower.contains("failed to allocate")
    {
        SpawnError::OutOfMemory
    } else {
        SpawnError::Health(detail.to_string())
    }
}

/// A spawned runner process.
#[async_trait]
pub trait RunnerHandle: Send + Sync {
    fn port(&self) -> u16;
    fn pid(&self) -> Option<u32>;

    /// Poll until the runner reports healthy, it exits, or the timeout
    /// elapses.
    async fn wait_healthy(&self, timeout: Duration) -> Result<(), SpawnError>;

    /// Resolve when the process exits, with its status code if known.
    async fn wait_exit(&self) -> Option<i32>;

    /// Ask the runner to exit, escalating to SIGKILL after `grace`.
    /// Idempotent; returns once the process is gone or the kill was sent.
    async fn stop(&self, grace: Duration);
}

#[async_trait]
pub trait RunnerSpawner: Send + Sync {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Arc<dyn RunnerHandle>, SpawnError>;
}

/// Launches the runner binary as a child process on a fresh loopback port.
pub struct SubprocessSpawner {
    binary: PathBuf,
    client: reqwest::Client,
}

impl SubprocessSpawner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            client: reqwest::Client::new(),
        }
    }
}

/// CLI arguments for the runner binary.
fn build_args(spec: &SpawnSpec, port: u16) -> Vec<String> {
    let opts = &spec.options;
    let mut args = vec![
        "--model".into(),
        spec.weights_path.display().to_string(),
        "--port".into(),
        port.to_string(),
        "--ctx-size".into(),
        opts.context_length.to_string(),
        "--parallel".into(),
        opts.num_parallel.max(1).to_string(),
        "--n-gpu-layers".into(),
        spec.estimate.layers_offloaded.to_string(),
    ];
    if spec.estimate.tensor_split.len() > 1 {
        args.push("--tensor-split".into());
        args.push(
            spec.estimate
                .tensor_split
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    if opts.flash_attention {
        args.push("--flash-attn".into());
    }
    args.push("--kv-cache-type".into());
    args.push(opts.kv_cache_type.as_str().into());
    if opts.mlock {
        args.push("--mlock".into());
    }
    if let Some(numa) = &opts.numa {
        args.push("--numa".into());
        args.push(numa.clone());
    }
    args
}

/// The environment variable restricting the runner to its assigned devices.
fn visible_devices_env(devices: &[DeviceDescriptor]) -> Option<(&'static str, String)> {
    let library = devices.first()?.library;
    let var = library.visible_devices_env()?;
    let indices: Vec<&str> = devices
        .iter()
        .map(|d| d.id.as_str().rsplit(':').next().unwrap_or(d.id.as_str()))
        .collect();
    let value = match library {
        LibraryTag::Metal => devices.len().to_string(),
        LibraryTag::OneApi => format!("level_zero:{}", indices.join(",")),
        _ => indices.join(","),
    };
    Some((var, value))
}

#[async_trait]
impl RunnerSpawner for SubprocessSpawner {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Arc<dyn RunnerHandle>, SpawnError> {
        if !self.binary.exists() {
            return Err(SpawnError::BinaryMissing(self.binary.display().to_string()));
        }

        // Grab an ephemeral port; the listener is dropped before the runner
        // binds it, which is racy in principle but fine on loopback.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .map_err(|e| SpawnError::Spawn(format!("no free port: {}", e)))?;

        let mut command = Command::new(&self.binary);
        command
            .args(build_args(spec, port))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::inherit());
        if let Some((var, value)) = visible_devices_env(&spec.devices) {
            command.env(var, value);
        }
        let dep_paths: Vec<String> = spec
            .devices
            .iter()
            .flat_map(|d| &d.dependency_paths)
            .map(|p| p.display().to_string())
            .collect();
        if !dep_paths.is_empty() {
            command.env("LD_LIBRARY_PATH", dep_paths.join(":"));
        }

        let mut child = command
            .spawn()
            .map_err(|e| SpawnError::Spawn(e.to_string()))?;
        let pid = child.id().unwrap_or_default();
        tracing::info!(
            "Spawned runner for {} (pid={}, port={}, {})",
            spec.model_name,
            pid,
            port,
            spec.estimate.summary()
        );

        // One reaper task per child; everyone else observes the exit code
        // through the watch channel.
        let (exit_tx, exit_rx) = watch::channel::<Option<i32>>(None);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            let _ = exit_tx.send(Some(code));
        });

        Ok(Arc::new(SubprocessHandle {
            port,
            pid,
            exit_rx,
            client: self.client.clone(),
        }))
    }
}

struct SubprocessHandle {
    port: u16,
    pid: u32,
    exit_rx: watch::Receiver<Option<i32>>,
    client: reqwest::Client,
}

impl SubprocessHandle {
    fn exited(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    fn signal(&self, signal: i32) {
        #[cfg(unix)]
        unsafe {
            libc::kill(self.pid as i32, signal);
        }
        #[cfg(not(unix))]
        let _ = signal;
    }
}

#[async_trait]
impl RunnerHandle for SubprocessHandle {
    fn port(&self) -> u16 {
        self.port
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait_healthy(&self, timeout: Duration) -> Result<(), SpawnError> {
        let url = format!("http://127.0.0.1:{}/health", self.port);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(code) = self.exited() {
                return Err(SpawnError::Exited(code));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SpawnError::LoadTimeout);
            }

            match self.client.get(&url).send().await {
                Ok(resp) => match resp.json::<HealthResponse>().await {
                    Ok(health) => match health.status.as_str() {
                        "ok" => return Ok(()),
                        "error" => {
                            let detail = health.error.unwrap_or_else(|| "unknown".into());
                            return Err(classify_health_error(&detail));
                        }
                        _ => {
                            tracing::debug!(
                                "Runner on port {} loading ({:.0}%)",
                                self.port,
                                health.progress * 100.0
                            );
                        }
                    },
                    Err(_) => {}
                },
                // not listening yet
                Err(_) => {}
            }

            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn wait_exit(&self) -> Option<i32> {
        let mut rx = self.exit_rx.clone();
        let result = match rx.wait_for(|v| v.is_some()).await {
            Ok(v) => *v,
            Err(_) => None,
        };
        result
    }

    async fn stop(&self, grace: Duration) {
        if self.exited().is_some() {
            return;
        }
        tracing::debug!("Stopping runner pid={} (grace {:?})", self.pid, grace);
        self.signal(libc_sigterm());

        let mut rx = self.exit_rx.clone();
        if tokio::time::timeout(grace, rx.wait_for(|v| v.is_some()))
            .await
            .is_ok()
        {
            return;
        }

        tracing::warn!("Runner pid={} ignored SIGTERM, killing", self.pid);
        self.signal(libc_sigkill());
        let mut rx = self.exit_rx.clone();
        let _ = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|v| v.is_some())).await;
    }
}

#[cfg(unix)]
fn libc_sigterm() -> i32 {
    libc::SIGTERM
}
#[cfg(unix)]
fn libc_sigkill() -> i32 {
    libc::SIGKILL
}
#[cfg(not(unix))]
fn libc_sigterm() -> i32 {
    15
}
#[cfg(not(unix))]
fn libc_sigkill() -> i32 {
    9
}
