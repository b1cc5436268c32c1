//! Runner process state and status reporting.
//!
//! A runner is an external process holding model weights and serving
//! completion and embedding calls over loopback HTTP. The scheduler owns one
//! [`RunnerState`] machine per runner; handlers only ever see leases and the
//! [`RunnerStatus`] rows reported by `ps`.

pub mod spawner;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discover::DeviceId;
use crate::model::{ModelKey, OptionsKey};

/// Lifecycle of a runner process.
///
/// Transitions are monotonic (`Loading → Ready → Draining → Unloaded`)
/// except that a failed spawn goes straight from `Loading` to `Unloaded`.
/// A `Draining` runner accepts no new leases and unloads once its last
/// lease is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    Loading,
    Ready,
    Draining,
    Unloaded,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerState::Loading => "loading",
            RunnerState::Ready => "ready",
            RunnerState::Draining => "draining",
            RunnerState::Unloaded => "unloaded",
        };
        f.write_str(s)
    }
}

/// How long a runner outlives its last lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    /// Unload as soon as the last lease is released.
    Immediate,
    /// Stay loaded this long after the last release.
    For(Duration),
    /// Never expire.
    Forever,
}

impl KeepAlive {
    /// Seconds as configured or requested: negative = forever, 0 =
    /// immediate.
    pub fn from_secs(secs: i64) -> Self {
        match secs {
            s if s < 0 => KeepAlive::Forever,
            0 => KeepAlive::Immediate,
            s => KeepAlive::For(Duration::from_secs(s as u64)),
        }
    }
}

impl fmt::Display for KeepAlive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeepAlive::Immediate => f.write_str("0s"),
            KeepAlive::For(d) => write!(f, "{}s", d.as_secs()),
            KeepAlive::Forever => f.write_str("forever"),
        }
    }
}

/// One row of `ps` output.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerStatus {
    pub model: String,
    pub model_key: ModelKey,
    pub options_key: OptionsKey,
    pub state: RunnerState,
    pub ref_count: usize,
    /// Seconds until expiry, when an expiry is armed.
    pub expires_in_secs: Option<u64>,
    pub vram_total: u64,
    pub gpus: Vec<DeviceId>,
    pub port: Option<u16>,
    pub pid: Option<u32>,
}

/// Body of the runner's `/health` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub error: Option<String>,
}
