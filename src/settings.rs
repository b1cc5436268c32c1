//! Server settings.
//!
//! Settings are stored as JSON in the config directory and can be overridden
//! per-key with `KILN_*` environment variables, which always win over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runner::KeepAlive;

/// Server settings persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Address the HTTP server binds to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port the HTTP server binds to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory holding model manifests and weights. Defaults to the
    /// user data directory.
    #[serde(default)]
    pub models_dir: Option<PathBuf>,
    /// Path to the inference runner binary.
    #[serde(default = "default_runner_bin")]
    pub runner_bin: PathBuf,
    /// Global cap on loaded runners. 0 = unlimited.
    #[serde(default)]
    pub max_runners: usize,
    /// Bound on queued load requests. Overflow is rejected.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    /// Default per-runner concurrency permit count.
    #[serde(default = "default_num_parallel")]
    pub num_parallel: u32,
    /// Default session duration in seconds. Negative = infinite, 0 =
    /// unload immediately on release.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: i64,
    /// Max time in seconds for a runner to become healthy.
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,
    /// Bound in seconds on the shutdown drain.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Spread layers across all GPUs instead of filling one at a time.
    #[serde(default)]
    pub sched_spread: bool,
    /// Per-GPU VRAM in bytes reserved from scheduling.
    #[serde(default)]
    pub gpu_overhead: u64,
    /// Subset of discovered device ids eligible for scheduling. None = all.
    #[serde(default)]
    pub visible_devices: Option<Vec<String>>,
}

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 11745 }
fn default_runner_bin() -> PathBuf { PathBuf::from("kiln-runner") }
fn default_max_queue() -> usize { 512 }
fn default_num_parallel() -> u32 { 1 }
fn default_keep_alive_secs() -> i64 { 300 }
fn default_load_timeout_secs() -> u64 { 300 }
fn default_shutdown_timeout_secs() -> u64 { 30 }

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            models_dir: None,
            runner_bin: default_runner_bin(),
            max_runners: 0,
            max_queue: default_max_queue(),
            num_parallel: default_num_parallel(),
            keep_alive_secs: default_keep_alive_secs(),
            load_timeout_secs: default_load_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            sched_spread: false,
            gpu_overhead: 0,
            visible_devices: None,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, then apply environment overrides.
    /// Returns defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Self {
        let mut settings = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse settings file: {} — using defaults", e);
                Self::default()
            }),
            Err(_) => {
                tracing::info!("No settings file found, using defaults");
                Self::default()
            }
        };
        settings.apply_env();
        settings
    }

    /// Default settings file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiln")
            .join("settings.json")
    }

    /// Default models directory when `models_dir` is unset.
    pub fn models_dir(&self) -> PathBuf {
        self.models_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("kiln")
                .join("models")
        })
    }

    pub fn keep_alive(&self) -> KeepAlive {
        KeepAlive::from_secs(self.keep_alive_secs)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Apply `KILN_*` environment variable overrides.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup. Unparseable values are
    /// logged and skipped.
    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse_into<T: std::str::FromStr>(slot: &mut T, key: &str, raw: String) {
            match raw.parse() {
                Ok(v) => *slot = v,
                Err(_) => tracing::warn!("Ignoring unparseable {}={}", key, raw),
            }
        }

        if let Some(v) = lookup("KILN_HOST") {
            self.host = v;
        }
        if let Some(v) = lookup("KILN_PORT") {
            parse_into(&mut self.port, "KILN_PORT", v);
        }
        if let Some(v) = lookup("KILN_MODELS") {
            self.models_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("KILN_RUNNER_BIN") {
            self.runner_bin = PathBuf::from(v);
        }
        if let Some(v) = lookup("KILN_MAX_RUNNERS") {
            parse_into(&mut self.max_runners, "KILN_MAX_RUNNERS", v);
        }
        if let Some(v) = lookup("KILN_MAX_QUEUE") {
            parse_into(&mut self.max_queue, "KILN_MAX_QUEUE", v);
        }
        if let Some(v) = lookup("KILN_NUM_PARALLEL") {
            parse_into(&mut self.num_parallel, "KILN_NUM_PARALLEL", v);
        }
        if let Some(v) = lookup("KILN_KEEP_ALIVE") {
            parse_into(&mut self.keep_alive_secs, "KILN_KEEP_ALIVE", v);
        }
        if let Some(v) = lookup("KILN_LOAD_TIMEOUT") {
            parse_into(&mut self.load_timeout_secs, "KILN_LOAD_TIMEOUT", v);
        }
        if let Some(v) = lookup("KILN_SHUTDOWN_TIMEOUT") {
            parse_into(&mut self.shutdown_timeout_secs, "KILN_SHUTDOWN_TIMEOUT", v);
        }
        if let Some(v) = lookup("KILN_SCHED_SPREAD") {
            self.sched_spread = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = lookup("KILN_GPU_OVERHEAD") {
            parse_into(&mut self.gpu_overhead, "KILN_GPU_OVERHEAD", v);
        }
        if let Some(v) = lookup("KILN_VISIBLE_DEVICES") {
            self.visible_devices = Some(
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            );
        }
    }

    /// Save settings to a JSON file.
    pub fn save(&self, path: &Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Settings saved to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.max_runners, 0);
        assert_eq!(settings.max_queue, 512);
        assert_eq!(settings.keep_alive_secs, 300);
        assert_eq!(settings.keep_alive(), KeepAlive::For(Duration::from_secs(300)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Settings {
            max_runners: 2,
            keep_alive_secs: -1,
            ..Settings::default()
        };
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path);
        assert_eq!(loaded.max_runners, 2);
        assert_eq!(loaded.keep_alive(), KeepAlive::Forever);
    }

    #[test]
    fn test_load_missing_file() {
        let settings = Settings::load(Path::new("/nonexistent/settings.json"));
        assert_eq!(settings.max_queue, 512);
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::default();
        settings.apply_env_from(|key| match key {
            "KILN_MAX_RUNNERS" => Some("3".into()),
            "KILN_KEEP_ALIVE" => Some("0".into()),
            "KILN_SCHED_SPREAD" => Some("true".into()),
            "KILN_VISIBLE_DEVICES" => Some("cuda:0, cuda:1".into()),
            _ => None,
        });
        assert_eq!(settings.max_runners, 3);
        assert_eq!(settings.keep_alive(), KeepAlive::Immediate);
        assert!(settings.sched_spread);
        assert_eq!(
            settings.visible_devices,
            Some(vec!["cuda:0".to_string(), "cuda:1".to_string()])
        );
    }

    #[test]
    fn test_env_bad_value_ignored() {
        let mut settings = Settings::default();
        settings.apply_env_from(|key| match key {
            "KILN_PORT" => Some("not-a-port".into()),
            _ => None,
        });
        assert_eq!(settings.port, default_port());
    }
}
