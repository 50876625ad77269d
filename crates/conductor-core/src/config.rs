//! Configuration resolution for Conductor.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`~/.config/conductor/settings.json`)
//! 3. Project config (`.conductor/settings.json`)
//! 4. Environment variables
//! 5. CLI arguments (applied by the binary, highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variables forwarded to agent processes. Everything else in
/// the parent environment is dropped.
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "TMPDIR",
    "LANG",
    "LC_ALL",
    "XDG_CONFIG_HOME",
    "XDG_DATA_HOME",
    "TERM",
    "ANTHROPIC_API_KEY",
    "CLAUDE_CODE_API_KEY",
];

/// Complete Conductor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    /// Agent executable, resolved through `PATH` when relative.
    pub claude_bin: PathBuf,
    /// Directory agents run in. Defaults to the current directory.
    pub working_directory: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            log_level: "info".to_string(),
            claude_bin: PathBuf::from("claude"),
            working_directory: None,
        }
    }
}

/// Agent session defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub default_model: String,
    /// Grace period between SIGTERM and SIGKILL.
    pub terminate_timeout_secs: u64,
    pub env_allowlist: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_model: "sonnet".to_string(),
            terminate_timeout_secs: 5,
            env_allowlist: DEFAULT_ENV_ALLOWLIST
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

/// Streaming pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-session ring buffer capacity.
    pub buffer_capacity: usize,
    /// Batched emission interval.
    pub emit_interval_ms: u64,
    /// Persist once this many entries are queued...
    pub persist_batch_size: usize,
    /// ...or once this much time has passed.
    pub persist_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            emit_interval_ms: 100,
            persist_batch_size: 100,
            persist_interval_ms: 500,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        config = load_config_file(&global_path)?;
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".conductor").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_home().map(|p| p.join("conductor").join("settings.json"))
}

/// Default database location, next to the global config file.
pub fn database_path() -> Option<PathBuf> {
    config_home().map(|p| p.join("conductor").join("conductor.db"))
}

fn config_home() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        })
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    if overlay.daemon.database_path.is_some() {
        base.daemon.database_path = overlay.daemon.database_path;
    }
    if overlay.daemon.working_directory.is_some() {
        base.daemon.working_directory = overlay.daemon.working_directory;
    }
    base.daemon.log_level = overlay.daemon.log_level;
    base.daemon.claude_bin = overlay.daemon.claude_bin;

    base.sessions = overlay.sessions;
    base.pipeline = overlay.pipeline;
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("CONDUCTOR_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Some(val) = var("CONDUCTOR_CLAUDE_BIN") {
        config.daemon.claude_bin = PathBuf::from(val);
    }
    if let Some(val) = var("CONDUCTOR_DB_PATH") {
        config.daemon.database_path = Some(PathBuf::from(val));
    }
    if let Some(val) = var("CONDUCTOR_DEFAULT_MODEL") {
        config.sessions.default_model = val;
    }
    if let Some(n) = var("CONDUCTOR_TERMINATE_TIMEOUT").and_then(|v| v.parse().ok()) {
        config.sessions.terminate_timeout_secs = n;
    }
    if let Some(n) = var("CONDUCTOR_BUFFER_CAPACITY").and_then(|v| v.parse().ok()) {
        config.pipeline.buffer_capacity = n;
    }
}
