use crate::error::{CrError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_OUTPUT_DIR: &str = "/tmp/docker-checkpoints";
pub const DEFAULT_CHECKPOINT_NAME: &str = "checkpoint";
/// CRIU log verbosity used unless overridden (4 = debug).
pub const DEFAULT_ENGINE_LOG_LEVEL: i32 = 4;

/// Which engine invocation paths are tried, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// `criu swrk` RPC first, command line as fallback.
    Rpc,
    /// Command line only.
    Command,
}

impl std::str::FromStr for EngineMode {
    type Err = CrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rpc" | "swrk" => Ok(Self::Rpc),
            "command" | "cmd" | "cli" => Ok(Self::Command),
            other => Err(CrError::InvalidConfig(format!(
                "unknown engine mode: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub output_dir: PathBuf,
    pub criu_binary: String,
    pub docker_binary: String,
    pub engine_mode: EngineMode,
    pub engine_log_level: i32,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8083),
            output_dir: std::env::var("CR_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            criu_binary: std::env::var("CRIU_BINARY").unwrap_or_else(|_| "criu".into()),
            docker_binary: std::env::var("DOCKER_BINARY").unwrap_or_else(|_| "docker".into()),
            engine_mode: std::env::var("CR_ENGINE")
                .ok()
                .and_then(|m| m.parse().ok())
                .unwrap_or(EngineMode::Rpc),
            engine_log_level: std::env::var("CR_LOG_LEVEL")
                .ok()
                .and_then(|l| l.parse().ok())
                .unwrap_or(DEFAULT_ENGINE_LOG_LEVEL),
        }
    }

    pub fn checkpoint_dir(&self, container: &str, name: &str) -> PathBuf {
        checkpoint_dir(&self.output_dir, container, name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8083,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            criu_binary: "criu".into(),
            docker_binary: "docker".into(),
            engine_mode: EngineMode::Rpc,
            engine_log_level: DEFAULT_ENGINE_LOG_LEVEL,
        }
    }
}

/// `<output>/<container>/<checkpoint>`
pub fn checkpoint_dir(output_dir: &Path, container: &str, name: &str) -> PathBuf {
    output_dir.join(container).join(name)
}

pub fn images_dir(checkpoint_dir: &Path) -> PathBuf {
    checkpoint_dir.join("images")
}

// ── Per-invocation records ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub output_dir: PathBuf,
    pub checkpoint_name: String,
    pub leave_running: bool,
    pub tcp_established: bool,
    pub file_locks: bool,
    pub pre_dump: bool,
    pub log_level: i32,
    pub manage_cgroups: bool,
    pub shell_job: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            checkpoint_name: DEFAULT_CHECKPOINT_NAME.into(),
            leave_running: true,
            tcp_established: true,
            file_locks: true,
            pre_dump: false,
            log_level: DEFAULT_ENGINE_LOG_LEVEL,
            manage_cgroups: true,
            shell_job: true,
        }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_name.is_empty() {
            return Err(CrError::InvalidConfig("checkpoint name cannot be empty".into()));
        }
        if self.checkpoint_name.contains('/')
            || self.checkpoint_name == "."
            || self.checkpoint_name == ".."
        {
            return Err(CrError::InvalidConfig(format!(
                "checkpoint name must be a single path component: {}",
                self.checkpoint_name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "path", rename_all = "snake_case")]
pub enum RestoreSource {
    Directory(PathBuf),
    /// Must already be extracted; the path is used as a checkpoint directory.
    Archive(PathBuf),
}

impl RestoreSource {
    pub fn checkpoint_dir(&self) -> &Path {
        match self {
            Self::Directory(p) | Self::Archive(p) => p,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    pub source: RestoreSource,
    #[serde(default)]
    pub new_container_name: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: i32,
    #[serde(default)]
    pub manage_cgroups: bool,
    #[serde(default)]
    pub tcp_established: bool,
    #[serde(default)]
    pub restore_sibling: bool,
    #[serde(default = "default_true")]
    pub shell_job: bool,
    #[serde(default = "default_true")]
    pub validate_env: bool,
    #[serde(default = "default_true")]
    pub auto_fix_mounts: bool,
    #[serde(default)]
    pub skip_mounts: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> i32 {
    DEFAULT_ENGINE_LOG_LEVEL
}

impl RestoreConfig {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            source: RestoreSource::Directory(dir.into()),
            new_container_name: None,
            log_level: DEFAULT_ENGINE_LOG_LEVEL,
            manage_cgroups: false,
            tcp_established: false,
            restore_sibling: false,
            shell_job: true,
            validate_env: true,
            auto_fix_mounts: true,
            skip_mounts: Vec::new(),
        }
    }

    /// Checks flag combinations that the orchestrator cannot resolve itself.
    pub fn validate(&self) -> Result<()> {
        if let RestoreSource::Archive(_) = self.source {
            let named = self
                .new_container_name
                .as_deref()
                .is_some_and(|n| !n.is_empty());
            if !named {
                return Err(CrError::InvalidConfig(
                    "--new-name is required when restoring from archive".into(),
                ));
            }
        }
        Ok(())
    }
}

pub fn default_restore_name(original: &str) -> String {
    format!("{}-restored", original)
}
