//! Snapshot engine driver.
//!
//! CRIU can be reached two ways: the `criu swrk` RPC protocol (rpc.rs) and
//! the plain command line (criu.rs). Both are `EngineStrategy`s built from the
//! same option records; the driver tries them in order for dumps and uses
//! only the primary for pre-dumps and restores.

pub mod criu;
pub mod rpc;

use crate::config::{Config, EngineMode};
use crate::error::{CrError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tracing::Span;

pub use criu::CriuCommand;
pub use rpc::CriuRpc;

pub const DUMP_LOG: &str = "dump.log";
pub const RESTORE_LOG: &str = "restore.log";

/// Engine log lines quoted in a failure message.
const LOG_TAIL_LINES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CgroupMode {
    Ignore,
    None,
    Props,
    Soft,
    Full,
    Strict,
    Default,
}

impl CgroupMode {
    pub fn as_flag(&self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::None => "none",
            Self::Props => "props",
            Self::Soft => "soft",
            Self::Full => "full",
            Self::Strict => "strict",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DumpOptions {
    pub pid: u32,
    pub work_dir: PathBuf,
    pub images_dir: PathBuf,
    /// Bare file name; CRIU places it in the work dir.
    pub log_file: String,
    pub log_level: i32,
    pub external: Vec<String>,
    pub manage_cgroups: bool,
    pub cgroup_mode: CgroupMode,
    pub tcp_established: bool,
    pub file_locks: bool,
    pub leave_running: bool,
    pub shell_job: bool,
    pub ext_unix_sk: bool,
    pub pre_dump: bool,
    pub track_mem: bool,
}

impl DumpOptions {
    pub fn new(pid: u32, work_dir: &Path, images_dir: &Path) -> Self {
        Self {
            pid,
            work_dir: work_dir.to_path_buf(),
            images_dir: images_dir.to_path_buf(),
            log_file: DUMP_LOG.into(),
            log_level: crate::config::DEFAULT_ENGINE_LOG_LEVEL,
            external: Vec::new(),
            manage_cgroups: false,
            cgroup_mode: CgroupMode::Soft,
            tcp_established: false,
            file_locks: false,
            leave_running: false,
            shell_job: false,
            // containers always hold unix sockets whose peers live outside the tree
            ext_unix_sk: true,
            pre_dump: false,
            track_mem: false,
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.work_dir.join(&self.log_file)
    }

    /// Options for the warm-up pass: memory tracking on, TCP repair off.
    pub fn for_pre_dump(&self) -> Self {
        Self {
            tcp_established: false,
            track_mem: true,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreOptions {
    pub work_dir: PathBuf,
    pub images_dir: PathBuf,
    pub log_file: String,
    pub log_level: i32,
    pub external: Vec<String>,
    pub ext_mount_map: Vec<String>,
    pub manage_cgroups: bool,
    pub cgroup_mode: CgroupMode,
    pub tcp_established: bool,
    pub restore_sibling: bool,
    pub shell_job: bool,
    /// Namespaces CRIU creates empty instead of restoring.
    pub empty_ns: u32,
}

impl RestoreOptions {
    pub fn new(work_dir: &Path, images_dir: &Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            images_dir: images_dir.to_path_buf(),
            log_file: RESTORE_LOG.into(),
            log_level: crate::config::DEFAULT_ENGINE_LOG_LEVEL,
            external: Vec::new(),
            ext_mount_map: Vec::new(),
            manage_cgroups: false,
            cgroup_mode: CgroupMode::Soft,
            tcp_established: false,
            restore_sibling: false,
            shell_job: false,
            // fresh mount namespace on every restore
            empty_ns: libc::CLONE_NEWNS as u32,
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.work_dir.join(&self.log_file)
    }
}

pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// One way of invoking the snapshot engine.
pub trait EngineStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    fn pre_dump<'a>(&'a self, opts: &'a DumpOptions) -> EngineFuture<'a, ()>;

    fn dump<'a>(&'a self, opts: &'a DumpOptions) -> EngineFuture<'a, ()>;

    /// Returns the restored root PID when the engine reports it.
    fn restore<'a>(&'a self, opts: &'a RestoreOptions) -> EngineFuture<'a, Option<i32>>;
}

pub struct SnapshotEngine {
    strategies: Vec<Box<dyn EngineStrategy>>,
    span: Span,
}

impl SnapshotEngine {
    pub fn new(strategies: Vec<Box<dyn EngineStrategy>>, span: Span) -> Self {
        Self { strategies, span }
    }

    pub fn from_config(config: &Config, span: Span) -> Self {
        let command: Box<dyn EngineStrategy> = Box::new(CriuCommand::new(&config.criu_binary));
        let strategies = match config.engine_mode {
            EngineMode::Rpc => {
                let rpc: Box<dyn EngineStrategy> = Box::new(CriuRpc::new(&config.criu_binary));
                vec![rpc, command]
            }
            EngineMode::Command => vec![command],
        };
        Self::new(strategies, span)
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn ensure_available(&self) -> Result<()> {
        if self.strategies.iter().any(|s| s.is_available()) {
            return Ok(());
        }
        Err(CrError::EngineUnavailable(format!(
            "no usable snapshot engine (tried: {})",
            self.strategy_names().join(", ")
        )))
    }

    fn primary(&self) -> Result<&dyn EngineStrategy> {
        self.strategies
            .first()
            .map(|s| s.as_ref())
            .ok_or_else(|| CrError::EngineUnavailable("no engine strategies configured".into()))
    }

    /// Optional pre-dump, then dump through each strategy until one succeeds.
    pub async fn dump(&self, opts: &DumpOptions) -> Result<()> {
        if opts.pre_dump {
            let primary = self.primary()?;
            tracing::info!(parent: &self.span, strategy = primary.name(), pid = opts.pid, "Performing pre-dump");
            if let Err(e) = primary.pre_dump(&opts.for_pre_dump()).await {
                return Err(CrError::SnapshotEngineFailure(format!(
                    "pre-dump via {} failed: {:#}{}",
                    primary.name(),
                    e,
                    log_section(&opts.log_path())
                )));
            }
        }

        let mut failures = Vec::new();
        for strategy in &self.strategies {
            tracing::info!(parent: &self.span, strategy = strategy.name(), pid = opts.pid, "Performing checkpoint");
            match strategy.dump(opts).await {
                Ok(()) => {
                    tracing::info!(parent: &self.span, strategy = strategy.name(), "Checkpoint completed");
                    return Ok(());
                }
                Err(e) => {
                    let detail = format!("{:#}", e);
                    tracing::warn!(parent: &self.span, strategy = strategy.name(), error = %detail, "Dump failed");
                    failures.push(format!("{} error: {}", strategy.name(), detail));
                }
            }
        }

        Err(CrError::SnapshotEngineFailure(format!(
            "all dump paths failed\n{}{}",
            failures.join("\n"),
            log_section(&opts.log_path())
        )))
    }

    /// Single-phase restore through the primary strategy. No fallback.
    pub async fn restore(&self, opts: &RestoreOptions) -> Result<Option<i32>> {
        let primary = self.primary()?;
        tracing::info!(parent: &self.span, strategy = primary.name(), images = %opts.images_dir.display(), "Performing restore");
        match primary.restore(opts).await {
            Ok(pid) => {
                tracing::info!(parent: &self.span, restored_pid = ?pid, "Restore completed");
                Ok(pid)
            }
            Err(e) => Err(CrError::SnapshotEngineFailure(format!(
                "restore via {} failed: {:#}{}",
                primary.name(),
                e,
                log_section(&opts.log_path())
            ))),
        }
    }
}

fn log_section(log_path: &Path) -> String {
    match read_log_tail(log_path, LOG_TAIL_LINES) {
        Some(tail) => format!("\nengine log ({}):\n{}", log_path.display(), tail),
        None => String::new(),
    }
}

/// Last `lines` lines of the engine log, if it exists and is non-empty.
pub fn read_log_tail(path: &Path, lines: usize) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let all: Vec<&str> = content.lines().collect();
    if all.is_empty() {
        return None;
    }
    let start = all.len().saturating_sub(lines);
    Some(all[start..].join("\n"))
}

/// Locate the engine binary: explicit paths are checked directly, bare names
/// are searched on `PATH`.
pub fn resolve_binary(binary: &str) -> Option<PathBuf> {
    if binary.contains('/') {
        let path = PathBuf::from(binary);
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}
