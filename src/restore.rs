//! Restore orchestrator.
//!
//! A linear state machine: each step either advances to the next state or
//! aborts the restore. Only verification is advisory.

use crate::config::{default_restore_name, RestoreConfig};
use crate::error::{CrError, Result};
use crate::mounts::{
    build_ext_mount_map_args, missing_mount_sources, restore_external_mounts,
    validate_mount_sources,
};
use crate::runtime::{ContainerRuntime, RestoreContainerSpec, SHELL_STOP_TIMEOUT};
use crate::snapshot::{RestoreOptions, SnapshotEngine};
use crate::storage::CheckpointDir;
use crate::types::{MountMapping, RestoreOutcome};
use std::fmt;
use std::sync::Arc;
use tracing::Span;

/// Log lines shown after a verified restore.
pub const VERIFY_LOG_LINES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    Idle,
    Validated,
    MetadataLoaded,
    ShellCreated,
    MountsPrepared,
    Started,
    PidCaptured,
    Stopped,
    Restored,
    Verified,
    Done,
}

impl RestoreState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Validated => "Validated",
            Self::MetadataLoaded => "MetadataLoaded",
            Self::ShellCreated => "ShellCreated",
            Self::MountsPrepared => "MountsPrepared",
            Self::Started => "Started",
            Self::PidCaptured => "PIDCaptured",
            Self::Stopped => "Stopped",
            Self::Restored => "Restored",
            Self::Verified => "Verified",
            Self::Done => "Done",
        }
    }
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the current state and logs each transition.
struct Progress<'a> {
    state: RestoreState,
    span: &'a Span,
}

impl<'a> Progress<'a> {
    fn new(span: &'a Span) -> Self {
        Self {
            state: RestoreState::Idle,
            span,
        }
    }

    fn advance(&mut self, next: RestoreState) {
        tracing::info!(parent: self.span, from = %self.state, to = %next, "Restore state transition");
        self.state = next;
    }
}

/// Build the engine options for a restore from the checkpoint's mappings.
pub fn restore_options(dir: &CheckpointDir, mappings: &[MountMapping], config: &RestoreConfig) -> RestoreOptions {
    let mut opts = RestoreOptions::new(dir.path(), &dir.images_dir());
    opts.log_level = config.log_level;
    opts.external = restore_external_mounts(mappings, &config.skip_mounts);
    opts.ext_mount_map = build_ext_mount_map_args(mappings, &config.skip_mounts);
    opts.manage_cgroups = config.manage_cgroups;
    opts.tcp_established = config.tcp_established;
    opts.restore_sibling = config.restore_sibling;
    opts.shell_job = config.shell_job;
    opts
}

pub struct Restorer {
    runtime: Arc<dyn ContainerRuntime>,
    engine: Arc<SnapshotEngine>,
    span: Span,
}

impl Restorer {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, engine: Arc<SnapshotEngine>, span: Span) -> Self {
        Self {
            runtime,
            engine,
            span,
        }
    }

    pub async fn restore(&self, config: &RestoreConfig) -> Result<RestoreOutcome> {
        let mut progress = Progress::new(&self.span);
        config.validate()?;

        let dir = CheckpointDir::new(config.source.checkpoint_dir());
        dir.validate()?;
        self.engine.ensure_available()?;
        progress.advance(RestoreState::Validated);

        let artifact = dir.load_artifact()?;
        let mappings = dir.load_mount_mappings()?;
        let original = &artifact.container_state;
        progress.advance(RestoreState::MetadataLoaded);

        let name = match config.new_container_name.as_deref() {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => default_restore_name(&original.name),
        };
        tracing::info!(
            parent: &self.span,
            original = %original.name,
            id = %original.short_id(),
            target = %name,
            "Restoring checkpoint"
        );

        if config.validate_env {
            self.check_environment(&mappings);
        }

        let spec = RestoreContainerSpec::from_original(original, &name);
        let id = self.runtime.create(&spec).await?;
        tracing::info!(parent: &self.span, id = %crate::types::short_id(&id), name = %name, "Shell container created");
        progress.advance(RestoreState::ShellCreated);

        if config.auto_fix_mounts {
            validate_mount_sources(&mappings, &self.span)?;
        } else {
            for mapping in missing_mount_sources(&mappings) {
                tracing::warn!(
                    parent: &self.span,
                    container_path = %mapping.container_path,
                    host_path = %mapping.host_path,
                    "Mount source missing; restore may fail"
                );
            }
        }
        dir.write_ext_mount_map(&mappings)?;
        progress.advance(RestoreState::MountsPrepared);

        self.runtime.start(&id).await?;
        progress.advance(RestoreState::Started);

        let target_pid = self.runtime.inspect(&id).await?.state.pid;
        if target_pid == 0 {
            return Err(CrError::Runtime(format!(
                "shell container {} reported no PID after start",
                name
            )));
        }
        tracing::info!(parent: &self.span, pid = target_pid, "Captured shell PID");
        progress.advance(RestoreState::PidCaptured);

        if let Err(e) = self.runtime.stop(&id, SHELL_STOP_TIMEOUT).await {
            tracing::warn!(parent: &self.span, error = %e, "Failed to stop shell container");
        }
        progress.advance(RestoreState::Stopped);

        let opts = restore_options(&dir, &mappings, config);
        let restored_pid = self.engine.restore(&opts).await?;
        progress.advance(RestoreState::Restored);

        let verified = self.verify(&name).await;
        if verified {
            progress.advance(RestoreState::Verified);
        }
        progress.advance(RestoreState::Done);

        Ok(RestoreOutcome {
            container_id: id,
            container_name: name,
            target_pid,
            restored_pid,
            verified,
        })
    }

    /// Advisory: report host paths the checkpoint expects but this host lacks.
    fn check_environment(&self, mappings: &[MountMapping]) {
        let missing = missing_mount_sources(mappings);
        for mapping in &missing {
            tracing::warn!(
                parent: &self.span,
                container_path = %mapping.container_path,
                host_path = %mapping.host_path,
                "Mount source missing on this host"
            );
        }
        if missing.is_empty() {
            tracing::info!(parent: &self.span, "Environment validation passed");
        } else {
            tracing::warn!(parent: &self.span, missing = missing.len(), "Environment validation found missing mount sources");
        }
    }

    async fn verify(&self, name: &str) -> bool {
        let warning = match self.runtime.inspect(name).await {
            Ok(desc) if desc.state.running => {
                tracing::info!(
                    parent: &self.span,
                    id = %crate::types::short_id(&desc.id),
                    name = %name,
                    pid = desc.state.pid,
                    "Restored container is running"
                );
                match self.runtime.logs(&desc.id, VERIFY_LOG_LINES).await {
                    Ok(logs) => tracing::info!(parent: &self.span, logs = %logs.trim_end(), "Recent container logs"),
                    Err(e) => tracing::debug!(parent: &self.span, error = %e, "Could not read container logs"),
                }
                return true;
            }
            Ok(desc) => CrError::RestoreVerificationWarning(format!(
                "container {} is not running (status: {})",
                name, desc.state.status
            )),
            Err(e) => CrError::RestoreVerificationWarning(format!(
                "could not inspect container {}: {}",
                name, e
            )),
        };
        tracing::warn!(parent: &self.span, error = %warning, "Restore verification failed");
        false
    }
}
