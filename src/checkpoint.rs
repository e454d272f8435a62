//! Checkpoint orchestrator: runtime → mounts → engine → disk.

use crate::config::{checkpoint_dir, CheckpointConfig};
use crate::error::Result;
use crate::extract::{container_state, derive_mount_mappings};
use crate::mounts::{build_external_mounts, validate_mount_sources};
use crate::runtime::ContainerRuntime;
use crate::snapshot::{DumpOptions, SnapshotEngine};
use crate::storage::CheckpointDir;
use crate::types::CheckpointArtifact;
use std::sync::Arc;
use tracing::Span;

pub struct Checkpointer {
    runtime: Arc<dyn ContainerRuntime>,
    engine: Arc<SnapshotEngine>,
    span: Span,
}

impl Checkpointer {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, engine: Arc<SnapshotEngine>, span: Span) -> Self {
        Self {
            runtime,
            engine,
            span,
        }
    }

    /// Checkpoint a running container. Any failed step aborts the whole run;
    /// directories already created are left behind for diagnosis.
    pub async fn checkpoint(
        &self,
        container: &str,
        config: &CheckpointConfig,
    ) -> Result<CheckpointArtifact> {
        config.validate()?;
        self.engine.ensure_available()?;

        let state = container_state(self.runtime.as_ref(), container).await?;
        tracing::info!(
            parent: &self.span,
            container = %state.name,
            id = %state.short_id(),
            pid = state.process_pid,
            "Container state extracted"
        );

        let dir = CheckpointDir::new(checkpoint_dir(
            &config.output_dir,
            &state.name,
            &config.checkpoint_name,
        ));
        dir.create()?;

        let mappings = derive_mount_mappings(&state);
        tracing::info!(parent: &self.span, count = mappings.len(), "Mount mappings derived");

        let created = validate_mount_sources(&mappings, &self.span)?;
        if created > 0 {
            tracing::info!(parent: &self.span, created, "Created placeholder mount sources");
        }

        let external = build_external_mounts(&mappings);

        dir.save_mount_mappings(&mappings)?;
        dir.save_container_state(&state)?;
        dir.write_ext_mount_map(&mappings)?;

        let mut opts = DumpOptions::new(state.process_pid, dir.path(), &dir.images_dir());
        opts.log_level = config.log_level;
        opts.external = external;
        opts.manage_cgroups = config.manage_cgroups;
        opts.tcp_established = config.tcp_established;
        opts.file_locks = config.file_locks;
        opts.leave_running = config.leave_running;
        opts.shell_job = config.shell_job;
        opts.pre_dump = config.pre_dump;
        self.engine.dump(&opts).await?;

        let artifact = CheckpointArtifact::new(state, mappings, dir.path().to_string_lossy().into());
        dir.save_artifact(&artifact)?;

        tracing::info!(
            parent: &self.span,
            container = %artifact.container_state.name,
            path = %artifact.checkpoint_path,
            "Checkpoint completed"
        );
        Ok(artifact)
    }
}
