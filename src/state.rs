use crate::checkpoint::Checkpointer;
use crate::config::Config;
use crate::restore::Restorer;
use crate::runtime::{ContainerRuntime, DockerCli};
use crate::snapshot::SnapshotEngine;
use std::sync::Arc;
use std::time::Instant;

/// Shared state behind the HTTP API. Requests are not serialized against
/// each other; two checkpoints to the same path race on disk.
pub struct AppState {
    pub config: Config,
    pub checkpointer: Checkpointer,
    pub restorer: Restorer,
    pub engine: Arc<SnapshotEngine>,
    pub runtime_name: &'static str,
    pub start_time: Instant,
}

impl AppState {
    /// Docker CLI runtime and the configured engine strategies.
    pub fn new(config: Config) -> Arc<Self> {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new(
            config.docker_binary.clone(),
            tracing::info_span!("runtime", backend = "docker"),
        ));
        let engine = Arc::new(SnapshotEngine::from_config(
            &config,
            tracing::info_span!("engine", mode = ?config.engine_mode),
        ));
        Self::with_parts(config, runtime, engine)
    }

    pub fn with_parts(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        engine: Arc<SnapshotEngine>,
    ) -> Arc<Self> {
        let checkpointer = Checkpointer::new(
            Arc::clone(&runtime),
            Arc::clone(&engine),
            tracing::info_span!("checkpoint"),
        );
        let restorer = Restorer::new(
            Arc::clone(&runtime),
            Arc::clone(&engine),
            tracing::info_span!("restore"),
        );
        Arc::new(Self {
            runtime_name: runtime.runtime_name(),
            config,
            checkpointer,
            restorer,
            engine,
            start_time: Instant::now(),
        })
    }
}
