use anyhow::Context;
use clap::{ArgAction, ArgGroup, Args, Parser, Subcommand};
use container_cr::api::create_router;
use container_cr::config::{CheckpointConfig, Config, RestoreConfig, RestoreSource, DEFAULT_CHECKPOINT_NAME};
use container_cr::state::AppState;
use container_cr::storage::list_checkpoints;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "container-cr", version, about = "Checkpoint and restore running containers with CRIU")]
struct Cli {
    /// Log level for this tool (RUST_LOG overrides)
    #[arg(long, global = true, default_value = "info", value_parser = ["debug", "info", "warn", "error"])]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Checkpoint a running container
    Checkpoint(CheckpointArgs),
    /// Restore a container from a checkpoint directory
    Restore(RestoreArgs),
    /// List complete checkpoints
    List {
        /// Checkpoint root (defaults to CR_OUTPUT_DIR)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run the HTTP API
    Serve,
    /// Print version information
    Version,
}

#[derive(Args)]
struct CheckpointArgs {
    /// Container name or id
    container: String,

    /// Checkpoint root (defaults to CR_OUTPUT_DIR)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Checkpoint name
    #[arg(short, long, default_value = DEFAULT_CHECKPOINT_NAME)]
    name: String,

    #[arg(long, default_value_t = true, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    leave_running: bool,

    /// Checkpoint established TCP connections
    #[arg(long, default_value_t = true, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    tcp: bool,

    #[arg(long, default_value_t = true, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    file_locks: bool,

    /// Run a memory-tracking pre-dump first
    #[arg(long, default_value_t = false, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    pre_dump: bool,

    #[arg(long, default_value_t = true, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    manage_cgroups: bool,

    /// Treat the container process as a shell job
    #[arg(long, default_value_t = true, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    shell: bool,
}

#[derive(Args)]
#[command(group(ArgGroup::new("source").required(true).args(["from", "archive"])))]
struct RestoreArgs {
    /// Checkpoint directory
    #[arg(long)]
    from: Option<PathBuf>,

    /// Already-extracted checkpoint archive (requires --new-name)
    #[arg(long)]
    archive: Option<PathBuf>,

    /// Name for the restored container (default: <original>-restored)
    #[arg(long)]
    new_name: Option<String>,

    #[arg(long, default_value_t = false, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    manage_cgroups: bool,

    #[arg(long, default_value_t = false, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    tcp: bool,

    #[arg(long, default_value_t = false, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    restore_sibling: bool,

    #[arg(long, default_value_t = true, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    shell: bool,

    /// Report missing mount sources before restoring
    #[arg(long, default_value_t = true, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    validate_env: bool,

    /// Create empty directories for missing mount sources
    #[arg(long, default_value_t = true, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    auto_fix_mounts: bool,

    /// Comma-separated container paths to leave out of the external mount list
    #[arg(long, value_delimiter = ',')]
    skip_mounts: Vec<String>,
}

impl CheckpointArgs {
    fn into_config(self, config: &Config) -> CheckpointConfig {
        CheckpointConfig {
            output_dir: self.output.unwrap_or_else(|| config.output_dir.clone()),
            checkpoint_name: self.name,
            leave_running: self.leave_running,
            tcp_established: self.tcp,
            file_locks: self.file_locks,
            pre_dump: self.pre_dump,
            log_level: config.engine_log_level,
            manage_cgroups: self.manage_cgroups,
            shell_job: self.shell,
        }
    }
}

impl RestoreArgs {
    fn into_config(self, config: &Config) -> RestoreConfig {
        let source = match (self.from, self.archive) {
            (Some(dir), _) => RestoreSource::Directory(dir),
            (None, Some(archive)) => RestoreSource::Archive(archive),
            // clap's required group guarantees one of the two
            (None, None) => RestoreSource::Directory(PathBuf::new()),
        };
        RestoreConfig {
            source,
            new_container_name: self.new_name,
            log_level: config.engine_log_level,
            manage_cgroups: self.manage_cgroups,
            tcp_established: self.tcp,
            restore_sibling: self.restore_sibling,
            shell_job: self.shell,
            validate_env: self.validate_env,
            auto_fix_mounts: self.auto_fix_mounts,
            skip_mounts: self
                .skip_mounts
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = Config::from_env();

    match cli.command {
        Commands::Checkpoint(args) => {
            let container = args.container.clone();
            let options = args.into_config(&config);
            let state = AppState::new(config);
            let artifact = state
                .checkpointer
                .checkpoint(&container, &options)
                .await
                .with_context(|| format!("checkpoint of {} failed", container))?;
            println!("Checkpoint created: {}", artifact.checkpoint_path);
        }
        Commands::Restore(args) => {
            let options = args.into_config(&config);
            let source = options.source.checkpoint_dir().display().to_string();
            let state = AppState::new(config);
            let outcome = state
                .restorer
                .restore(&options)
                .await
                .with_context(|| format!("restore from {} failed", source))?;
            println!(
                "Restored {} ({}){}",
                outcome.container_name,
                outcome.container_id,
                if outcome.verified { "" } else { " - verification failed, see log" }
            );
        }
        Commands::List { output } => {
            let output = output.unwrap_or_else(|| config.output_dir.clone());
            let checkpoints = list_checkpoints(&output)
                .with_context(|| format!("failed to list {}", output.display()))?;
            if checkpoints.is_empty() {
                println!("No checkpoints under {}", output.display());
            }
            for cp in checkpoints {
                println!(
                    "{}/{}\t{}\t{}\t{} image files",
                    cp.container, cp.name, cp.image, cp.created_at, cp.image_files
                );
            }
        }
        Commands::Serve => serve(config).await?,
        Commands::Version => {
            println!("container-cr {}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}

fn init_tracing(cli: &Cli) {
    let level = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("container_cr={}", level))),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        host = %config.host,
        port = %config.port,
        output_dir = %config.output_dir.display(),
        engine = ?config.engine_mode,
        "Starting container-cr service"
    );

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config);
    let app = create_router(Arc::clone(&state));

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(addr = %addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl+C received"),
        _ = terminate => tracing::info!("SIGTERM received"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_checkpoint_defaults() {
        let cli = parse(&["container-cr", "checkpoint", "c1"]);
        let Commands::Checkpoint(args) = cli.command else {
            panic!("expected checkpoint");
        };
        let config = args.into_config(&Config::default());
        assert_eq!(config.output_dir, PathBuf::from("/tmp/docker-checkpoints"));
        assert_eq!(config.checkpoint_name, "checkpoint");
        assert!(config.leave_running);
        assert!(config.tcp_established);
        assert!(config.file_locks);
        assert!(config.manage_cgroups);
        assert!(config.shell_job);
        assert!(!config.pre_dump);
    }

    #[test]
    fn test_checkpoint_explicit_false() {
        let cli = parse(&[
            "container-cr", "checkpoint", "c1", "--tcp=false", "--pre-dump", "--name", "cp1", "-o", "./out",
        ]);
        let Commands::Checkpoint(args) = cli.command else {
            panic!("expected checkpoint");
        };
        let config = args.into_config(&Config::default());
        assert!(!config.tcp_established);
        assert!(config.pre_dump);
        assert_eq!(config.checkpoint_name, "cp1");
        assert_eq!(config.output_dir, PathBuf::from("./out"));
    }

    #[test]
    fn test_restore_defaults_and_skip_list() {
        let cli = parse(&[
            "container-cr", "restore", "--from", "/out/c1/cp", "--skip-mounts", "/data, /logs",
        ]);
        let Commands::Restore(args) = cli.command else {
            panic!("expected restore");
        };
        let config = args.into_config(&Config::default());
        assert_eq!(config.source, RestoreSource::Directory("/out/c1/cp".into()));
        assert!(!config.manage_cgroups);
        assert!(!config.tcp_established);
        assert!(!config.restore_sibling);
        assert!(config.shell_job);
        assert!(config.validate_env);
        assert!(config.auto_fix_mounts);
        assert_eq!(config.skip_mounts, vec!["/data".to_string(), "/logs".to_string()]);
    }

    #[test]
    fn test_restore_requires_source() {
        assert!(Cli::try_parse_from(["container-cr", "restore"]).is_err());
        assert!(Cli::try_parse_from([
            "container-cr", "restore", "--from", "/a", "--archive", "/b"
        ])
        .is_err());
    }

    #[test]
    fn test_global_flags() {
        let cli = parse(&["container-cr", "-v", "list"]);
        assert!(cli.verbose);
        let cli = parse(&["container-cr", "version", "--log-level", "warn"]);
        assert_eq!(cli.log_level, "warn");
        assert!(Cli::try_parse_from(["container-cr", "--log-level", "loud", "version"]).is_err());
    }
}
