//! Command-line snapshot strategy.
//!
//! Spawns `criu dump` / `criu pre-dump` / `criu restore` with flags built from
//! the shared option records. Output is captured and surfaced on failure.

use super::{resolve_binary, DumpOptions, EngineFuture, EngineStrategy, RestoreOptions};
use anyhow::{bail, Context};
use std::path::Path;

/// Mount points the command path never tries to checkpoint.
pub const SKIPPED_MOUNTS: [&str; 4] = ["/proc", "/dev", "/sys", "/run"];

/// Written by `criu restore --pidfile`, relative to the work dir.
pub const RESTORE_PIDFILE: &str = "restore.pid";

pub struct CriuCommand {
    criu_binary: String,
}

impl CriuCommand {
    pub fn new(criu_binary: impl Into<String>) -> Self {
        Self {
            criu_binary: criu_binary.into(),
        }
    }

    async fn run(&self, args: &[String], work_dir: &Path) -> anyhow::Result<()> {
        let output = tokio::process::Command::new(&self.criu_binary)
            .args(args)
            .current_dir(work_dir)
            .output()
            .await
            .with_context(|| format!("failed to spawn {}", self.criu_binary))?;

        if !output.status.success() {
            let mut detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if detail.is_empty() {
                detail = String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
            bail!(
                "criu {} exited with {}: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                detail
            );
        }
        Ok(())
    }
}

impl EngineStrategy for CriuCommand {
    fn name(&self) -> &'static str {
        "command"
    }

    fn is_available(&self) -> bool {
        resolve_binary(&self.criu_binary).is_some()
    }

    fn pre_dump<'a>(&'a self, opts: &'a DumpOptions) -> EngineFuture<'a, ()> {
        Box::pin(async move { self.run(&pre_dump_args(opts), &opts.work_dir).await })
    }

    fn dump<'a>(&'a self, opts: &'a DumpOptions) -> EngineFuture<'a, ()> {
        Box::pin(async move { self.run(&dump_args(opts), &opts.work_dir).await })
    }

    fn restore<'a>(&'a self, opts: &'a RestoreOptions) -> EngineFuture<'a, Option<i32>> {
        Box::pin(async move {
            let pidfile = opts.work_dir.join(RESTORE_PIDFILE);
            // a stale pidfile would be reported as the new process
            let _ = std::fs::remove_file(&pidfile);

            self.run(&restore_args(opts), &opts.work_dir).await?;

            Ok(std::fs::read_to_string(&pidfile)
                .ok()
                .and_then(|s| s.trim().parse::<i32>().ok()))
        })
    }
}

fn common_dump_args(action: &str, opts: &DumpOptions) -> Vec<String> {
    let mut args = vec![
        action.to_string(),
        "--tree".into(),
        opts.pid.to_string(),
        "--images-dir".into(),
        opts.images_dir.to_string_lossy().into_owned(),
        "--work-dir".into(),
        opts.work_dir.to_string_lossy().into_owned(),
        "--log-file".into(),
        opts.log_file.clone(),
        format!("-v{}", opts.log_level),
    ];

    if opts.manage_cgroups {
        args.push(format!("--manage-cgroups={}", opts.cgroup_mode.as_flag()));
    }
    if opts.tcp_established {
        args.push("--tcp-established".into());
    }
    if opts.file_locks {
        args.push("--file-locks".into());
    }
    if opts.leave_running {
        args.push("--leave-running".into());
    }
    if opts.shell_job {
        args.push("--shell-job".into());
    }
    if opts.ext_unix_sk {
        args.push("--ext-unix-sk".into());
    }
    if opts.track_mem {
        args.push("--track-mem".into());
    }
    for mount in SKIPPED_MOUNTS {
        args.push("--skip-mnt".into());
        args.push(mount.into());
    }
    for external in &opts.external {
        args.push("--external".into());
        args.push(external.clone());
    }
    args
}

pub fn dump_args(opts: &DumpOptions) -> Vec<String> {
    common_dump_args("dump", opts)
}

pub fn pre_dump_args(opts: &DumpOptions) -> Vec<String> {
    common_dump_args("pre-dump", opts)
}

pub fn restore_args(opts: &RestoreOptions) -> Vec<String> {
    let mut args = vec![
        "restore".to_string(),
        "--images-dir".into(),
        opts.images_dir.to_string_lossy().into_owned(),
        "--work-dir".into(),
        opts.work_dir.to_string_lossy().into_owned(),
        "--log-file".into(),
        opts.log_file.clone(),
        format!("-v{}", opts.log_level),
        "--restore-detached".into(),
        "--pidfile".into(),
        RESTORE_PIDFILE.into(),
    ];

    if opts.manage_cgroups {
        args.push(format!("--manage-cgroups={}", opts.cgroup_mode.as_flag()));
    }
    if opts.tcp_established {
        args.push("--tcp-established".into());
    }
    if opts.restore_sibling {
        args.push("--restore-sibling".into());
    }
    if opts.shell_job {
        args.push("--shell-job".into());
    }
    for external in &opts.external {
        args.push("--external".into());
        args.push(external.clone());
    }
    for entry in &opts.ext_mount_map {
        args.push("--ext-mount-map".into());
        args.push(entry.clone());
    }
    args
}
