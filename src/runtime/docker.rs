//! Runtime backend driving the `docker` CLI.
//!
//! Every call is a short-lived subprocess; inspect output is parsed as JSON.

use crate::error::{CrError, Result};
use crate::runtime::{ContainerDescriptor, ContainerRuntime, RestoreContainerSpec, RuntimeFuture};
use std::time::Duration;
use tokio::process::Command;
use tracing::Span;

pub struct DockerCli {
    binary: String,
    span: Span,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>, span: Span) -> Self {
        Self {
            binary: binary.into(),
            span,
        }
    }

    /// Run the CLI and return stdout. Non-zero exits carry stderr in the error.
    async fn run(&self, args: &[String]) -> Result<String> {
        tracing::debug!(parent: &self.span, binary = %self.binary, args = ?args, "Running runtime command");

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| CrError::Runtime(format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("No such container") || stderr.contains("No such object") {
                return Err(CrError::NotFound(stderr));
            }
            return Err(CrError::Runtime(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                stderr
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl ContainerRuntime for DockerCli {
    fn inspect<'a>(&'a self, name_or_id: &'a str) -> RuntimeFuture<'a, ContainerDescriptor> {
        Box::pin(async move {
            let args = vec![
                "inspect".to_string(),
                "--type".to_string(),
                "container".to_string(),
                name_or_id.to_string(),
            ];
            let stdout = self.run(&args).await?;
            parse_inspect(&stdout, name_or_id)
        })
    }

    fn create<'a>(&'a self, spec: &'a RestoreContainerSpec) -> RuntimeFuture<'a, String> {
        Box::pin(async move {
            let stdout = self.run(&create_args(spec)).await?;
            let id = stdout.trim().to_string();
            if id.is_empty() {
                return Err(CrError::Runtime(
                    "container create returned no id".into(),
                ));
            }
            Ok(id)
        })
    }

    fn start<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            self.run(&["start".to_string(), id.to_string()]).await?;
            Ok(())
        })
    }

    fn stop<'a>(&'a self, id: &'a str, timeout: Duration) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            self.run(&[
                "stop".to_string(),
                "--time".to_string(),
                timeout.as_secs().to_string(),
                id.to_string(),
            ])
            .await?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            self.run(&["rm".to_string(), "-f".to_string(), id.to_string()])
                .await?;
            Ok(())
        })
    }

    fn logs<'a>(&'a self, id: &'a str, tail: usize) -> RuntimeFuture<'a, String> {
        Box::pin(async move {
            // docker logs replays the container's stderr on our stderr
            let output = Command::new(&self.binary)
                .args(["logs", "--tail", &tail.to_string(), id])
                .output()
                .await
                .map_err(|e| CrError::Runtime(format!("failed to run {}: {}", self.binary, e)))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(CrError::Runtime(format!("logs failed: {}", stderr.trim())));
            }

            let mut logs = String::from_utf8_lossy(&output.stdout).to_string();
            logs.push_str(&String::from_utf8_lossy(&output.stderr));
            Ok(logs)
        })
    }

    fn runtime_name(&self) -> &'static str {
        "docker"
    }
}

fn parse_inspect(stdout: &str, name_or_id: &str) -> Result<ContainerDescriptor> {
    let mut descriptors: Vec<ContainerDescriptor> = serde_json::from_str(stdout)?;
    if descriptors.is_empty() {
        return Err(CrError::NotFound(format!("container {}", name_or_id)));
    }
    Ok(descriptors.swap_remove(0))
}

/// Argument vector for `docker create` from a restore spec.
pub fn create_args(spec: &RestoreContainerSpec) -> Vec<String> {
    let config = &spec.config;
    let host = &spec.host_config;
    let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];

    if host.privileged {
        args.push("--privileged".into());
    }
    for (flag, mode) in [
        ("--pid", &host.pid_mode),
        ("--ipc", &host.ipc_mode),
        ("--network", &host.network_mode),
    ] {
        if !mode.is_empty() {
            args.push(flag.into());
            args.push(mode.clone());
        }
    }
    for opt in host.security_opt.iter().flatten() {
        args.push("--security-opt".into());
        args.push(opt.clone());
    }
    for cap in host.cap_add.iter().flatten() {
        args.push("--cap-add".into());
        args.push(cap.clone());
    }

    let policy = &host.restart_policy;
    if !policy.name.is_empty() && policy.name != "no" {
        args.push("--restart".into());
        if policy.name == "on-failure" && policy.maximum_retry_count > 0 {
            args.push(format!("{}:{}", policy.name, policy.maximum_retry_count));
        } else {
            args.push(policy.name.clone());
        }
    }
    if host.memory > 0 {
        args.push("--memory".into());
        args.push(host.memory.to_string());
    }
    if host.nano_cpus > 0 {
        args.push("--cpus".into());
        args.push(format!("{}", host.nano_cpus as f64 / 1e9));
    }
    if host.cpu_shares > 0 {
        args.push("--cpu-shares".into());
        args.push(host.cpu_shares.to_string());
    }

    for env in &config.env {
        args.push("--env".into());
        args.push(env.clone());
    }
    if !config.working_dir.is_empty() {
        args.push("--workdir".into());
        args.push(config.working_dir.clone());
    }
    if !config.user.is_empty() {
        args.push("--user".into());
        args.push(config.user.clone());
    }
    for (key, value) in config.labels.iter().flatten() {
        args.push("--label".into());
        args.push(format!("{}={}", key, value));
    }
    for port in config.exposed_ports.iter().flat_map(|p| p.keys()) {
        args.push("--expose".into());
        args.push(port.clone());
    }
    if config.tty {
        args.push("--tty".into());
    }
    if config.open_stdin {
        args.push("--interactive".into());
    }

    // The CLI takes a single entrypoint word; the remainder becomes leading args.
    let mut trailing: Vec<String> = Vec::new();
    if let Some(entrypoint) = &config.entrypoint {
        args.push("--entrypoint".into());
        match entrypoint.split_first() {
            Some((first, rest)) => {
                args.push(first.clone());
                trailing.extend(rest.iter().cloned());
            }
            None => args.push(String::new()),
        }
    }

    args.push(config.image.clone());
    args.extend(trailing);
    args.extend(config.cmd.iter().flatten().cloned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::sample_state;

    #[test]
    fn test_create_args_permissive_host() {
        let mut state = sample_state();
        state.config.cmd = Some(vec!["sleep".into(), "inf".into()]);
        state.config.env = vec!["A=1".into()];
        state.config.working_dir = "/app".into();
        let spec = RestoreContainerSpec::from_original(&state, "c1-restored");

        let args = create_args(&spec);
        assert_eq!(&args[..3], &["create", "--name", "c1-restored"]);
        assert!(args.contains(&"--privileged".to_string()));
        let joined = args.join(" ");
        assert!(joined.contains("--pid host"));
        assert!(joined.contains("--ipc host"));
        assert!(joined.contains("--network host"));
        assert!(joined.contains("--security-opt seccomp=unconfined"));
        assert!(joined.contains("--cap-add SYS_PTRACE"));
        assert!(joined.contains("--cap-add SYS_ADMIN"));
        assert!(joined.contains("--env A=1"));
        assert!(joined.contains("--workdir /app"));
        assert!(joined.ends_with("alpine:latest sleep inf"));
    }

    #[test]
    fn test_create_args_entrypoint_split() {
        let mut state = sample_state();
        state.config.entrypoint = Some(vec!["/bin/sh".into(), "-c".into()]);
        state.config.cmd = Some(vec!["echo hi".into()]);
        let spec = RestoreContainerSpec::from_original(&state, "r");

        let args = create_args(&spec);
        let pos = args.iter().position(|a| a == "--entrypoint").unwrap();
        assert_eq!(args[pos + 1], "/bin/sh");
        let tail: Vec<&str> = args[args.len() - 3..].iter().map(String::as_str).collect();
        assert_eq!(tail, vec!["alpine:latest", "-c", "echo hi"]);
    }

    #[test]
    fn test_create_args_restart_policy() {
        let mut state = sample_state();
        state.host_config.restart_policy.name = "on-failure".into();
        state.host_config.restart_policy.maximum_retry_count = 3;
        let spec = RestoreContainerSpec::from_original(&state, "r");
        let joined = create_args(&spec).join(" ");
        assert!(joined.contains("--restart on-failure:3"));
    }

    #[test]
    fn test_parse_inspect_empty() {
        let err = parse_inspect("[]", "ghost").unwrap_err();
        assert!(matches!(err, CrError::NotFound(_)));
    }

    #[test]
    fn test_parse_inspect_first_entry() {
        let desc = parse_inspect(r#"[{"Id": "abc", "Name": "/web"}]"#, "web").unwrap();
        assert_eq!(desc.id, "abc");
        assert_eq!(desc.name, "/web");
    }
}
