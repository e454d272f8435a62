//! Container runtime collaborator.
//!
//! The orchestrators only need a narrow slice of a runtime's lifecycle API:
//! inspect, create, start, stop, remove and a log tail. `DockerCli` provides
//! it on top of the `docker` binary; tests provide in-memory fakes.

pub mod docker;

use crate::error::Result;
use crate::types::{
    ContainerConfig, ContainerState, EndpointSettings, HostConfig, MountPoint, RestartPolicy,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub use docker::DockerCli;

pub type RuntimeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Capability interface over the container runtime.
pub trait ContainerRuntime: Send + Sync {
    fn inspect<'a>(&'a self, name_or_id: &'a str) -> RuntimeFuture<'a, ContainerDescriptor>;

    fn create<'a>(&'a self, spec: &'a RestoreContainerSpec) -> RuntimeFuture<'a, String>;

    fn start<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()>;

    fn stop<'a>(&'a self, id: &'a str, timeout: Duration) -> RuntimeFuture<'a, ()>;

    fn remove<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()>;

    fn logs<'a>(&'a self, id: &'a str, tail: usize) -> RuntimeFuture<'a, String>;

    fn runtime_name(&self) -> &'static str;
}

// ── Inspect descriptor ─────────────────────────────────────────

/// Container descriptor as returned by the runtime's inspect call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerDescriptor {
    #[serde(rename = "Id")]
    pub id: String,
    pub created: String,
    pub name: String,
    pub state: RunState,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    pub network_settings: NetworkSettings,
    pub mounts: Vec<MountPoint>,
    pub graph_driver: GraphDriver,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct RunState {
    pub status: String,
    pub running: bool,
    pub paused: bool,
    pub pid: u32,
    pub exit_code: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct NetworkSettings {
    pub networks: Option<BTreeMap<String, EndpointSettings>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct GraphDriver {
    pub name: String,
    pub data: Option<BTreeMap<String, String>>,
}

// ── Shell container spec ───────────────────────────────────────

/// Grace period given to the shell container before CRIU takes its slot.
pub const SHELL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// What to create as the restore target.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreContainerSpec {
    pub name: String,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
}

impl RestoreContainerSpec {
    /// Original image and process config, permissive host config.
    ///
    /// CRIU needs host PID/IPC/network visibility and ptrace/admin caps to
    /// inject the checkpointed tree, so those are forced regardless of how
    /// the original container was configured. Restart policy and resource
    /// limits carry over.
    pub fn from_original(state: &ContainerState, name: &str) -> Self {
        let original = &state.config;
        let config = ContainerConfig {
            hostname: String::new(),
            user: original.user.clone(),
            env: original.env.clone(),
            cmd: original.cmd.clone(),
            entrypoint: original.entrypoint.clone(),
            image: state.image.clone(),
            working_dir: original.working_dir.clone(),
            labels: original.labels.clone(),
            exposed_ports: original.exposed_ports.clone(),
            tty: original.tty,
            open_stdin: original.open_stdin,
            stdin_once: original.stdin_once,
        };

        let host_config = HostConfig {
            runtime: String::new(),
            cgroup_parent: String::new(),
            privileged: true,
            pid_mode: "host".into(),
            ipc_mode: "host".into(),
            network_mode: "host".into(),
            cap_add: Some(vec!["SYS_PTRACE".into(), "SYS_ADMIN".into()]),
            security_opt: Some(vec!["seccomp=unconfined".into()]),
            restart_policy: RestartPolicy {
                name: state.host_config.restart_policy.name.clone(),
                maximum_retry_count: state.host_config.restart_policy.maximum_retry_count,
            },
            memory: state.host_config.memory,
            nano_cpus: state.host_config.nano_cpus,
            cpu_shares: state.host_config.cpu_shares,
        };

        Self {
            name: name.to_string(),
            config,
            host_config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::sample_state;

    #[test]
    fn test_descriptor_from_inspect_json() {
        let json = r#"{
            "Id": "0123456789abcdef0123",
            "Created": "2024-05-01T10:00:00.123456789Z",
            "Name": "/c1",
            "State": {"Status": "running", "Running": true, "Pid": 4242},
            "Config": {"Image": "alpine:latest", "Env": ["PATH=/bin"], "Cmd": ["sleep", "inf"]},
            "HostConfig": {"Runtime": "", "CgroupParent": ""},
            "NetworkSettings": {"Networks": {"bridge": {"IPAddress": "172.17.0.2"}}},
            "Mounts": [{"Type": "bind", "Source": "/tmp/d1", "Destination": "/data", "RW": true}],
            "GraphDriver": {"Name": "overlay2", "Data": {"MergedDir": "/var/lib/docker/overlay2/x/merged"}}
        }"#;
        let desc: ContainerDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(desc.name, "/c1");
        assert!(desc.state.running);
        assert_eq!(desc.state.pid, 4242);
        assert_eq!(desc.mounts.len(), 1);
        assert_eq!(
            desc.network_settings.networks.unwrap()["bridge"].ip_address,
            "172.17.0.2"
        );
    }

    #[test]
    fn test_restore_spec_is_permissive() {
        let mut state = sample_state();
        state.config.cmd = Some(vec!["sleep".into(), "inf".into()]);
        state.config.env = vec!["A=1".into()];
        state.host_config.memory = 1 << 29;
        state.host_config.restart_policy.name = "always".into();

        let spec = RestoreContainerSpec::from_original(&state, "c1-restored");
        assert_eq!(spec.name, "c1-restored");
        assert_eq!(spec.config.image, "alpine:latest");
        assert_eq!(spec.config.cmd, state.config.cmd);
        assert_eq!(spec.config.env, vec!["A=1".to_string()]);
        assert!(spec.host_config.privileged);
        assert_eq!(spec.host_config.pid_mode, "host");
        assert_eq!(spec.host_config.ipc_mode, "host");
        assert_eq!(spec.host_config.network_mode, "host");
        assert_eq!(
            spec.host_config.cap_add,
            Some(vec!["SYS_PTRACE".to_string(), "SYS_ADMIN".to_string()])
        );
        assert_eq!(spec.host_config.memory, 1 << 29);
        assert_eq!(spec.host_config.restart_policy.name, "always");
    }
}
