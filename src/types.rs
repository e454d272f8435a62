use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CHECKPOINT_FORMAT_VERSION: &str = "1.0";

/// Namespace kinds recorded for every checkpointed process.
pub const NAMESPACE_KINDS: [&str; 7] = ["ipc", "mnt", "net", "pid", "user", "uts", "cgroup"];

// ── Runtime records ────────────────────────────────────────────
//
// These mirror the shapes the container runtime reports on inspect, so they
// keep the runtime's PascalCase keys both on the wire and inside
// container_metadata.json.

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerConfig {
    pub hostname: String,
    pub user: String,
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub image: String,
    pub working_dir: String,
    pub labels: Option<BTreeMap<String, String>>,
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    pub tty: bool,
    pub open_stdin: bool,
    pub stdin_once: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct RestartPolicy {
    pub name: String,
    pub maximum_retry_count: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct HostConfig {
    pub runtime: String,
    pub cgroup_parent: String,
    pub privileged: bool,
    pub pid_mode: String,
    pub ipc_mode: String,
    pub network_mode: String,
    pub cap_add: Option<Vec<String>>,
    pub security_opt: Option<Vec<String>>,
    pub restart_policy: RestartPolicy,
    pub memory: i64,
    pub nano_cpus: i64,
    pub cpu_shares: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EndpointSettings {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "Gateway")]
    pub gateway: String,
    #[serde(rename = "MacAddress")]
    pub mac_address: String,
}

/// A mount as the runtime reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MountPoint {
    #[serde(rename = "Type")]
    pub mount_type: String,
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "Source")]
    pub source: String,
    #[serde(rename = "Destination")]
    pub destination: String,
    #[serde(rename = "Driver", skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(rename = "Mode")]
    pub mode: String,
    #[serde(rename = "RW")]
    pub rw: bool,
    #[serde(rename = "Propagation")]
    pub propagation: String,
}

// ── Checkpoint records ─────────────────────────────────────────

/// Portable snapshot of a running container taken at checkpoint time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerState {
    pub id: String,
    pub name: String,
    pub image: String,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    pub network_config: BTreeMap<String, EndpointSettings>,
    pub mounts: Vec<MountPoint>,
    pub process_pid: u32,
    pub created: DateTime<Utc>,
    pub rootfs: String,
    pub runtime: String,
    pub bundle_path: String,
    pub cgroup_path: String,
    pub namespaces: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl ContainerState {
    /// First 12 characters of the id, the way runtimes print it.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MountMapping {
    pub container_path: String,
    pub host_path: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub options: String,
    pub is_external: bool,
    pub read_only: bool,
}

impl MountMapping {
    pub fn external(container_path: &str, host_path: &str, mount_type: &str) -> Self {
        Self {
            container_path: container_path.into(),
            host_path: host_path.into(),
            mount_type: mount_type.into(),
            options: String::new(),
            is_external: true,
            read_only: false,
        }
    }
}

/// Terminal record of a successful checkpoint (`checkpoint_metadata.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointArtifact {
    pub container_state: ContainerState,
    pub mount_mappings: Vec<MountMapping>,
    pub checkpoint_path: String,
    pub created_at: String,
    pub version: String,
}

impl CheckpointArtifact {
    pub fn new(
        container_state: ContainerState,
        mount_mappings: Vec<MountMapping>,
        checkpoint_path: String,
    ) -> Self {
        Self {
            container_state,
            mount_mappings,
            checkpoint_path,
            created_at: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            version: CHECKPOINT_FORMAT_VERSION.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub container: String,
    pub name: String,
    pub path: String,
    pub created_at: String,
    pub image: String,
    pub image_files: usize,
}

impl CheckpointSummary {
    pub fn from_artifact(artifact: &CheckpointArtifact, name: &str, image_files: usize) -> Self {
        Self {
            container: artifact.container_state.name.clone(),
            name: name.to_string(),
            path: artifact.checkpoint_path.clone(),
            created_at: artifact.created_at.clone(),
            image: artifact.container_state.image.clone(),
            image_files,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestoreOutcome {
    pub container_id: String,
    pub container_name: String,
    pub target_pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restored_pid: Option<i32>,
    pub verified: bool,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn test_mount_point_runtime_keys() {
        let json = r#"{
            "Type": "bind",
            "Source": "/tmp/d1",
            "Destination": "/data",
            "Mode": "",
            "RW": true,
            "Propagation": "rprivate"
        }"#;
        let mount: MountPoint = serde_json::from_str(json).unwrap();
        assert_eq!(mount.mount_type, "bind");
        assert_eq!(mount.destination, "/data");
        assert!(mount.rw);
        assert!(mount.name.is_none());
    }

    #[test]
    fn test_mount_mapping_keys() {
        let mapping = MountMapping::external("/data", "/tmp/d1", "bind");
        let json = serde_json::to_value(&mapping).unwrap();
        assert_eq!(json["container_path"], "/data");
        assert_eq!(json["host_path"], "/tmp/d1");
        assert_eq!(json["type"], "bind");
        assert_eq!(json["is_external"], true);
        assert_eq!(json["read_only"], false);
    }

    #[test]
    fn test_container_config_tolerates_nulls() {
        let json = r#"{"Image": "alpine", "Cmd": null, "Labels": null, "Env": ["A=1"]}"#;
        let config: ContainerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.image, "alpine");
        assert!(config.cmd.is_none());
        assert_eq!(config.env, vec!["A=1".to_string()]);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_artifact_version() {
        let artifact = CheckpointArtifact::new(
            sample_state(),
            vec![MountMapping::external("/proc", "/proc", "proc")],
            "/out/c1/cp".into(),
        );
        assert_eq!(artifact.version, CHECKPOINT_FORMAT_VERSION);
        assert!(artifact.created_at.ends_with('Z'));
    }

    pub(crate) fn sample_state() -> ContainerState {
        ContainerState {
            id: "0123456789abcdef".into(),
            name: "c1".into(),
            image: "alpine:latest".into(),
            config: ContainerConfig::default(),
            host_config: HostConfig::default(),
            network_config: BTreeMap::new(),
            mounts: Vec::new(),
            process_pid: 4242,
            created: Utc::now(),
            rootfs: String::new(),
            runtime: "runc".into(),
            bundle_path: String::new(),
            cgroup_path: String::new(),
            namespaces: BTreeMap::new(),
            environment: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }
}
