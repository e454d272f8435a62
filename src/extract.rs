//! Container state extraction.
//!
//! Turns the runtime's inspect descriptor into a portable `ContainerState`,
//! and derives the mount mappings the reconciler works from.

use crate::error::{CrError, Result};
use crate::runtime::{ContainerDescriptor, ContainerRuntime};
use crate::types::{ContainerState, MountMapping, NAMESPACE_KINDS};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub const DEFAULT_RUNTIME: &str = "runc";

/// Virtual filesystems every container has without the runtime listing them.
/// (container path, fs type); host path is always the same as the container path.
pub const SYSTEM_MOUNTS: [(&str, &str); 7] = [
    ("/proc", "proc"),
    ("/sys", "sysfs"),
    ("/dev", "devtmpfs"),
    ("/dev/shm", "tmpfs"),
    ("/dev/pts", "devpts"),
    ("/dev/mqueue", "mqueue"),
    ("/sys/fs/cgroup", "cgroup"),
];

/// Inspect `name_or_id` and normalize it. Fails unless the container is running.
pub async fn container_state(
    runtime: &dyn ContainerRuntime,
    name_or_id: &str,
) -> Result<ContainerState> {
    let descriptor = runtime.inspect(name_or_id).await?;
    state_from_descriptor(descriptor, name_or_id)
}

pub fn state_from_descriptor(
    descriptor: ContainerDescriptor,
    requested: &str,
) -> Result<ContainerState> {
    if !descriptor.state.running {
        return Err(CrError::ContainerNotRunning(requested.to_string()));
    }

    let runtime = if descriptor.host_config.runtime.is_empty() {
        DEFAULT_RUNTIME.to_string()
    } else {
        descriptor.host_config.runtime.clone()
    };

    let created = DateTime::parse_from_rfc3339(&descriptor.created)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    let pid = descriptor.state.pid;
    let rootfs = descriptor
        .graph_driver
        .data
        .as_ref()
        .and_then(|d| d.get("MergedDir"))
        .cloned()
        .unwrap_or_default();

    Ok(ContainerState {
        bundle_path: bundle_path(&runtime, &descriptor.id),
        namespaces: namespace_paths(pid),
        environment: parse_env(&descriptor.config.env),
        labels: descriptor.config.labels.clone().unwrap_or_default(),
        id: descriptor.id,
        name: descriptor.name.trim_start_matches('/').to_string(),
        image: descriptor.config.image.clone(),
        cgroup_path: descriptor.host_config.cgroup_parent.clone(),
        network_config: descriptor.network_settings.networks.unwrap_or_default(),
        mounts: descriptor.mounts,
        process_pid: pid,
        created,
        rootfs,
        runtime,
        config: descriptor.config,
        host_config: descriptor.host_config,
    })
}

pub fn bundle_path(runtime: &str, id: &str) -> String {
    format!("/run/docker/runtime-{}/moby/{}", runtime, id)
}

/// `/proc/<pid>/ns/<kind>` for each namespace kind. Not checked for existence.
pub fn namespace_paths(pid: u32) -> BTreeMap<String, String> {
    NAMESPACE_KINDS
        .iter()
        .map(|kind| (kind.to_string(), format!("/proc/{}/ns/{}", pid, kind)))
        .collect()
}

fn parse_env(env: &[String]) -> BTreeMap<String, String> {
    env.iter()
        .filter_map(|e| e.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Runtime mounts in runtime order, then the well-known virtual mounts.
pub fn derive_mount_mappings(state: &ContainerState) -> Vec<MountMapping> {
    let mut mappings: Vec<MountMapping> = state
        .mounts
        .iter()
        .map(|m| MountMapping {
            container_path: m.destination.clone(),
            host_path: m.source.clone(),
            mount_type: m.mount_type.clone(),
            options: m.mode.clone(),
            is_external: true,
            read_only: !m.rw,
        })
        .collect();

    mappings.extend(
        SYSTEM_MOUNTS
            .iter()
            .map(|(path, fs)| MountMapping::external(path, path, fs)),
    );
    mappings
}
