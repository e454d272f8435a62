//! Mount reconciliation between the runtime's view and CRIU's view.
//!
//! The runtime reports named volumes and bind mounts; CRIU wants a flat list
//! of mount points it must treat as external. Everything here is pure string
//! building except `validate_mount_sources`, which repairs missing host paths.

use crate::error::{CrError, Result};
use crate::extract::SYSTEM_MOUNTS;
use crate::types::MountMapping;
use std::collections::HashSet;
use std::path::Path;
use tracing::Span;

/// Mounts every Docker-style container carries that CRIU cannot discover
/// through the container's mount list. Always emitted first at dump time.
pub const DUMP_ALLOW_LIST: [&str; 11] = [
    "/proc/sys",
    "/proc/sysrq-trigger",
    "/proc/irq",
    "/proc/bus",
    "/sys/fs/cgroup",
    "/sys",
    "/dev",
    "/.dockerenv",
    "/etc/hosts",
    "/etc/hostname",
    "/etc/resolv.conf",
];

/// Container paths handled by the allow-list; mappings under them are skipped.
const VIRTUAL_ROOTS: [&str; 3] = ["/proc", "/sys", "/dev"];

/// Appended to every restore external list, whatever the skip list says.
pub const RESTORE_SAFE_MOUNTS: [&str; 3] = ["/proc", "/dev", "/sys"];

pub fn dump_descriptor(container_path: &str) -> String {
    format!("mnt[{}]", container_path)
}

pub fn restore_descriptor(container_path: &str, host_path: &str) -> String {
    if host_path.is_empty() {
        dump_descriptor(container_path)
    } else {
        format!("mnt[{}]:{}", container_path, host_path)
    }
}

/// Trailing slashes dropped, root kept as `/`.
fn normalize(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/"
    } else {
        trimmed
    }
}

fn is_under(path: &str, root: &str) -> bool {
    let path = normalize(path);
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn under_virtual_root(path: &str) -> bool {
    VIRTUAL_ROOTS.iter().any(|root| is_under(path, root))
}

fn wants_host_path(mapping: &MountMapping) -> bool {
    mapping.is_external && !mapping.host_path.is_empty()
}

/// Dump-time `--external` descriptors.
///
/// Allow-list first, then one `mnt[<path>]` per external mapping that has a
/// host path and is not under `/proc`, `/sys` or `/dev`. A container path is
/// never named twice.
pub fn build_external_mounts(mappings: &[MountMapping]) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut external = Vec::new();

    for path in DUMP_ALLOW_LIST {
        if seen.insert(path) {
            external.push(dump_descriptor(path));
        }
    }

    for mapping in mappings {
        if !wants_host_path(mapping) || under_virtual_root(&mapping.container_path) {
            continue;
        }
        let path = normalize(&mapping.container_path);
        if seen.insert(path) {
            external.push(dump_descriptor(path));
        }
    }

    external
}

/// Restore-time external list: mapping descriptors minus `skip`, then the
/// fixed `/proc`, `/dev`, `/sys` entries.
pub fn restore_external_mounts(mappings: &[MountMapping], skip: &[String]) -> Vec<String> {
    let skip: HashSet<&str> = skip.iter().map(|s| normalize(s)).collect();
    let mut seen: HashSet<&str> = RESTORE_SAFE_MOUNTS.iter().copied().collect();
    let mut external = Vec::new();

    for mapping in mappings.iter().filter(|m| m.is_external) {
        let path = normalize(&mapping.container_path);
        if skip.contains(path) {
            continue;
        }
        if seen.insert(path) {
            external.push(restore_descriptor(path, &mapping.host_path));
        }
    }

    for path in RESTORE_SAFE_MOUNTS {
        external.push(restore_descriptor(path, path));
    }

    external
}

/// (container path, host path) pairs for the ext-mount-map, deduplicated,
/// with the standard virtual filesystems mapped onto themselves.
fn ext_mount_pairs(mappings: &[MountMapping]) -> Vec<(String, String)> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut pairs = Vec::new();

    let explicit = mappings
        .iter()
        .filter(|m| wants_host_path(m))
        .map(|m| (normalize(&m.container_path), m.host_path.as_str()));
    let standard = SYSTEM_MOUNTS.iter().map(|(path, _)| (*path, *path));

    for (container_path, host_path) in explicit.chain(standard) {
        if seen.insert(container_path.to_string()) {
            pairs.push((container_path.to_string(), host_path.to_string()));
        }
    }
    pairs
}

/// `auto:<container_path>:<host_path>` entries for restore, minus the
/// container paths in `skip`.
pub fn build_ext_mount_map_args(mappings: &[MountMapping], skip: &[String]) -> Vec<String> {
    let skip: HashSet<&str> = skip.iter().map(|s| normalize(s)).collect();
    ext_mount_pairs(mappings)
        .into_iter()
        .filter(|(cp, _)| !skip.contains(cp.as_str()))
        .map(|(cp, hp)| format!("auto:{}:{}", cp, hp))
        .collect()
}

/// Container path named by a `mnt[<path>]...` or `auto:<path>:<host>` descriptor.
pub fn descriptor_container_path(descriptor: &str) -> Option<&str> {
    if let Some(rest) = descriptor.strip_prefix("mnt[") {
        return rest.find(']').map(|end| normalize(&rest[..end]));
    }
    descriptor
        .strip_prefix("auto:")
        .and_then(|rest| rest.split_once(':'))
        .map(|(cp, _)| normalize(cp))
}

/// `external` followed by the ext-mount-map entries whose container path it
/// does not already name.
pub fn merge_restore_descriptors(external: &[String], ext_mount_map: &[String]) -> Vec<String> {
    let mut seen: HashSet<&str> = external
        .iter()
        .filter_map(|d| descriptor_container_path(d))
        .collect();
    let mut merged = external.to_vec();
    for entry in ext_mount_map {
        let fresh = descriptor_container_path(entry).map_or(true, |path| seen.insert(path));
        if fresh {
            merged.push(entry.clone());
        }
    }
    merged
}

/// Render the human-readable `ext_mount_map` file.
pub fn render_ext_mount_map(mappings: &[MountMapping]) -> String {
    let mut content = String::from(
        "# External mount map for container restore\n# Format: container_path:host_path\n",
    );
    for (cp, hp) in ext_mount_pairs(mappings) {
        content.push_str(&cp);
        content.push(':');
        content.push_str(&hp);
        content.push('\n');
    }
    content
}

pub fn create_ext_mount_map_file(mappings: &[MountMapping], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, render_ext_mount_map(mappings))?;
    Ok(())
}

/// External mappings whose host path is missing on this host. Host paths
/// under `/proc`, `/sys` and `/dev` are kernel-provided and never reported.
pub fn missing_mount_sources(mappings: &[MountMapping]) -> Vec<&MountMapping> {
    mappings
        .iter()
        .filter(|m| wants_host_path(m) && !under_virtual_root(&m.host_path))
        .filter(|m| !Path::new(&m.host_path).exists())
        .collect()
}

/// Create an empty directory for every missing external host path.
///
/// Restores structure, not content: a recreated bind source is empty.
/// Returns how many placeholders were created.
pub fn validate_mount_sources(mappings: &[MountMapping], span: &Span) -> Result<usize> {
    let mut created = 0;
    for mapping in missing_mount_sources(mappings) {
        tracing::warn!(
            parent: span,
            container_path = %mapping.container_path,
            host_path = %mapping.host_path,
            "Mount source does not exist, creating placeholder"
        );
        std::fs::create_dir_all(&mapping.host_path).map_err(|source| {
            CrError::MountSourceCreationFailure {
                path: mapping.host_path.clone().into(),
                source,
            }
        })?;
        created += 1;
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn data_mapping() -> MountMapping {
        MountMapping::external("/data", "/tmp/d1", "bind")
    }

    fn with_system(mut mappings: Vec<MountMapping>) -> Vec<MountMapping> {
        mappings.extend(
            SYSTEM_MOUNTS
                .iter()
                .map(|(p, fs)| MountMapping::external(p, p, fs)),
        );
        mappings
    }

    fn container_path(descriptor: &str) -> &str {
        let start = descriptor.find('[').unwrap() + 1;
        let end = descriptor.find(']').unwrap();
        &descriptor[start..end]
    }

    #[test]
    fn test_allow_list_first_then_mappings() {
        let external = build_external_mounts(&with_system(vec![data_mapping()]));
        assert_eq!(external.len(), DUMP_ALLOW_LIST.len() + 1);
        assert_eq!(external[0], "mnt[/proc/sys]");
        assert_eq!(external.last().unwrap(), "mnt[/data]");
    }

    #[test]
    fn test_no_duplicate_container_paths() {
        let mappings = with_system(vec![
            data_mapping(),
            MountMapping::external("/data/", "/tmp/d2", "bind"),
            MountMapping::external("/etc/hosts", "/var/lib/docker/hosts", "bind"),
            MountMapping::external("/dev/shm", "/dev/shm", "tmpfs"),
        ]);
        let external = build_external_mounts(&mappings);
        let mut seen = HashSet::new();
        for descriptor in &external {
            assert!(
                seen.insert(container_path(descriptor)),
                "duplicate descriptor {}",
                descriptor
            );
        }
    }

    #[test]
    fn test_internal_mappings_never_emitted() {
        let mut internal = MountMapping::external("/cache", "/tmp/cache", "volume");
        internal.is_external = false;
        let external = build_external_mounts(&[internal]);
        assert!(!external.iter().any(|d| d.contains("/cache")));
    }

    #[test]
    fn test_empty_host_path_skipped() {
        let external = build_external_mounts(&[MountMapping::external("/scratch", "", "tmpfs")]);
        assert!(!external.iter().any(|d| d.contains("/scratch")));
    }

    #[test]
    fn test_virtual_roots_are_path_prefixes() {
        let external = build_external_mounts(&[
            MountMapping::external("/device-data", "/srv/dd", "bind"),
            MountMapping::external("/proc/driver", "/srv/pd", "bind"),
        ]);
        assert!(external.contains(&"mnt[/device-data]".to_string()));
        assert!(!external.contains(&"mnt[/proc/driver]".to_string()));
    }

    #[test]
    fn test_restore_skip_list() {
        let mappings = with_system(vec![data_mapping()]);
        let skip = vec!["/data".to_string(), "/proc".to_string()];
        let external = restore_external_mounts(&mappings, &skip);

        assert!(!external.iter().any(|d| d.starts_with("mnt[/data]")));
        assert!(external.contains(&"mnt[/proc]:/proc".to_string()));
        assert!(external.contains(&"mnt[/dev]:/dev".to_string()));
        assert!(external.contains(&"mnt[/sys]:/sys".to_string()));
        assert!(external.contains(&"mnt[/dev/shm]:/dev/shm".to_string()));

        let mut seen = HashSet::new();
        assert!(external.iter().all(|d| seen.insert(container_path(d))));
    }

    #[test]
    fn test_restore_descriptor_without_host_path() {
        let external = restore_external_mounts(&[MountMapping::external("/run/x", "", "tmpfs")], &[]);
        assert_eq!(external[0], "mnt[/run/x]");
        assert_eq!(&external[1..], &["mnt[/proc]:/proc", "mnt[/dev]:/dev", "mnt[/sys]:/sys"]);
    }

    #[test]
    fn test_ext_mount_map_args() {
        let args = build_ext_mount_map_args(&[data_mapping()], &[]);
        assert_eq!(args[0], "auto:/data:/tmp/d1");
        assert!(args.contains(&"auto:/proc:/proc".to_string()));
        assert!(args.contains(&"auto:/sys/fs/cgroup:/sys/fs/cgroup".to_string()));
        assert_eq!(args.len(), 1 + SYSTEM_MOUNTS.len());

        // Already-present system mappings are not repeated.
        let args = build_ext_mount_map_args(&with_system(vec![data_mapping()]), &[]);
        assert_eq!(args.len(), 1 + SYSTEM_MOUNTS.len());
    }

    #[test]
    fn test_ext_mount_map_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cp").join("ext_mount_map");
        create_ext_mount_map_file(&[data_mapping()], &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].starts_with('#'));
        assert!(lines[1].starts_with('#'));
        assert_eq!(lines[2], "/data:/tmp/d1");
        assert!(lines.contains(&"/dev/pts:/dev/pts"));
    }

    #[test]
    fn test_validate_creates_placeholder_and_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("gone").join("d1");
        let present_file = tmp.path().join("hosts");
        std::fs::write(&present_file, "127.0.0.1 localhost\n").unwrap();

        let mappings = vec![
            MountMapping::external("/data", missing.to_str().unwrap(), "bind"),
            MountMapping::external("/etc/hosts", present_file.to_str().unwrap(), "bind"),
        ];
        let span = Span::none();

        assert_eq!(validate_mount_sources(&mappings, &span).unwrap(), 1);
        assert!(missing.is_dir());
        assert!(present_file.is_file());

        assert_eq!(validate_mount_sources(&mappings, &span).unwrap(), 0);
        assert_eq!(std::fs::read_dir(&missing).unwrap().count(), 0);
    }

    #[test]
    fn test_validate_ignores_internal_mappings() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("internal");
        let mut mapping = MountMapping::external("/x", target.to_str().unwrap(), "bind");
        mapping.is_external = false;

        assert_eq!(validate_mount_sources(&[mapping], &Span::none()).unwrap(), 0);
        assert!(!target.exists());
    }

    #[test]
    fn test_ext_mount_map_honors_skip() {
        let mappings = with_system(vec![
            data_mapping(),
            MountMapping::external("/logs", "/var/log/app", "bind"),
        ]);
        let args = build_ext_mount_map_args(&mappings, &["/data/".to_string()]);
        assert!(!args.iter().any(|a| a.starts_with("auto:/data:")));
        assert!(args.contains(&"auto:/logs:/var/log/app".to_string()));
        assert!(args.contains(&"auto:/proc:/proc".to_string()));
    }

    #[test]
    fn test_descriptor_container_path() {
        assert_eq!(descriptor_container_path("mnt[/data]:/tmp/d1"), Some("/data"));
        assert_eq!(descriptor_container_path("mnt[/proc/sys]"), Some("/proc/sys"));
        assert_eq!(descriptor_container_path("auto:/data/:/srv/a:b"), Some("/data"));
        assert_eq!(descriptor_container_path("dev[foo]"), None);
    }

    #[test]
    fn test_merge_drops_paths_already_external() {
        let mappings = with_system(vec![data_mapping()]);
        let external = restore_external_mounts(&mappings, &[]);
        let map = build_ext_mount_map_args(&mappings, &[]);
        let merged = merge_restore_descriptors(&external, &map);

        assert_eq!(&merged[..external.len()], &external[..]);
        assert!(!merged.contains(&"auto:/proc:/proc".to_string()));
        assert!(!merged.contains(&"auto:/data:/tmp/d1".to_string()));

        let mut seen = HashSet::new();
        for descriptor in &merged {
            let path = descriptor_container_path(descriptor).unwrap();
            assert!(seen.insert(path), "duplicate descriptor {}", descriptor);
        }
    }

    #[test]
    fn test_merge_keeps_unnamed_map_entries() {
        let external = vec!["mnt[/data]:/tmp/d1".to_string()];
        let map = vec![
            "auto:/data:/tmp/d1".to_string(),
            "auto:/logs:/var/log/app".to_string(),
        ];
        assert_eq!(
            merge_restore_descriptors(&external, &map),
            vec!["mnt[/data]:/tmp/d1", "auto:/logs:/var/log/app"]
        );
    }

    #[test]
    fn test_kernel_filesystems_never_missing() {
        let mapping = MountMapping::external("/dev/mqueue", "/dev/nonexistent-mqueue", "mqueue");
        assert!(missing_mount_sources(&[mapping]).is_empty());
    }

    #[test]
    fn test_bind_into_dev_gets_placeholder() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("gone");
        let mapping = MountMapping::external("/dev/custom", source.to_str().unwrap(), "bind");

        assert_eq!(missing_mount_sources(std::slice::from_ref(&mapping)).len(), 1);
        assert_eq!(validate_mount_sources(&[mapping], &Span::none()).unwrap(), 1);
        assert!(source.is_dir());
    }

    #[test]
    fn test_validate_reports_creation_failure() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let under_file = blocker.join("child");

        let mapping = MountMapping::external("/data", under_file.to_str().unwrap(), "bind");
        let err = validate_mount_sources(&[mapping], &Span::none()).unwrap_err();
        assert!(matches!(err, CrError::MountSourceCreationFailure { .. }));
    }
}
