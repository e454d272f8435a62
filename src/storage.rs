//! On-disk checkpoint artifacts.
//!
//! ```text
//! <output>/<container>/<checkpoint>/
//!   images/  container_metadata.json  mount_mappings.json
//!   checkpoint_metadata.json  ext_mount_map  dump.log | restore.log
//! ```

use crate::config::images_dir;
use crate::error::{CrError, Result};
use crate::mounts::create_ext_mount_map_file;
use crate::types::{CheckpointArtifact, CheckpointSummary, ContainerState, MountMapping};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONTAINER_METADATA: &str = "container_metadata.json";
pub const MOUNT_MAPPINGS: &str = "mount_mappings.json";
pub const CHECKPOINT_METADATA: &str = "checkpoint_metadata.json";
pub const EXT_MOUNT_MAP: &str = "ext_mount_map";

/// Every file a restore needs; `images/` is checked separately.
pub const REQUIRED_FILES: [&str; 3] = [CONTAINER_METADATA, MOUNT_MAPPINGS, CHECKPOINT_METADATA];

pub struct CheckpointDir {
    path: PathBuf,
}

impl CheckpointDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn images_dir(&self) -> PathBuf {
        images_dir(&self.path)
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Create the directory and its `images/` subdirectory. Existing content is kept.
    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(self.images_dir())?;
        Ok(())
    }

    // ── Metadata ───────────────────────────────────────────────

    pub fn save_container_state(&self, state: &ContainerState) -> Result<()> {
        self.save_json(CONTAINER_METADATA, state)
    }

    pub fn load_container_state(&self) -> Result<ContainerState> {
        self.load_json(CONTAINER_METADATA)
    }

    pub fn save_mount_mappings(&self, mappings: &[MountMapping]) -> Result<()> {
        self.save_json(MOUNT_MAPPINGS, &mappings)
    }

    pub fn load_mount_mappings(&self) -> Result<Vec<MountMapping>> {
        self.load_json(MOUNT_MAPPINGS)
    }

    pub fn save_artifact(&self, artifact: &CheckpointArtifact) -> Result<()> {
        self.save_json(CHECKPOINT_METADATA, artifact)
    }

    pub fn load_artifact(&self) -> Result<CheckpointArtifact> {
        self.load_json(CHECKPOINT_METADATA)
    }

    pub fn write_ext_mount_map(&self, mappings: &[MountMapping]) -> Result<()> {
        create_ext_mount_map_file(mappings, &self.file(EXT_MOUNT_MAP))
    }

    fn save_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.path)?;
        let json = serde_json::to_string_pretty(value)?;
        fs::write(self.file(name), json)?;
        Ok(())
    }

    fn load_json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let data = fs::read_to_string(self.file(name))?;
        Ok(serde_json::from_str(&data)?)
    }

    // ── Validation ─────────────────────────────────────────────

    /// A checkpoint is complete when all metadata files exist and `images/`
    /// holds at least one file.
    pub fn validate(&self) -> Result<()> {
        if !self.path.is_dir() {
            return Err(CrError::CheckpointIncomplete(format!(
                "checkpoint directory {} does not exist",
                self.path.display()
            )));
        }

        let missing: Vec<&str> = REQUIRED_FILES
            .iter()
            .copied()
            .filter(|name| !self.file(name).is_file())
            .collect();
        if !missing.is_empty() {
            return Err(CrError::CheckpointIncomplete(format!(
                "{} is missing {}",
                self.path.display(),
                missing.join(", ")
            )));
        }

        if self.image_files()?.is_empty() {
            return Err(CrError::CheckpointIncomplete(format!(
                "{} has no engine image files",
                self.images_dir().display()
            )));
        }
        Ok(())
    }

    /// Sorted names of the files under `images/`. Missing directory → empty.
    pub fn image_files(&self) -> Result<Vec<String>> {
        let dir = self.images_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Enumerate complete checkpoints under `<output>/<container>/<name>`.
/// Incomplete directories are skipped.
pub fn list_checkpoints(output_dir: &Path) -> Result<Vec<CheckpointSummary>> {
    if !output_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut summaries = Vec::new();
    for container in sorted_dirs(output_dir)? {
        for checkpoint in sorted_dirs(&container)? {
            let dir = CheckpointDir::new(&checkpoint);
            if dir.validate().is_err() {
                continue;
            }
            let artifact = match dir.load_artifact() {
                Ok(artifact) => artifact,
                Err(e) => {
                    tracing::warn!(
                        path = %checkpoint.display(),
                        error = %e,
                        "Skipping unreadable checkpoint"
                    );
                    continue;
                }
            };
            let name = checkpoint
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            summaries.push(CheckpointSummary::from_artifact(
                &artifact,
                &name,
                dir.image_files()?.len(),
            ));
        }
    }
    Ok(summaries)
}

fn sorted_dirs(parent: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(parent)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}
