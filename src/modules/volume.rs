use super::error::{Result, VolumeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A named volume as the container runtime sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalVolume {
    /// User-facing name.
    pub name: String,
    /// Id of the physical mount serving this volume.
    pub mount_id: String,
    /// Path handed to the runtime: the mount root or a subdirectory of it.
    pub path: PathBuf,
}

/// Maps volume names onto physical mounts. Holds ids only; physical mounts
/// are owned by [`MountRegistry`](super::mount::MountRegistry).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeRegistry {
    volumes: BTreeMap<String, LogicalVolume>,
}

impl VolumeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a registry from persisted entries.
    pub fn from_volumes(volumes: impl IntoIterator<Item = LogicalVolume>) -> Self {
        Self {
            volumes: volumes
                .into_iter()
                .map(|v| (v.name.clone(), v))
                .collect(),
        }
    }

    /// Inserts or replaces the entry for `name`, returning the replaced one.
    pub fn create(
        &mut self,
        name: &str,
        mount_id: &str,
        path: PathBuf,
    ) -> Option<LogicalVolume> {
        self.volumes.insert(
            name.to_string(),
            LogicalVolume {
                name: name.to_string(),
                mount_id: mount_id.to_string(),
                path,
            },
        )
    }

    /// Looks up a volume.
    pub fn get(&self, name: &str) -> Result<&LogicalVolume> {
        self.volumes
            .get(name)
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))
    }

    /// All volumes in name order.
    pub fn list(&self) -> Vec<&LogicalVolume> {
        self.volumes.values().collect()
    }

    /// Removes a volume and returns it.
    pub fn delete(&mut self, name: &str) -> Result<LogicalVolume> {
        self.volumes
            .remove(name)
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))
    }

    /// Whether any volume is served by `mount_id`.
    pub fn references(&self, mount_id: &str) -> bool {
        self.volumes.values().any(|v| v.mount_id == mount_id)
    }

    /// Names of the volumes served by `mount_id`.
    pub fn bound_to(&self, mount_id: &str) -> Vec<String> {
        self.volumes
            .values()
            .filter(|v| v.mount_id == mount_id)
            .map(|v| v.name.clone())
            .collect()
    }

    /// Number of volumes.
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    /// Whether there are no volumes.
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }
}
