//! Persisted driver state.
//!
//! The whole driver state is written as one JSON document after every
//! mutation. The document carries an explicit `version`:
//!
//! - version 2 is the current layout, see [`Snapshot`]
//! - documents without a `version` field (or with version 1) use the legacy
//!   `DockerVolumes`/`GlusterVolumes` layout and are migrated on load, with
//!   every reference count starting at zero
//!
//! Newer versions are refused rather than guessed at.

use super::constants::SNAPSHOT_VERSION;
use super::mount::PhysicalMount;
use super::options::MountOptions;
use super::volume::LogicalVolume;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading or saving state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the state file failed.
    #[error("state file '{path}': {source}")]
    Io {
        /// State file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The document is not valid JSON or does not match its schema.
    #[error("invalid state document: {0}")]
    Json(#[from] serde_json::Error),

    /// The document was written by a newer, unknown schema.
    #[error("unsupported state version {0}, newest known is {latest}", latest = SNAPSHOT_VERSION)]
    UnsupportedVersion(u64),

    /// The document is JSON but structurally unusable.
    #[error("malformed state document: {0}")]
    Malformed(String),
}

/// Full driver state as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Schema version, always [`SNAPSHOT_VERSION`] once loaded.
    pub version: u32,
    /// Logical volumes by name.
    #[serde(default)]
    pub volumes: BTreeMap<String, LogicalVolume>,
    /// Physical mounts by id.
    #[serde(default)]
    pub mounts: BTreeMap<String, PhysicalMount>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            volumes: BTreeMap::new(),
            mounts: BTreeMap::new(),
        }
    }
}

impl Snapshot {
    /// Builds a current-version snapshot from registry entries.
    pub fn from_parts(
        volumes: impl IntoIterator<Item = LogicalVolume>,
        mounts: impl IntoIterator<Item = PhysicalMount>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            volumes: volumes.into_iter().map(|v| (v.name.clone(), v)).collect(),
            mounts: mounts.into_iter().map(|m| (m.id.clone(), m)).collect(),
        }
    }

    /// Serialises the snapshot.
    pub fn to_json(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parses a document of any known version, migrating it forward.
    pub fn from_json(bytes: &[u8]) -> Result<Self, StoreError> {
        let document: Value = serde_json::from_slice(bytes)?;
        if !document.is_object() {
            return Err(StoreError::Malformed("expected a JSON object".into()));
        }

        let version = match document.get("version") {
            None => 1,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| StoreError::Malformed(format!("invalid version {}", v)))?,
        };

        match version {
            1 => {
                let legacy: LegacyState = serde_json::from_value(document)?;
                debug!("Migrating legacy state document");
                Ok(legacy.migrate())
            }
            v if v == u64::from(SNAPSHOT_VERSION) => {
                let snapshot: Snapshot = serde_json::from_value(document)?;
                snapshot.check_keys()?;
                Ok(snapshot)
            }
            other => Err(StoreError::UnsupportedVersion(other)),
        }
    }

    fn check_keys(&self) -> Result<(), StoreError> {
        if let Some((key, v)) = self.volumes.iter().find(|(key, v)| **key != v.name) {
            return Err(StoreError::Malformed(format!(
                "volume key '{}' does not match name '{}'",
                key, v.name
            )));
        }
        if let Some((key, m)) = self.mounts.iter().find(|(key, m)| **key != m.id) {
            return Err(StoreError::Malformed(format!(
                "mount key '{}' does not match id '{}'",
                key, m.id
            )));
        }
        Ok(())
    }

    /// Drops volumes pointing at unknown mounts and mounts no volume uses.
    /// Returns how many entries of each kind were dropped.
    pub fn prune(&mut self) -> (usize, usize) {
        let mounts = &self.mounts;
        let before = self.volumes.len();
        self.volumes.retain(|name, v| {
            let known = mounts.contains_key(&v.mount_id);
            if !known {
                warn!(
                    "Dropping volume '{}': physical mount '{}' is not in the state",
                    name, v.mount_id
                );
            }
            known
        });
        let dropped_volumes = before - self.volumes.len();

        let volumes = &self.volumes;
        let before = self.mounts.len();
        self.mounts.retain(|id, _| {
            let used = volumes.values().any(|v| v.mount_id == *id);
            if !used {
                warn!("Dropping physical mount '{}': no volume uses it", id);
            }
            used
        });

        (dropped_volumes, before - self.mounts.len())
    }
}

#[derive(Debug, Deserialize)]
struct LegacyState {
    #[serde(rename = "DockerVolumes", default)]
    docker_volumes: Option<BTreeMap<String, LegacyVolume>>,
    #[serde(rename = "GlusterVolumes", default)]
    gluster_volumes: Option<BTreeMap<String, LegacyMount>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LegacyVolume {
    gluster_volume_id: String,
    mountpoint: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LegacyMount {
    servers: String,
    volume_name: String,
    #[serde(default)]
    options: Option<MountOptions>,
    mountpoint: PathBuf,
}

impl LegacyState {
    fn migrate(self) -> Snapshot {
        let volumes = self
            .docker_volumes
            .unwrap_or_default()
            .into_iter()
            .map(|(name, v)| LogicalVolume {
                name,
                mount_id: v.gluster_volume_id,
                path: v.mountpoint,
            });
        let mounts = self
            .gluster_volumes
            .unwrap_or_default()
            .into_iter()
            .map(|(id, m)| {
                PhysicalMount::new(
                    id,
                    m.servers,
                    m.volume_name,
                    m.options.unwrap_or_default(),
                    m.mountpoint,
                )
            });
        Snapshot::from_parts(volumes, mounts)
    }
}

/// Durable home of the driver snapshot.
pub trait StateStore: Send + Sync {
    /// Loads the last saved snapshot, or `None` if nothing was saved yet.
    fn load(&self) -> Result<Option<Snapshot>, StoreError>;
    /// Replaces the saved snapshot.
    fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError>;
}

/// [`StateStore`] keeping the snapshot in one JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store backed by the file at `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Location of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        debug!("Loading state from '{}'", self.path.display());
        match fs::read(&self.path) {
            Ok(bytes) => Snapshot::from_json(&bytes).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No state found at '{}'", self.path.display());
                Ok(None)
            }
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        debug!(
            "Saving {} volumes and {} mounts to '{}'",
            snapshot.volumes.len(),
            snapshot.mounts.len(),
            self.path.display()
        );
        let data = snapshot.to_json()?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        // Write a sibling file first so a crash never leaves half a document.
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, data).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }
}
