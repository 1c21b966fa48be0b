use super::constants::{
    DEDICATED_NAMESPACE, DIR_PERMISSION, FS_TYPE, MOUNT_LOG_FILE, MOUNT_PROGRAM, UMOUNT_PROGRAM,
};
use super::error::{Result, VolumeError};
use super::host::{Host, MountTableOracle};
use super::options::{to_mount_args, MountOptions};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};

/// What the host says about a mount root right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    /// Listed in the mount table and reachable.
    Mounted,
    /// Not listed in the mount table.
    Unmounted,
    /// Listed in the mount table but the root cannot be stat-ed, usually a
    /// dead network connection.
    Stale,
}

/// Mount / unmount capability of one concrete kind of physical mount.
pub trait Mountable {
    /// Brings the mount up. Returns `true` if this call mounted it.
    fn mount(&mut self, host: &Host) -> Result<bool>;
    /// Takes the mount down. Returns `true` if this call unmounted it.
    fn unmount(&mut self, host: &Host) -> Result<bool>;
    /// Whether the mount is currently up and reachable. Never mutates.
    fn is_mounted(&self, host: &Host) -> bool;
}

/// One GlusterFS mount on the host, possibly shared by several volumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalMount {
    /// Registry key, `<servers>/<volume>` or a dedicated variant.
    pub id: String,
    /// Comma separated server list.
    pub servers: String,
    /// Remote volume name.
    pub volume_name: String,
    /// Options passed to the mount command.
    #[serde(default)]
    pub options: MountOptions,
    /// Local mount target.
    pub root_path: PathBuf,
    /// Outstanding mount requests not yet balanced by an unmount.
    #[serde(default)]
    pub ref_count: u32,
    /// Cached belief about the host state, reconciled before every decision.
    #[serde(skip)]
    mounted: bool,
}

// The cached flag is a hint about the host, not part of the mount's identity.
impl PartialEq for PhysicalMount {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.servers == other.servers
            && self.volume_name == other.volume_name
            && self.options == other.options
            && self.root_path == other.root_path
            && self.ref_count == other.ref_count
    }
}

impl Eq for PhysicalMount {}

impl PhysicalMount {
    /// Creates an unmounted entry with no references.
    pub fn new(
        id: String,
        servers: String,
        volume_name: String,
        options: MountOptions,
        root_path: PathBuf,
    ) -> Self {
        Self {
            id,
            servers,
            volume_name,
            options,
            root_path,
            ref_count: 0,
            mounted: false,
        }
    }

    /// `<servers>:/<volume>` as understood by mount.glusterfs.
    pub fn source(&self) -> String {
        format!("{}:/{}", self.servers, self.volume_name)
    }

    /// Arguments for the mount command.
    pub fn mount_args(&self) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            FS_TYPE.to_string(),
            self.source(),
            self.root_path.to_string_lossy().into_owned(),
            "-o".to_string(),
            format!("log-file={}", MOUNT_LOG_FILE),
        ];
        args.extend(to_mount_args(&self.options));
        args
    }

    /// Last known mount state, without asking the host.
    pub fn cached_mounted(&self) -> bool {
        self.mounted
    }

    /// Asks the host for the current state of the mount root.
    ///
    /// A mount table that cannot be read is logged and the cached flag is
    /// used instead.
    pub fn status(&self, oracle: &dyn MountTableOracle) -> MountStatus {
        match oracle.is_mounted(&self.root_path) {
            Ok(true) => match fs::metadata(&self.root_path) {
                Ok(_) => MountStatus::Mounted,
                Err(e) => {
                    debug!("'{}' in mount table but not reachable: {}", self.id, e);
                    MountStatus::Stale
                }
            },
            Ok(false) => MountStatus::Unmounted,
            Err(e) => {
                error!("Failed to read mount table: {}", e);
                if self.mounted {
                    MountStatus::Mounted
                } else {
                    MountStatus::Unmounted
                }
            }
        }
    }

    /// Refreshes the cached flag from the host and returns the status.
    pub fn reconcile(&mut self, oracle: &dyn MountTableOracle) -> MountStatus {
        let status = self.status(oracle);
        let mounted = status != MountStatus::Unmounted;
        if mounted != self.mounted {
            debug!(
                "'{}' cached mount state {} corrected to {:?}",
                self.id, self.mounted, status
            );
        }
        self.mounted = mounted;
        status
    }

    fn run_umount(&mut self, host: &Host) -> Result<()> {
        let target = self.root_path.to_string_lossy().into_owned();
        host.executor.execute(UMOUNT_PROGRAM, &[target])?;
        self.mounted = false;
        info!("Unmounted {} from {}", self.source(), self.root_path.display());
        Ok(())
    }
}

impl Mountable for PhysicalMount {
    fn mount(&mut self, host: &Host) -> Result<bool> {
        match self.reconcile(host.oracle.as_ref()) {
            MountStatus::Mounted => {
                debug!("'{}' already mounted", self.id);
                return Ok(false);
            }
            MountStatus::Stale => {
                warn!("'{}' seems stale, forcing unmount", self.root_path.display());
                self.run_umount(host)?;
            }
            MountStatus::Unmounted => {}
        }

        ensure_dir(&self.root_path)?;

        let args = self.mount_args();
        debug!("{} {:?}", MOUNT_PROGRAM, args);
        host.executor.execute(MOUNT_PROGRAM, &args)?;
        self.mounted = true;

        info!("Mounted {} at {}", self.source(), self.root_path.display());
        Ok(true)
    }

    fn unmount(&mut self, host: &Host) -> Result<bool> {
        if self.reconcile(host.oracle.as_ref()) == MountStatus::Unmounted {
            debug!("'{}' not mounted, so not unmounting", self.id);
            return Ok(false);
        }
        self.run_umount(host)?;
        Ok(true)
    }

    fn is_mounted(&self, host: &Host) -> bool {
        self.status(host.oracle.as_ref()) == MountStatus::Mounted
    }
}

/// Outcome of [`MountRegistry::resolve_or_create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Id of the physical mount to use.
    pub id: String,
    /// Whether the entry was created by this call.
    pub created: bool,
}

/// Owns every physical mount and its reference count.
#[derive(Debug)]
pub struct MountRegistry {
    root: PathBuf,
    host: Host,
    mounts: BTreeMap<String, PhysicalMount>,
}

impl MountRegistry {
    /// Creates an empty registry placing mounts under `root`.
    pub fn new(root: PathBuf, host: Host) -> Self {
        Self {
            root,
            host,
            mounts: BTreeMap::new(),
        }
    }

    /// Rebuilds a registry from persisted entries.
    pub fn from_mounts(
        root: PathBuf,
        host: Host,
        mounts: impl IntoIterator<Item = PhysicalMount>,
    ) -> Self {
        let mounts = mounts.into_iter().map(|pm| (pm.id.clone(), pm)).collect();
        Self { root, host, mounts }
    }

    /// Returns the id of the physical mount serving `(servers, volume_name)`,
    /// creating the entry if needed.
    ///
    /// A non-dedicated request reuses the entry with the same id when its
    /// options are identical. `bound_volumes` lists the logical volumes of an
    /// id and is only called to describe a conflict.
    ///
    /// # Errors
    ///
    /// * [`VolumeError::Config`] if `servers` or `volume_name` is empty or
    ///   not a single path component, or if a shared request uses the
    ///   dedicated namespace as its servers
    /// * [`VolumeError::Conflict`] if the existing entry has other options
    pub fn resolve_or_create<F>(
        &mut self,
        servers: &str,
        volume_name: &str,
        options: &MountOptions,
        dedicated: bool,
        bound_volumes: F,
    ) -> Result<Resolution>
    where
        F: FnOnce(&str) -> Vec<String>,
    {
        if servers.is_empty() {
            return Err(VolumeError::config("'servers' option required"));
        }
        if volume_name.is_empty() {
            return Err(VolumeError::config("'volume-name' option required"));
        }
        check_component("servers", servers)?;
        check_component("volume-name", volume_name)?;
        if !dedicated && servers == DEDICATED_NAMESPACE {
            return Err(VolumeError::config(format!(
                "'{}' is reserved for dedicated mounts",
                DEDICATED_NAMESPACE
            )));
        }

        let id = if dedicated {
            (1u64..)
                .map(|n| format!("{}/{}/{}/{}", DEDICATED_NAMESPACE, servers, volume_name, n))
                .find(|candidate| !self.mounts.contains_key(candidate))
                .ok_or_else(|| VolumeError::config("no free dedicated mount id"))?
        } else {
            format!("{}/{}", servers, volume_name)
        };

        if let Some(existing) = self.mounts.get(&id) {
            if existing.options != *options {
                return Err(VolumeError::Conflict {
                    volumes: bound_volumes(&id),
                    requested: options.clone(),
                    existing: existing.options.clone(),
                    id,
                });
            }
            debug!("Reusing physical mount '{}'", id);
            return Ok(Resolution { id, created: false });
        }

        let root_path = self.root.join(&id);
        debug!("Creating physical mount '{}' at {}", id, root_path.display());
        self.mounts.insert(
            id.clone(),
            PhysicalMount::new(
                id.clone(),
                servers.to_string(),
                volume_name.to_string(),
                options.clone(),
                root_path,
            ),
        );
        Ok(Resolution { id, created: true })
    }

    /// Looks up an entry.
    pub fn get(&self, id: &str) -> Option<&PhysicalMount> {
        self.mounts.get(id)
    }

    /// Whether an entry with this id exists.
    pub fn contains(&self, id: &str) -> bool {
        self.mounts.contains_key(id)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    /// Whether the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// All entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = &PhysicalMount> {
        self.mounts.values()
    }

    /// The host this registry drives.
    pub fn host(&self) -> &Host {
        &self.host
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut PhysicalMount> {
        self.mounts
            .get_mut(id)
            .ok_or_else(|| VolumeError::config(format!("unknown physical mount '{}'", id)))
    }

    /// Mounts the entry unless the host already has it mounted. Returns
    /// `true` if this call mounted it. The reference count is untouched.
    pub fn mount(&mut self, id: &str) -> Result<bool> {
        let host = self.host.clone();
        let pm = self.entry_mut(id)?;
        let referenced = pm.ref_count > 0;
        let mounted_now = pm.mount(&host)?;
        if mounted_now && referenced {
            warn!(
                "'{}' had {} references but was not mounted, remounted it",
                id, pm.ref_count
            );
        }
        Ok(mounted_now)
    }

    /// Unmounts the entry if the host has it mounted. Returns `true` if this
    /// call unmounted it.
    pub fn unmount(&mut self, id: &str) -> Result<bool> {
        let host = self.host.clone();
        self.entry_mut(id)?.unmount(&host)
    }

    /// Current host state of an entry; unknown ids are not mounted.
    pub fn is_mounted(&self, id: &str) -> bool {
        self.mounts
            .get(id)
            .map(|pm| pm.is_mounted(&self.host))
            .unwrap_or(false)
    }

    /// Adds one reference and returns the new count.
    pub fn increment_ref(&mut self, id: &str) -> Result<u32> {
        let pm = self.entry_mut(id)?;
        pm.ref_count = pm.ref_count.saturating_add(1);
        Ok(pm.ref_count)
    }

    /// Drops one reference, never going below zero, and returns the new
    /// count. Reaching zero does not unmount.
    pub fn decrement_ref(&mut self, id: &str) -> Result<u32> {
        let pm = self.entry_mut(id)?;
        pm.ref_count = pm.ref_count.saturating_sub(1);
        Ok(pm.ref_count)
    }

    /// Removes an entry, unmounting it and deleting its empty root.
    ///
    /// Unmount and directory failures are logged; a stale or missing mount
    /// never blocks removal of the entry.
    pub fn delete(&mut self, id: &str) -> Option<PhysicalMount> {
        let mut pm = self.mounts.remove(id)?;

        if let Err(e) = pm.unmount(&self.host) {
            warn!("Failed to unmount '{}' while deleting it: {}", id, e);
        }
        if let Err(e) = remove_dir(&pm.root_path) {
            warn!("Failed to delete mount point of '{}': {}", id, e);
        }

        info!("Deleted physical mount '{}'", id);
        Some(pm)
    }
}

/// Accepts a single plain path component: non-empty, no `/`, not `.` or `..`.
pub(crate) fn check_component(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains('/') {
        return Err(VolumeError::config(format!(
            "'{}' is not a valid {}",
            value, what
        )));
    }
    Ok(())
}

/// Makes sure `path` is a directory, creating it and its parents if absent.
pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(VolumeError::config(format!(
            "{} already exist and it's not a directory",
            path.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => DirBuilder::new()
            .recursive(true)
            .mode(DIR_PERMISSION)
            .create(path)
            .map_err(|e| VolumeError::io("creating directory", path, e)),
        Err(e) => Err(VolumeError::io("inspecting", path, e)),
    }
}

/// Removes `path` if it is an empty directory; a missing path is fine.
pub(crate) fn remove_dir(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir(path).map_err(|e| VolumeError::io("removing directory", path, e))
        }
        Ok(_) => Err(VolumeError::config(format!(
            "{} is not a directory",
            path.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VolumeError::io("inspecting", path, e)),
    }
}
