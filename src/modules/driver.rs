//! The volume driver.
//!
//! [`VolumeDriver`] implements the operation set a container runtime calls
//! on a volume plugin. Every operation takes one driver-wide lock for its
//! whole duration, mount commands included, and persists a full snapshot
//! before releasing it.
//!
//! Physical mounts follow a small state machine: they are mounted on the
//! first `mount` of any volume they serve, unmounted when `unmount` drops the
//! reference count to zero, and deleted once no volume refers to them.

use super::config::DriverConfig;
use super::error::{Result, VolumeError};
use super::host::Host;
use super::mount::{check_component, ensure_dir, MountRegistry};
use super::options::{check_option, MountOptions, DEDICATED_MOUNT, SERVERS, VOLUME_NAME};
use super::state::{Snapshot, StateStore, StoreError};
use super::volume::VolumeRegistry;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A volume as reported to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeInfo {
    /// Volume name.
    pub name: String,
    /// Path the runtime bind-mounts into containers.
    pub mountpoint: PathBuf,
}

/// Visibility of the volumes this driver manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Volumes exist on this host only.
    Local,
}

/// Capabilities reported to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Volume scope.
    pub scope: Scope,
}

/// A create request after driver configuration has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CreateRequest {
    servers: String,
    volume_name: String,
    subdir: Option<String>,
    dedicated: bool,
    options: MountOptions,
}

struct DriverState {
    volumes: VolumeRegistry,
    mounts: MountRegistry,
}

impl DriverState {
    fn snapshot(&self) -> Snapshot {
        Snapshot::from_parts(
            self.volumes.list().into_iter().cloned(),
            self.mounts.iter().cloned(),
        )
    }

    // Deletes the physical mount once no volume refers to it.
    fn collect(&mut self, mount_id: &str) {
        if !self.volumes.references(mount_id) {
            self.mounts.delete(mount_id);
        }
    }

    fn root_path(&self, mount_id: &str) -> Result<PathBuf> {
        self.mounts
            .get(mount_id)
            .map(|pm| pm.root_path.clone())
            .ok_or_else(|| VolumeError::config(format!("unknown physical mount '{}'", mount_id)))
    }
}

/// Maps named volumes onto shared GlusterFS mounts.
pub struct VolumeDriver {
    config: DriverConfig,
    store: Box<dyn StateStore>,
    state: Mutex<DriverState>,
}

impl VolumeDriver {
    /// Creates a driver with empty state.
    ///
    /// Call [`load_state`](Self::load_state) to pick up a previous snapshot.
    pub fn new(config: DriverConfig, host: Host, store: Box<dyn StateStore>) -> Self {
        debug!("New driver {:?}", config);
        let mounts = MountRegistry::new(config.root.clone(), host);
        Self {
            config,
            store,
            state: Mutex::new(DriverState {
                volumes: VolumeRegistry::new(),
                mounts,
            }),
        }
    }

    /// The configuration this driver was built with.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Replaces the in-memory state with the stored snapshot, if any.
    ///
    /// Entries breaking the volume/mount references are dropped. Mount
    /// state is not trusted from the snapshot; it is checked against the
    /// host on first use.
    pub fn load_state(&self) -> std::result::Result<(), StoreError> {
        let Some(mut snapshot) = self.store.load()? else {
            return Ok(());
        };

        let (dropped_volumes, dropped_mounts) = snapshot.prune();
        if dropped_volumes + dropped_mounts > 0 {
            warn!(
                "Dropped {} volumes and {} mounts with broken references",
                dropped_volumes, dropped_mounts
            );
        }

        let mut state = self.state.lock();
        let host = state.mounts.host().clone();
        state.volumes = VolumeRegistry::from_volumes(snapshot.volumes.into_values());
        state.mounts =
            MountRegistry::from_mounts(self.config.root.clone(), host, snapshot.mounts.into_values());

        info!(
            "Loaded {} volumes on {} mounts",
            state.volumes.len(),
            state.mounts.len()
        );
        Ok(())
    }

    /// Current state, as it would be persisted.
    pub fn snapshot(&self) -> Snapshot {
        self.state.lock().snapshot()
    }

    fn persist(&self, state: &DriverState) {
        if let Err(e) = self.store.save(&state.snapshot()) {
            error!("Failed to save state: {}", e);
        }
    }

    /// Applies driver configuration to the options of a create request.
    fn resolve_request(&self, name: &str, mut options: BTreeMap<String, String>) -> Result<CreateRequest> {
        check_component("volume name", name)?;

        let servers = match &self.config.servers {
            Some(fixed) => {
                if options.contains_key(SERVERS) {
                    return Err(VolumeError::config(
                        "'servers' option already set by driver, can not override.",
                    ));
                }
                fixed.clone()
            }
            None => options.remove(SERVERS).unwrap_or_default(),
        };
        if servers.is_empty() {
            return Err(VolumeError::config("'servers' option required"));
        }

        let volume_name = match &self.config.volume_name {
            Some(fixed) => {
                if options.contains_key(VOLUME_NAME) {
                    return Err(VolumeError::config(
                        "'volume-name' option already set by driver, can not override.",
                    ));
                }
                Some(fixed.clone())
            }
            None => options.remove(VOLUME_NAME).filter(|v| !v.is_empty()),
        };

        // A fixed remote volume is shared; each name becomes a subdirectory.
        let (volume_name, subdir) = match volume_name {
            Some(volume_name) => (volume_name, Some(name.to_string())),
            None => (name.to_string(), None),
        };

        let dedicated = options.remove(DEDICATED_MOUNT).is_some() || self.config.dedicated_mounts;

        let mut mount_options = self.config.options.clone();
        for (key, value) in options {
            check_option(&key, &value)?;
            if !self.config.options.is_empty() {
                return Err(VolumeError::config(
                    "Options already set by driver, can not override.",
                ));
            }
            mount_options.insert(key, value);
        }

        Ok(CreateRequest {
            servers,
            volume_name,
            subdir,
            dedicated,
            options: mount_options,
        })
    }

    /// Registers a volume, mounting its physical mount.
    ///
    /// A name that already exists is overwritten.
    ///
    /// # Errors
    ///
    /// * [`VolumeError::Config`] for disallowed or overriding options
    /// * [`VolumeError::Conflict`] if a shared mount exists with other options
    /// * [`VolumeError::Io`] / [`VolumeError::Command`] if mounting fails
    pub fn create(&self, name: &str, options: BTreeMap<String, String>) -> Result<()> {
        debug!("create {} {:?}", name, options);
        let request = self.resolve_request(name, options)?;

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let volumes = &state.volumes;
        let id = state
            .mounts
            .resolve_or_create(
                &request.servers,
                &request.volume_name,
                &request.options,
                request.dedicated,
                |id| volumes.bound_to(id),
            )?
            .id;

        let mounted_now = match state.mounts.mount(&id) {
            Ok(mounted_now) => mounted_now,
            Err(e) => {
                state.collect(&id);
                return Err(e);
            }
        };
        let path = match Self::volume_path(state, &id, request.subdir.as_deref()) {
            Ok(path) => path,
            Err(e) => {
                let idle = state.mounts.get(&id).map_or(false, |pm| pm.ref_count == 0);
                if mounted_now && idle {
                    if let Err(undo) = state.mounts.unmount(&id) {
                        warn!("Failed to unmount '{}' after error: {}", id, undo);
                    }
                }
                state.collect(&id);
                return Err(e);
            }
        };

        if let Some(previous) = state.volumes.create(name, &id, path) {
            if previous.mount_id != id {
                debug!("'{}' moved from '{}' to '{}'", name, previous.mount_id, id);
                state.collect(&previous.mount_id);
            }
        }

        self.persist(state);
        Ok(())
    }

    // Path of a volume on the mounted `id`, creating its subdirectory.
    fn volume_path(state: &DriverState, id: &str, subdir: Option<&str>) -> Result<PathBuf> {
        let root = state.root_path(id)?;
        match subdir {
            Some(subdir) => {
                let path = root.join(subdir);
                ensure_dir(&path)?;
                Ok(path)
            }
            None => Ok(root),
        }
    }

    /// Looks up a volume.
    pub fn get(&self, name: &str) -> Result<VolumeInfo> {
        debug!("get {}", name);
        let state = self.state.lock();
        let volume = state.volumes.get(name)?;
        Ok(VolumeInfo {
            name: volume.name.clone(),
            mountpoint: volume.path.clone(),
        })
    }

    /// All volumes, in name order.
    pub fn list(&self) -> Vec<VolumeInfo> {
        debug!("list");
        let state = self.state.lock();
        state
            .volumes
            .list()
            .into_iter()
            .map(|v| VolumeInfo {
                name: v.name.clone(),
                mountpoint: v.path.clone(),
            })
            .collect()
    }

    /// Path of a volume.
    pub fn path(&self, name: &str) -> Result<PathBuf> {
        debug!("path {}", name);
        Ok(self.state.lock().volumes.get(name)?.path.clone())
    }

    /// Makes a volume available and takes one reference on its mount.
    ///
    /// Every call counts: a volume mounted twice must be unmounted twice.
    pub fn mount(&self, name: &str) -> Result<PathBuf> {
        debug!("mount {}", name);
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let volume = state.volumes.get(name)?.clone();
        let id = volume.mount_id.as_str();
        let root = state.root_path(id)?;
        let was_idle = state.mounts.get(id).map_or(true, |pm| pm.ref_count == 0);

        let mounted_now = state.mounts.mount(id)?;

        if volume.path != root {
            if let Err(e) = ensure_dir(&volume.path) {
                if mounted_now && was_idle {
                    if let Err(undo) = state.mounts.unmount(id) {
                        warn!("Failed to unmount '{}' after error: {}", id, undo);
                    }
                }
                return Err(e);
            }
        }

        let count = state.mounts.increment_ref(id)?;
        debug!("'{}' now has {} references", id, count);

        self.persist(state);
        Ok(volume.path)
    }

    /// Releases one reference taken by [`mount`](Self::mount), unmounting
    /// the physical mount when none remain. Releasing an unreferenced mount
    /// does nothing.
    pub fn unmount(&self, name: &str) -> Result<()> {
        debug!("unmount {}", name);
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let id = state.volumes.get(name)?.mount_id.clone();
        let referenced = state.mounts.get(&id).map_or(false, |pm| pm.ref_count > 0);
        if !referenced {
            debug!("'{}' has no outstanding mounts", id);
            return Ok(());
        }

        let remaining = state.mounts.decrement_ref(&id)?;
        debug!("'{}' now has {} references", id, remaining);
        if remaining == 0 {
            if let Err(e) = state.mounts.unmount(&id) {
                state.mounts.increment_ref(&id)?;
                return Err(e);
            }
        }

        self.persist(state);
        Ok(())
    }

    /// Forgets a volume, deleting its physical mount if nothing else uses it.
    pub fn remove(&self, name: &str) -> Result<()> {
        debug!("remove {}", name);
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let volume = state.volumes.delete(name)?;
        state.collect(&volume.mount_id);

        self.persist(state);
        Ok(())
    }

    /// Capabilities of this driver.
    pub fn capabilities(&self) -> Capabilities {
        debug!("capabilities");
        Capabilities {
            scope: Scope::Local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::host::fakes::FakeHost;
    use crate::modules::state::JsonFileStore;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Setup {
        root: TempDir,
        fake: Arc<FakeHost>,
        driver: VolumeDriver,
    }

    impl Setup {
        fn state_path(&self) -> PathBuf {
            self.root.path().join("state.json")
        }

        fn reopen(&self) -> anyhow::Result<VolumeDriver> {
            let driver = VolumeDriver::new(
                self.driver.config().clone(),
                self.fake.host(),
                Box::new(JsonFileStore::new(self.state_path())),
            );
            driver.load_state()?;
            Ok(driver)
        }

        fn ref_count(&self, id: &str) -> Option<u32> {
            self.driver.snapshot().mounts.get(id).map(|pm| pm.ref_count)
        }
    }

    fn setup(configure: impl FnOnce(DriverConfig) -> DriverConfig) -> Setup {
        let root = tempfile::tempdir().unwrap();
        let config = configure(
            DriverConfig::new(root.path().to_path_buf())
                .with_state_path(root.path().join("state.json")),
        );
        let fake = FakeHost::new();
        let driver = VolumeDriver::new(
            config.clone(),
            fake.host(),
            Box::new(JsonFileStore::new(config.state_path.clone())),
        );
        Setup { root, fake, driver }
    }

    fn opts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_exclusive_volume_uses_mount_root() -> anyhow::Result<()> {
        let s = setup(|c| c.with_servers("s1,s2"));
        s.driver.create("vol1", opts(&[]))?;

        let snapshot = s.driver.snapshot();
        assert_eq!(snapshot.volumes["vol1"].mount_id, "s1,s2/vol1");
        let root = s.root.path().join("s1,s2/vol1");
        assert_eq!(s.driver.path("vol1")?, root);
        assert_eq!(snapshot.mounts["s1,s2/vol1"].root_path, root);

        let (program, args) = &s.fake.calls()[0];
        assert_eq!(program, "mount");
        assert_eq!(args[2], "s1,s2:/vol1");
        Ok(())
    }

    #[test]
    fn test_shared_volume_lifecycle() -> anyhow::Result<()> {
        let s = setup(|c| c.with_servers("s1,s2").with_volume_name("shared"));
        let root = s.root.path().join("s1,s2/shared");

        s.driver.create("a", opts(&[]))?;
        s.driver.create("b", opts(&[]))?;
        let snapshot = s.driver.snapshot();
        assert_eq!(snapshot.mounts.len(), 1);
        assert_eq!(snapshot.volumes["a"].mount_id, "s1,s2/shared");
        assert_eq!(snapshot.volumes["b"].mount_id, "s1,s2/shared");
        assert_eq!(s.driver.path("a")?, root.join("a"));
        assert_eq!(s.driver.path("b")?, root.join("b"));
        assert!(root.join("a").is_dir());

        assert_eq!(s.driver.mount("a")?, root.join("a"));
        assert_eq!(s.driver.mount("b")?, root.join("b"));
        assert_eq!(s.ref_count("s1,s2/shared"), Some(2));
        assert_eq!(s.fake.count("mount"), 1);

        s.driver.remove("a")?;
        assert!(s.fake.mounted(&root));
        assert!(s.driver.get("a").unwrap_err().is_not_found());

        s.driver.remove("b")?;
        assert!(!s.fake.mounted(&root));
        assert!(s.driver.snapshot().mounts.is_empty());
        assert!(s.driver.list().is_empty());
        Ok(())
    }

    #[test]
    fn test_refuses_server_override() {
        let s = setup(|c| c.with_servers("s1,s2"));
        let err = s
            .driver
            .create("x", opts(&[("servers", "override")]))
            .unwrap_err();

        assert!(err.is_config());
        assert_eq!(s.driver.snapshot(), Snapshot::default());
        assert!(s.fake.calls().is_empty());
        assert!(!s.state_path().exists());
    }

    #[test]
    fn test_refuses_volume_name_override() {
        let s = setup(|c| c.with_servers("s1").with_volume_name("myvol"));
        let err = s
            .driver
            .create("x", opts(&[("volume-name", "other")]))
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_requires_servers() {
        let s = setup(|c| c);
        assert!(s.driver.create("x", opts(&[])).unwrap_err().is_config());
    }

    #[test]
    fn test_servers_from_request() -> anyhow::Result<()> {
        let s = setup(|c| c);
        s.driver.create("x", opts(&[("servers", "s9")]))?;
        assert_eq!(s.driver.snapshot().volumes["x"].mount_id, "s9/x");
        Ok(())
    }

    #[test]
    fn test_unsupported_options() {
        let s = setup(|c| c.with_servers("s1"));
        for option in ["backup-volfile-server", "backup-volfile-servers", "log-file"] {
            let err = s
                .driver
                .create("test", opts(&[(option, "whatever")]))
                .unwrap_err();
            assert!(err.is_config(), "'{}' should be refused", option);
        }
        assert!(s.driver.list().is_empty());
    }

    #[test]
    fn test_invalid_volume_names() {
        let s = setup(|c| c.with_servers("s1").with_volume_name("shared"));
        for name in ["", "..", "a/b", "/abs"] {
            assert!(s.driver.create(name, opts(&[])).unwrap_err().is_config());
        }
    }

    #[test]
    fn test_driver_options_cannot_be_extended() -> anyhow::Result<()> {
        let s = setup(|c| c.with_servers("s1").with_option_string("ro").unwrap());
        let err = s
            .driver
            .create("x", opts(&[("log-level", "DEBUG")]))
            .unwrap_err();
        assert!(err.is_config());

        s.driver.create("y", opts(&[]))?;
        let mount = &s.driver.snapshot().mounts["s1/y"];
        assert_eq!(mount.options, opts(&[("ro", "")]));
        Ok(())
    }

    #[test]
    fn test_shared_by_request_volume_name() -> anyhow::Result<()> {
        let s = setup(|c| c.with_servers("s1"));
        s.driver.create("v1", opts(&[("volume-name", "gv")]))?;
        s.driver.create("v2", opts(&[("volume-name", "gv")]))?;

        let snapshot = s.driver.snapshot();
        assert_eq!(snapshot.mounts.len(), 1);
        assert_eq!(snapshot.volumes["v1"].path, s.root.path().join("s1/gv/v1"));
        assert_eq!(snapshot.volumes["v2"].path, s.root.path().join("s1/gv/v2"));
        Ok(())
    }

    #[test]
    fn test_conflicting_options_name_existing_volumes() -> anyhow::Result<()> {
        let s = setup(|c| c.with_servers("s1").with_volume_name("shared"));
        s.driver.create("a", opts(&[]))?;

        let err = s.driver.create("b", opts(&[("ro", "")])).unwrap_err();
        match err {
            VolumeError::Conflict { volumes, .. } => assert_eq!(volumes, ["a"]),
            other => panic!("expected conflict, got {:?}", other),
        }
        assert!(s.driver.get("b").unwrap_err().is_not_found());

        s.driver.create("b", opts(&[("ro", ""), ("dedicated-mount", "")]))?;
        let snapshot = s.driver.snapshot();
        assert_eq!(snapshot.volumes["b"].mount_id, "_dedicated/s1/shared/1");
        assert_eq!(snapshot.mounts["_dedicated/s1/shared/1"].options, opts(&[("ro", "")]));
        assert_eq!(snapshot.mounts.len(), 2);
        Ok(())
    }

    #[test]
    fn test_dedicated_default() -> anyhow::Result<()> {
        let s = setup(|c| {
            c.with_servers("s1")
                .with_volume_name("shared")
                .with_option_string("dedicated-mount")
                .unwrap()
        });
        s.driver.create("a", opts(&[]))?;
        s.driver.create("b", opts(&[]))?;

        let snapshot = s.driver.snapshot();
        assert_eq!(snapshot.volumes["a"].mount_id, "_dedicated/s1/shared/1");
        assert_eq!(snapshot.volumes["b"].mount_id, "_dedicated/s1/shared/2");
        assert_eq!(s.fake.count("mount"), 2);
        Ok(())
    }

    #[test]
    fn test_create_mount_failure_leaves_nothing() {
        let s = setup(|c| c.with_servers("s1"));
        s.fake.fail("mount");

        let err = s.driver.create("x", opts(&[])).unwrap_err();
        assert!(err.is_io());
        assert_eq!(s.driver.snapshot(), Snapshot::default());
    }

    #[test]
    fn test_create_subdir_failure_rolls_back() -> anyhow::Result<()> {
        let s = setup(|c| c.with_servers("s1").with_volume_name("shared"));
        let root = s.root.path().join("s1/shared");
        fs::create_dir_all(&root)?;
        fs::write(root.join("x"), "not a directory")?;

        let err = s.driver.create("x", opts(&[])).unwrap_err();
        assert!(err.is_config());
        assert_eq!(s.driver.snapshot(), Snapshot::default());
        assert!(!s.fake.mounted(&root));
        assert_eq!(s.fake.count("umount"), 1);
        Ok(())
    }

    #[test]
    fn test_create_subdir_failure_on_dormant_shared_mount() -> anyhow::Result<()> {
        let s = setup(|c| c.with_servers("s1").with_volume_name("shared"));
        let root = s.root.path().join("s1/shared");
        s.driver.create("a", opts(&[]))?;
        s.driver.mount("a")?;
        s.driver.unmount("a")?;
        assert!(!s.fake.mounted(&root));
        fs::write(root.join("b"), "not a directory")?;

        let err = s.driver.create("b", opts(&[])).unwrap_err();
        assert!(err.is_config());
        assert!(!s.fake.mounted(&root));
        assert_eq!(s.ref_count("s1/shared"), Some(0));
        assert!(s.driver.get("b").unwrap_err().is_not_found());
        assert_eq!(s.driver.path("a")?, root.join("a"));
        Ok(())
    }

    #[test]
    fn test_create_subdir_failure_keeps_held_mount() -> anyhow::Result<()> {
        let s = setup(|c| c.with_servers("s1").with_volume_name("shared"));
        let root = s.root.path().join("s1/shared");
        s.driver.create("a", opts(&[]))?;
        s.driver.mount("a")?;
        fs::write(root.join("b"), "not a directory")?;

        assert!(s.driver.create("b", opts(&[])).unwrap_err().is_config());
        assert!(s.fake.mounted(&root));
        assert_eq!(s.ref_count("s1/shared"), Some(1));
        assert_eq!(s.fake.count("umount"), 0);
        Ok(())
    }

    #[test]
    fn test_create_rejects_dedicated_namespace_servers() {
        let s = setup(|c| c.with_servers("_dedicated").with_volume_name("s1"));
        assert!(s.driver.create("a", opts(&[])).unwrap_err().is_config());
        assert!(s.driver.list().is_empty());
        assert!(s.fake.calls().is_empty());
    }

    #[test]
    fn test_create_rejects_nested_volume_name() -> anyhow::Result<()> {
        let s = setup(|c| c.with_servers("s1"));
        s.driver.create("a", opts(&[("volume-name", "shared")]))?;

        let err = s
            .driver
            .create("other", opts(&[("volume-name", "shared/a")]))
            .unwrap_err();
        assert!(err.is_config());
        assert_eq!(s.driver.snapshot().mounts.len(), 1);
        Ok(())
    }

    #[test]
    fn test_create_overwrite_collects_previous_mount() -> anyhow::Result<()> {
        let s = setup(|c| c);
        s.driver.create("x", opts(&[("servers", "s1")]))?;
        s.driver.create("x", opts(&[("servers", "s2")]))?;

        let snapshot = s.driver.snapshot();
        assert_eq!(snapshot.volumes.len(), 1);
        assert_eq!(snapshot.volumes["x"].mount_id, "s2/x");
        assert!(!snapshot.mounts.contains_key("s1/x"));
        assert!(!s.fake.mounted(&s.root.path().join("s1/x")));
        Ok(())
    }

    #[test]
    fn test_unknown_volume() {
        let s = setup(|c| c.with_servers("s1"));
        assert!(s.driver.get("nope").unwrap_err().is_not_found());
        assert!(s.driver.path("nope").unwrap_err().is_not_found());
        assert!(s.driver.mount("nope").unwrap_err().is_not_found());
        assert!(s.driver.unmount("nope").unwrap_err().is_not_found());
        assert!(s.driver.remove("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_repeated_mounts_are_counted() -> anyhow::Result<()> {
        let s = setup(|c| c.with_servers("s1"));
        let root = s.root.path().join("s1/x");
        s.driver.create("x", opts(&[]))?;

        s.driver.mount("x")?;
        s.driver.mount("x")?;
        assert_eq!(s.ref_count("s1/x"), Some(2));

        s.driver.unmount("x")?;
        assert!(s.fake.mounted(&root));
        s.driver.unmount("x")?;
        assert!(!s.fake.mounted(&root));
        assert_eq!(s.ref_count("s1/x"), Some(0));

        // Dormant but still registered.
        assert_eq!(s.driver.get("x")?.mountpoint, root);
        s.fake.clear_calls();
        s.driver.unmount("x")?;
        assert_eq!(s.ref_count("s1/x"), Some(0));
        assert!(s.fake.calls().is_empty());

        s.driver.mount("x")?;
        assert!(s.fake.mounted(&root));
        assert_eq!(s.fake.count("mount"), 1);
        Ok(())
    }

    #[test]
    fn test_mount_failure_keeps_ref_count() -> anyhow::Result<()> {
        let s = setup(|c| c.with_servers("s1"));
        s.driver.create("x", opts(&[]))?;
        s.driver.mount("x")?;
        s.driver.unmount("x")?;

        s.fake.fail("mount");
        assert!(s.driver.mount("x").unwrap_err().is_io());
        assert_eq!(s.ref_count("s1/x"), Some(0));

        s.fake.succeed("mount");
        s.driver.mount("x")?;
        assert_eq!(s.ref_count("s1/x"), Some(1));
        Ok(())
    }

    #[test]
    fn test_mount_subdir_failure_unmounts() -> anyhow::Result<()> {
        let s = setup(|c| c.with_servers("s1").with_volume_name("shared"));
        let root = s.root.path().join("s1/shared");
        s.driver.create("a", opts(&[]))?;
        s.driver.mount("a")?;
        s.driver.unmount("a")?;
        assert!(!s.fake.mounted(&root));

        fs::remove_dir(root.join("a"))?;
        fs::write(root.join("a"), "not a directory")?;

        assert!(s.driver.mount("a").unwrap_err().is_config());
        assert!(!s.fake.mounted(&root));
        assert_eq!(s.ref_count("s1/shared"), Some(0));
        Ok(())
    }

    #[test]
    fn test_unmount_failure_restores_ref_count() -> anyhow::Result<()> {
        let s = setup(|c| c.with_servers("s1"));
        s.driver.create("x", opts(&[]))?;
        s.driver.mount("x")?;

        s.fake.fail("umount");
        assert!(s.driver.unmount("x").unwrap_err().is_io());
        assert_eq!(s.ref_count("s1/x"), Some(1));
        Ok(())
    }

    #[test]
    fn test_remove_survives_umount_failure() -> anyhow::Result<()> {
        let s = setup(|c| c.with_servers("s1"));
        s.driver.create("x", opts(&[]))?;
        s.fake.fail("umount");

        s.driver.remove("x")?;
        assert!(s.driver.list().is_empty());
        assert!(s.driver.snapshot().mounts.is_empty());
        Ok(())
    }

    #[test]
    fn test_state_survives_restart() -> anyhow::Result<()> {
        let s = setup(|c| c.with_servers("s1,s2").with_volume_name("shared"));
        let root = s.root.path().join("s1,s2/shared");
        s.driver.create("a", opts(&[]))?;
        s.driver.create("b", opts(&[]))?;
        s.driver.mount("a")?;
        s.driver.mount("b")?;

        let reopened = s.reopen()?;
        assert_eq!(reopened.snapshot(), s.driver.snapshot());
        assert_eq!(reopened.list(), s.driver.list());

        // Same id after restart.
        reopened.create("c", opts(&[]))?;
        assert_eq!(reopened.snapshot().volumes["c"].mount_id, "s1,s2/shared");
        assert_eq!(s.fake.count("mount"), 1);

        reopened.unmount("a")?;
        assert!(s.fake.mounted(&root));
        reopened.unmount("b")?;
        assert!(!s.fake.mounted(&root));
        Ok(())
    }

    #[test]
    fn test_load_legacy_state() -> anyhow::Result<()> {
        let s = setup(|c| c.with_servers("server1,server2").with_volume_name("myvol"));
        let root = s.root.path().join("server1,server2/myvol");
        let legacy = serde_json::json!({
            "DockerVolumes": {
                "test": {"GlusterVolumeId": "server1,server2/myvol", "Mountpoint": root.join("test")}
            },
            "GlusterVolumes": {
                "server1,server2/myvol": {
                    "Servers": "server1,server2",
                    "VolumeName": "myvol",
                    "Options": {},
                    "Mountpoint": root.clone()
                }
            }
        });
        fs::write(s.state_path(), serde_json::to_vec(&legacy)?)?;

        s.driver.load_state()?;
        assert_eq!(s.driver.path("test")?, root.join("test"));
        assert_eq!(s.driver.mount("test")?, root.join("test"));
        assert_eq!(s.ref_count("server1,server2/myvol"), Some(1));

        let saved = Snapshot::from_json(&fs::read(s.state_path())?)?;
        assert_eq!(saved, s.driver.snapshot());
        Ok(())
    }

    #[test]
    fn test_load_rejects_newer_state() -> anyhow::Result<()> {
        let s = setup(|c| c.with_servers("s1"));
        fs::write(s.state_path(), br#"{"version": 99}"#)?;
        assert!(matches!(
            s.driver.load_state(),
            Err(StoreError::UnsupportedVersion(99))
        ));
        assert!(s.driver.list().is_empty());
        Ok(())
    }

    struct BrokenStore;

    impl StateStore for BrokenStore {
        fn load(&self) -> std::result::Result<Option<Snapshot>, StoreError> {
            Ok(None)
        }

        fn save(&self, _snapshot: &Snapshot) -> std::result::Result<(), StoreError> {
            Err(StoreError::Malformed("disk full".into()))
        }
    }

    #[test]
    fn test_persistence_failure_is_not_fatal() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let fake = FakeHost::new();
        let driver = VolumeDriver::new(
            DriverConfig::new(root.path().to_path_buf()).with_servers("s1"),
            fake.host(),
            Box::new(BrokenStore),
        );

        driver.create("x", opts(&[]))?;
        assert_eq!(driver.mount("x")?, root.path().join("s1/x"));
        driver.unmount("x")?;
        driver.remove("x")?;
        assert!(driver.list().is_empty());
        Ok(())
    }

    #[test]
    fn test_capabilities() -> anyhow::Result<()> {
        let s = setup(|c| c);
        let caps = s.driver.capabilities();
        assert_eq!(caps.scope, Scope::Local);
        assert_eq!(serde_json::to_string(&caps)?, r#"{"scope":"local"}"#);
        Ok(())
    }
}
