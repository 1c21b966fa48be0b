// Mount command
pub const FS_TYPE: &str = "glusterfs";
pub const MOUNT_LOG_FILE: &str = "/run/docker/plugins/init-stdout";
pub const MOUNT_PROGRAM: &str = "mount";
pub const UMOUNT_PROGRAM: &str = "umount";

// Host paths
pub const DEFAULT_ROOT: &str = "/mnt";
pub const STATE_FILE_NAME: &str = "glusterfs-state.json";
pub const PROC_MOUNTS: &str = "/proc/mounts";
pub const DIR_PERMISSION: u32 = 0o755;

// Mount ids
pub const DEDICATED_NAMESPACE: &str = "_dedicated";

// Snapshot schema
pub const SNAPSHOT_VERSION: u32 = 2;
