//! Volume driver error types.
//!
//! Every driver operation fails with a [`VolumeError`]. The variants map onto
//! four classes a caller can act on: configuration problems, option
//! conflicts with an existing shared mount, unknown volume names, and I/O
//! failures (filesystem calls or the external mount commands).

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Unified error type for volume driver operations.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// A disallowed option, a missing required field, or a path that is not
    /// usable as a mount point.
    #[error("{0}")]
    Config(String),

    /// The requested options differ from the ones an existing shared mount
    /// was created with.
    #[error(
        "{requested:?} options differ from already created volumes {volumes:?} with options \
         {existing:?}, use 'dedicated-mount' option to not reuse existing mounts"
    )]
    Conflict {
        /// Id of the physical mount the request resolved to.
        id: String,
        /// Options carried by the rejected request.
        requested: BTreeMap<String, String>,
        /// Options of the existing physical mount.
        existing: BTreeMap<String, String>,
        /// Logical volumes already bound to the existing physical mount.
        volumes: Vec<String>,
    },

    /// No logical volume with this name is registered.
    #[error("volume {0} not found")]
    NotFound(String),

    /// A filesystem call failed.
    #[error("{context}: {source}")]
    Io {
        /// What was being done when the call failed.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The mount or umount command could not run or exited unsuccessfully.
    #[error("{program} command execute failed: {reason} ({output})")]
    Command {
        /// Program that was executed.
        program: String,
        /// Exit status or spawn error.
        reason: String,
        /// Combined stdout and stderr of the command.
        output: String,
    },
}

impl VolumeError {
    /// Create a [`VolumeError::Config`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn config<M: std::fmt::Display>(msg: M) -> Self {
        Self::Config(msg.to_string())
    }

    /// Wrap an [`io::Error`] raised while operating on `path`.
    pub fn io(action: &str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            context: format!("{} '{}'", action, path.display()),
            source,
        }
    }

    /// True for [`VolumeError::Config`].
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// True for [`VolumeError::Conflict`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// True for [`VolumeError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True for filesystem and command failures.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Command { .. })
    }
}

/// Result type alias for volume driver operations.
pub type Result<T> = std::result::Result<T, VolumeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = VolumeError::NotFound("vol1".into());
        assert_eq!(err.to_string(), "volume vol1 not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_conflict_names_volumes() {
        let err = VolumeError::Conflict {
            id: "s1/shared".into(),
            requested: BTreeMap::from([("ro".to_string(), String::new())]),
            existing: BTreeMap::new(),
            volumes: vec!["a".into(), "b".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("[\"a\", \"b\"]"));
        assert!(msg.contains("dedicated-mount"));
        assert!(err.is_conflict());
    }

    #[test]
    fn test_io_classification() {
        let err = VolumeError::io(
            "creating directory",
            Path::new("/mnt/x"),
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(err.is_io());
        assert!(err.to_string().starts_with("creating directory '/mnt/x'"));

        let err = VolumeError::Command {
            program: "umount".into(),
            reason: "exit status: 32".into(),
            output: "not mounted".into(),
        };
        assert!(err.is_io());
        assert_eq!(
            err.to_string(),
            "umount command execute failed: exit status: 32 (not mounted)"
        );
    }
}
