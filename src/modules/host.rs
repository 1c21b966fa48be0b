//! Host collaborators.
//!
//! The driver never shells out or reads the mount table directly. It goes
//! through the two traits defined here, bundled into a [`Host`] that is
//! handed to the driver at construction:
//!
//! - [`MountExecutor`] runs `mount`/`umount` and reports their output
//! - [`MountTableOracle`] answers whether a path is currently mounted

use super::constants::PROC_MOUNTS;
use super::error::{Result, VolumeError};
use log::debug;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

/// Runs external mount commands.
pub trait MountExecutor: Send + Sync {
    /// Runs `program` with `args`, returning its combined output.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::Command`] if the program cannot be spawned or
    /// exits unsuccessfully.
    fn execute(&self, program: &str, args: &[String]) -> Result<Vec<u8>>;
}

/// Reports the live mount state of the host.
pub trait MountTableOracle: Send + Sync {
    /// Whether `path` is a mount point in the current mount table.
    fn is_mounted(&self, path: &Path) -> io::Result<bool>;
}

/// [`MountExecutor`] backed by [`std::process::Command`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecutor;

impl MountExecutor for CommandExecutor {
    fn execute(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        debug!("Executing {} {:?}", program, args);

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| VolumeError::Command {
                program: program.to_string(),
                reason: e.to_string(),
                output: String::new(),
            })?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);

        if !output.status.success() {
            return Err(VolumeError::Command {
                program: program.to_string(),
                reason: output.status.to_string(),
                output: String::from_utf8_lossy(&combined).trim().to_string(),
            });
        }

        Ok(combined)
    }
}

/// [`MountTableOracle`] reading a `/proc/mounts` style table.
#[derive(Debug, Clone)]
pub struct ProcMounts {
    path: PathBuf,
}

impl Default for ProcMounts {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcMounts {
    /// Oracle over the kernel's `/proc/mounts`.
    pub fn new() -> Self {
        Self::with_path(PathBuf::from(PROC_MOUNTS))
    }

    /// Oracle over a table stored at `path`.
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }
}

impl MountTableOracle for ProcMounts {
    fn is_mounted(&self, path: &Path) -> io::Result<bool> {
        let table = fs::read_to_string(&self.path)?;
        let found = mount_points(&table).any(|mount_point| mount_point == path);
        Ok(found)
    }
}

/// Mount points listed in a mount table, one entry per line.
pub fn mount_points(table: &str) -> impl Iterator<Item = PathBuf> + '_ {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_field)
}

// The kernel writes space, tab, newline and backslash as `\ooo`.
fn unescape_field(field: &str) -> PathBuf {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let digits = &bytes[i + 1..i + 4];
            let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                decoded.push(byte);
                i += 4;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }

    PathBuf::from(OsString::from_vec(decoded))
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3 && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}

/// The collaborators a driver needs from its host.
#[derive(Clone)]
pub struct Host {
    /// Runs mount commands.
    pub executor: Arc<dyn MountExecutor>,
    /// Inspects the mount table.
    pub oracle: Arc<dyn MountTableOracle>,
}

impl Host {
    /// Bundles an executor and an oracle.
    pub fn new(executor: Arc<dyn MountExecutor>, oracle: Arc<dyn MountTableOracle>) -> Self {
        Self { executor, oracle }
    }

    /// The real host: `mount`/`umount` processes and `/proc/mounts`.
    pub fn system() -> Self {
        Self::new(Arc::new(CommandExecutor), Arc::new(ProcMounts::new()))
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host").finish_non_exhaustive()
    }
}
