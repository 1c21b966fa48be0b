use super::constants::{DEFAULT_ROOT, STATE_FILE_NAME};
use super::error::{Result, VolumeError};
use super::options::{parse_option_string, MountOptions};
use log::LevelFilter;
use std::path::PathBuf;

/// Driver-level configuration, built once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Directory under which every physical mount gets its root.
    pub root: PathBuf,
    /// File holding the persisted snapshot.
    pub state_path: PathBuf,
    /// Server list fixed for every volume, if any.
    pub servers: Option<String>,
    /// Remote volume fixed for every volume. When set, logical volumes
    /// become subdirectories of one shared mount.
    pub volume_name: Option<String>,
    /// Give every volume its own physical mount by default.
    pub dedicated_mounts: bool,
    /// Options fixed for every mount. When non-empty, volumes may not carry
    /// options of their own.
    pub options: MountOptions,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::new(PathBuf::from(DEFAULT_ROOT))
    }
}

impl DriverConfig {
    /// Creates a configuration rooted at `root` with nothing fixed.
    pub fn new(root: PathBuf) -> Self {
        Self {
            state_path: root.join(STATE_FILE_NAME),
            root,
            servers: None,
            volume_name: None,
            dedicated_mounts: false,
            options: MountOptions::new(),
        }
    }

    /// Fixes the server list. Empty strings count as unset.
    pub fn with_servers(mut self, servers: impl Into<String>) -> Self {
        self.servers = non_empty(servers.into());
        self
    }

    /// Fixes the remote volume name. Empty strings count as unset.
    pub fn with_volume_name(mut self, volume_name: impl Into<String>) -> Self {
        self.volume_name = non_empty(volume_name.into());
        self
    }

    /// Overrides the snapshot location.
    pub fn with_state_path(mut self, state_path: PathBuf) -> Self {
        self.state_path = state_path;
        self
    }

    /// Applies a space separated `key[=value]` option string.
    pub fn with_option_string(mut self, input: &str) -> Result<Self> {
        let parsed = parse_option_string(input)?;
        self.dedicated_mounts |= parsed.dedicated;
        self.options.extend(parsed.options);
        Ok(self)
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Maps a `LOGLEVEL` value onto a log filter. Empty means `WARNING`.
pub fn parse_log_level(level: &str) -> Result<LevelFilter> {
    match level {
        "TRACE" => Ok(LevelFilter::Trace),
        "DEBUG" => Ok(LevelFilter::Debug),
        "INFO" => Ok(LevelFilter::Info),
        "" | "WARNING" => Ok(LevelFilter::Warn),
        "ERROR" | "CRITICAL" | "NONE" => Ok(LevelFilter::Error),
        other => Err(VolumeError::config(format!("unknown log level '{}'", other))),
    }
}
