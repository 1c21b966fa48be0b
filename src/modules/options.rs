//! Mount option validation.
//!
//! Options are free-form `key[=value]` pairs forwarded to the mount command.
//! A few keys are owned by the driver itself and are refused here; the same
//! table guards both the startup option string and per-volume options.

use super::error::{Result, VolumeError};
use std::collections::BTreeMap;

/// Normalised mount options. Keys are unique; an empty value is a flag.
pub type MountOptions = BTreeMap<String, String>;

/// Option key carrying the server list.
pub const SERVERS: &str = "servers";
/// Option key carrying the remote volume name.
pub const VOLUME_NAME: &str = "volume-name";
/// Presence flag requesting a physical mount of its own.
pub const DEDICATED_MOUNT: &str = "dedicated-mount";

/// Keys the driver refuses, with the reason reported to the caller.
const REJECTED_OPTIONS: &[(&str, &str)] = &[
    ("backup-volfile-server", "not supported"),
    ("backup-volfile-servers", "not supported"),
    (
        "log-file",
        "not supported, logs are redirected to managed plugin stdout",
    ),
    (SERVERS, "not supported in options"),
    (VOLUME_NAME, "not supported in options"),
];

/// Rejects option keys that conflict with what the driver manages itself.
pub fn check_option(key: &str, _value: &str) -> Result<()> {
    match REJECTED_OPTIONS.iter().find(|(rejected, _)| *rejected == key) {
        Some((_, reason)) => Err(VolumeError::config(format!(
            "'{}' option {}",
            key, reason
        ))),
        None => Ok(()),
    }
}

/// Options parsed from a space separated `key[=value]` string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOptions {
    /// Options forwarded to every mount.
    pub options: MountOptions,
    /// Whether `dedicated-mount` was present.
    pub dedicated: bool,
}

/// Parses the startup option string, e.g. `"ro log-level=DEBUG dedicated-mount"`.
pub fn parse_option_string(input: &str) -> Result<ParsedOptions> {
    let mut parsed = ParsedOptions::default();

    for token in input.split_whitespace() {
        let (key, value) = split_option(token);
        if key == DEDICATED_MOUNT {
            parsed.dedicated = true;
            continue;
        }
        check_option(key, value)?;
        parsed.options.insert(key.to_string(), value.to_string());
    }

    Ok(parsed)
}

/// Splits `key=value` at the first `=`; a bare key has an empty value.
pub fn split_option(token: &str) -> (&str, &str) {
    token.split_once('=').unwrap_or((token, ""))
}

/// Renders options as mount command arguments, one `-o` per entry.
pub fn to_mount_args(options: &MountOptions) -> Vec<String> {
    let mut args = Vec::with_capacity(options.len() * 2);
    for (key, value) in options {
        args.push("-o".to_string());
        if value.is_empty() {
            args.push(key.clone());
        } else {
            args.push(format!("{}={}", key, value));
        }
    }
    args
}
