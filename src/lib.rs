#![doc(html_root_url = "https://docs.rs/gfsvol/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! gfsvol: named container volumes on shared GlusterFS mounts
//! 
//! A volume driver that hands out named volumes while sharing a small
//! number of GlusterFS mounts underneath.
//! 
//! ## Features
//! 
//! - Volumes share one physical mount per servers and remote volume
//! - Dedicated mounts on request
//! - Reference counted mount and unmount
//! - State persisted across restarts
//! 
//! ## Quick Start
//! 
//! ```rust,no_run
//! use gfsvol::{DriverConfig, Host, JsonFileStore, VolumeDriver};
//! use std::collections::BTreeMap;
//! use std::path::PathBuf;
//! 
//! # fn main() -> anyhow::Result<()> {
//! let config = DriverConfig::new(PathBuf::from("/mnt"))
//!     .with_servers("server1,server2")
//!     .with_volume_name("shared");
//! let store = JsonFileStore::new(config.state_path.clone());
//! let driver = VolumeDriver::new(config, Host::system(), Box::new(store));
//! driver.load_state()?;
//! 
//! // Each volume is a subdirectory of the shared mount
//! driver.create("data", BTreeMap::new())?;
//! let path = driver.mount("data")?;
//! println!("mounted at {}", path.display());
//! driver.unmount("data")?;
//! # Ok(())
//! # }
//! ```
//! 
//! ## Volume Layout
//! 
//! - Volume name fixed: every volume is `<root>/<servers>/<volume>/<name>`
//! - Volume name unset: every volume gets `<root>/<servers>/<name>`
//! - `dedicated-mount`: `<root>/_dedicated/<servers>/<volume>/<n>`

pub mod modules;

pub use modules::config::DriverConfig;
pub use modules::driver::{Capabilities, Scope, VolumeDriver, VolumeInfo};
pub use modules::error::VolumeError;
pub use modules::host::{CommandExecutor, Host, MountExecutor, MountTableOracle, ProcMounts};
pub use modules::state::{JsonFileStore, Snapshot, StateStore, StoreError};
