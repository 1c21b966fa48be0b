//! Core volume driver modules.
//! 
//! This module provides the main components of the driver:
//! 
//! - `constants`: Fixed paths and command constants
//! - `config`: Driver-level configuration
//! - `driver`: The volume driver coordinating everything below
//! - `error`: Error types
//! - `host`: Mount command executor and mount table oracle
//! - `mount`: Physical mounts and their reference counts
//! - `options`: Mount option validation
//! - `state`: Snapshot persistence
//! - `volume`: Logical volumes

#[allow(missing_docs)]
pub mod constants;
/// Driver-level configuration and log level parsing.
pub mod config;
pub mod driver;
pub mod error;
pub mod host;
/// Physical mounts, their mount state machine and registry.
pub mod mount;
pub mod options;
pub mod state;
/// Logical volumes and their registry.
pub mod volume;
