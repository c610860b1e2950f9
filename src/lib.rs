//! Copy-on-write filesystem backup engine managing atomic snapshots of
//! subvolume trees and replicating them incrementally to a second host.

pub mod backup_error;
pub mod configuration;
pub mod connection;
pub mod engine;
pub mod host;
pub mod objects;
pub mod retention;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use backup_error::BackupError;
pub use engine::BackupEngine;
pub use host::BackupTargetHost;
