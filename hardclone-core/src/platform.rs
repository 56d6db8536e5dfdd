//! Provides platform-specific functionality.
//!
//! This is the device collaborator layer: listing disks and partitions for a
//! front-end to offer, and answering whether a device is currently mounted so
//! a restore can refuse to overwrite it. Only Linux is supported; each
//! platform submodule exposes the same public API.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;
