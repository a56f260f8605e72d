//! Filesystem wiring for container incarnations.
//!
//! Bind mounts code, runtimes and descriptor files into an incarnation's
//! data directories and unmounts them again during reclaim.

pub mod mount;

pub use mount::{HostMounts, MountOps, UnmountOutcome};
