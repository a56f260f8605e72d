//! # funclet-core
//!
//! Low-level Linux primitives for the funclet node agent.
//!
//! This crate provides safe abstractions over:
//! - **Cgroups v1**: memory, CPU, cpuacct, and freezer control files.
//! - **Namespaces**: scoped entry into a container's network namespace.
//! - **Network**: the node bridge, the veth pool, and IP allocation.
//! - **Filesystem**: bind mounts, unmounts, and mount-table inspection.
//!
//! System calls go through `nix`; external tools (`ip`, `iptables`) are
//! driven as child processes behind traits so tests can substitute fakes.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod network;
