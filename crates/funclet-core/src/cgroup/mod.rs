//! Cgroup v1 resource management.
//!
//! Every subsystem is mounted in its own directory under the cgroup root
//! (`/sys/fs/cgroup/<subsystem>`). Container cgroups live below a shared
//! parent: `<root>/<subsystem>/<parent>/<container-id>`. The OCI runtime
//! creates them from the bundle's `cgroupsPath`; this module only reads and
//! rewrites their control files.

pub mod cpu;
pub mod freezer;
pub mod memory;

use std::fmt::Display;
use std::path::{Path, PathBuf};

use funclet_common::error::{FuncletError, Result};
use funclet_common::types::ContainerId;

/// A cgroup v1 subsystem the agent touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    /// Memory limits and usage.
    Memory,
    /// CPU shares and CFS bandwidth.
    Cpu,
    /// CPU accounting.
    CpuAcct,
    /// Process freezing.
    Freezer,
}

impl Subsystem {
    /// Every subsystem, in creation order.
    pub const ALL: [Self; 4] = [Self::Memory, Self::Cpu, Self::CpuAcct, Self::Freezer];

    /// Directory name of the subsystem mount.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::CpuAcct => "cpuacct",
            Self::Freezer => "freezer",
        }
    }
}

/// Resolves subsystem paths for the container cgroups of this node.
#[derive(Debug, Clone)]
pub struct CgroupFs {
    root: PathBuf,
    parent: String,
}

impl CgroupFs {
    /// Creates a resolver rooted at `root` with container cgroups under `parent`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, parent: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            parent: parent.into().trim_matches('/').to_string(),
        }
    }

    /// Returns the cgroup root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of the shared parent cgroup for `subsystem`.
    #[must_use]
    pub fn parent_path(&self, subsystem: Subsystem) -> PathBuf {
        self.root.join(subsystem.dir_name()).join(&self.parent)
    }

    /// Directory of a container's cgroup for `subsystem`.
    #[must_use]
    pub fn container_path(&self, subsystem: Subsystem, id: &ContainerId) -> PathBuf {
        self.parent_path(subsystem).join(id.as_str())
    }

    /// Value for the OCI `linux.cgroupsPath` field.
    #[must_use]
    pub fn cgroups_path(&self, id: &ContainerId) -> String {
        format!("/{}/{}", self.parent, id)
    }

    /// Returns `true` if the container's cgroup exists in `subsystem`.
    #[must_use]
    pub fn exists(&self, subsystem: Subsystem, id: &ContainerId) -> bool {
        self.container_path(subsystem, id).is_dir()
    }

    /// Returns the container's cgroup directory, failing if it was never created.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::CgroupNotExist` if the directory is missing.
    pub fn require(&self, subsystem: Subsystem, id: &ContainerId) -> Result<PathBuf> {
        let path = self.container_path(subsystem, id);
        if path.is_dir() {
            Ok(path)
        } else {
            Err(FuncletError::CgroupNotExist { path })
        }
    }

    /// Creates the parent cgroup in every subsystem.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn ensure_parent(&self) -> Result<()> {
        for subsystem in Subsystem::ALL {
            let path = self.parent_path(subsystem);
            std::fs::create_dir_all(&path).map_err(|e| FuncletError::io(&path, e))?;
        }
        tracing::debug!(parent = %self.parent, "parent cgroups ready");
        Ok(())
    }
}

/// Reads a single integer from a control file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not hold an integer.
pub fn read_i64(path: &Path) -> Result<i64> {
    let content = std::fs::read_to_string(path).map_err(|e| FuncletError::io(path, e))?;
    parse_i64(path, &content)
}

/// Reads a single unsigned integer from a control file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not hold an integer.
pub fn read_u64(path: &Path) -> Result<u64> {
    let content = std::fs::read_to_string(path).map_err(|e| FuncletError::io(path, e))?;
    content.trim().parse().map_err(|e| FuncletError::Config {
        message: format!("{}: expected integer, got {:?}: {e}", path.display(), content.trim()),
    })
}

fn parse_i64(path: &Path, content: &str) -> Result<i64> {
    let value = content.trim();
    // Some kernels report unlimited memory as an unsigned value above i64::MAX.
    value
        .parse::<i64>()
        .or_else(|_| value.parse::<u64>().map(|v| i64::try_from(v).unwrap_or(i64::MAX)))
        .map_err(|e| FuncletError::Config {
            message: format!("{}: expected integer, got {value:?}: {e}", path.display()),
        })
}

/// Writes a value to a control file.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn write_value(path: &Path, value: impl Display) -> Result<()> {
    let value = value.to_string();
    std::fs::write(path, &value).map_err(|e| FuncletError::io(path, e))?;
    tracing::debug!(path = %path.display(), value = %value, "cgroup value written");
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Creates a fake cgroup tree with one container directory per subsystem.
    pub fn fake_container(cgroups: &CgroupFs, id: &ContainerId) {
        for subsystem in Subsystem::ALL {
            std::fs::create_dir_all(cgroups.container_path(subsystem, id)).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_subsystem_layout() {
        let cgroups = CgroupFs::new("/sys/fs/cgroup", "/funclet/");
        let id = ContainerId::new("pod-controller-c0");
        assert_eq!(
            cgroups.container_path(Subsystem::Memory, &id),
            PathBuf::from("/sys/fs/cgroup/memory/funclet/pod-controller-c0")
        );
        assert_eq!(cgroups.cgroups_path(&id), "/funclet/pod-controller-c0");
    }

    #[test]
    fn require_missing_cgroup_is_cgroup_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let cgroups = CgroupFs::new(dir.path(), "funclet");
        let err = cgroups
            .require(Subsystem::Freezer, &ContainerId::new("c"))
            .unwrap_err();
        assert!(matches!(err, FuncletError::CgroupNotExist { .. }));
    }

    #[test]
    fn read_i64_saturates_unsigned_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("memory.limit_in_bytes");
        std::fs::write(&file, "18446744073709551615\n").unwrap();
        assert_eq!(read_i64(&file).unwrap(), i64::MAX);
    }

    #[test]
    fn write_then_read_value() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cpu.shares");
        write_value(&file, 512).unwrap();
        assert_eq!(read_i64(&file).unwrap(), 512);
    }
}
