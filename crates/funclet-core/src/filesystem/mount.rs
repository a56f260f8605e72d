//! Bind mounts and mount-table inspection.

use std::path::{Path, PathBuf};

use funclet_common::error::{FuncletError, Result};

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Result of a single unmount attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountOutcome {
    /// The mount was removed.
    Unmounted,
    /// Nothing was mounted at the target.
    NotMounted,
}

/// Mount operations used by the agent.
///
/// The host implementation issues syscalls; tests substitute an in-memory
/// table.
pub trait MountOps: Send + Sync {
    /// Bind-mounts `source` onto `target`, optionally read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount syscall fails.
    fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> Result<()>;

    /// Unmounts `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the target is mounted but cannot be unmounted.
    fn unmount(&self, target: &Path) -> Result<UnmountOutcome>;

    /// Lists mount points at or below `root`, deepest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount table cannot be read.
    fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>>;

    /// Turns `path` into a recursive shared mount so later mounts below it
    /// propagate into containers that bind it with slave propagation.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount syscalls fail.
    fn make_shared(&self, path: &Path) -> Result<()>;
}

/// [`MountOps`] backed by `mount(2)` and `/proc/self/mountinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostMounts;

#[cfg(target_os = "linux")]
impl MountOps for HostMounts {
    fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> Result<()> {
        use nix::mount::{MsFlags, mount};

        let mount_err = |e: nix::Error| FuncletError::Mount {
            path: target.to_path_buf(),
            message: format!("bind {} failed: {e}", source.display()),
        };
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(mount_err)?;
        if readonly {
            mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(mount_err)?;
        }
        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            readonly,
            "bind mount created"
        );
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<UnmountOutcome> {
        use nix::errno::Errno;
        use nix::mount::{MntFlags, umount2};

        match umount2(target, MntFlags::empty()) {
            Ok(()) => {
                tracing::debug!(path = %target.display(), "unmounted");
                Ok(UnmountOutcome::Unmounted)
            }
            Err(Errno::EINVAL | Errno::ENOENT) => Ok(UnmountOutcome::NotMounted),
            Err(e) => Err(FuncletError::Mount {
                path: target.to_path_buf(),
                message: format!("unmount failed: {e}"),
            }),
        }
    }

    fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let content = std::fs::read_to_string(MOUNTINFO).map_err(|e| FuncletError::io(MOUNTINFO, e))?;
        Ok(filter_under(parse_mountinfo(&content), root))
    }

    fn make_shared(&self, path: &Path) -> Result<()> {
        use nix::mount::{MsFlags, mount};

        if !self.mounts_under(path)?.iter().any(|p| p == path) {
            self.bind_mount(path, path, false)?;
        }
        mount(
            None::<&str>,
            path,
            None::<&str>,
            MsFlags::MS_SHARED | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| FuncletError::Mount {
            path: path.to_path_buf(),
            message: format!("make-rshared failed: {e}"),
        })?;
        tracing::info!(path = %path.display(), "shared mount ready");
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl MountOps for HostMounts {
    fn bind_mount(&self, _source: &Path, target: &Path, _readonly: bool) -> Result<()> {
        Err(linux_required(target))
    }

    fn unmount(&self, target: &Path) -> Result<UnmountOutcome> {
        Err(linux_required(target))
    }

    fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>> {
        Err(linux_required(root))
    }

    fn make_shared(&self, path: &Path) -> Result<()> {
        Err(linux_required(path))
    }
}

#[cfg(not(target_os = "linux"))]
fn linux_required(path: &Path) -> FuncletError {
    FuncletError::Mount {
        path: path.to_path_buf(),
        message: "Linux required for mount operations".into(),
    }
}

/// Extracts mount points from `/proc/self/mountinfo` content.
///
/// The mount point is the fifth field; spaces and other special characters
/// are octal-escaped by the kernel.
#[must_use]
pub fn parse_mountinfo(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_octal(field)))
        .collect()
}

/// Keeps the mount points at or below `root`, deepest first, without
/// duplicates.
#[must_use]
pub fn filter_under(mounts: Vec<PathBuf>, root: &Path) -> Vec<PathBuf> {
    let mut under: Vec<PathBuf> = mounts.into_iter().filter(|m| m.starts_with(root)).collect();
    under.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| a.cmp(b))
    });
    under.dedup();
    under
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..=i + 3]) {
            let value = (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3 && digits[0] <= b'3' && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}
