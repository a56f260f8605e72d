//! Ephemeral tmp storage for container incarnations.

use std::path::{Path, PathBuf};

use funclet_common::error::{FuncletError, Result};

/// Allocates and releases the tmp storage bound at `/tmp` in a container.
pub trait TmpManager: Send + Sync {
    /// Allocates storage for incarnation `name` and returns its host path.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be allocated.
    fn get_tmp_storage(&self, name: &str) -> Result<PathBuf>;

    /// Releases the storage of incarnation `name`. Unknown names succeed.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage exists but cannot be released.
    fn remove_tmp_storage(&self, name: &str) -> Result<()>;

    /// Names of every incarnation currently holding storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocations cannot be listed.
    fn snapshot_tmp_paths(&self) -> Result<Vec<String>>;
}

/// [`TmpManager`] handing out plain directories under one root.
#[derive(Debug, Clone)]
pub struct DirTmpManager {
    root: PathBuf,
}

impl DirTmpManager {
    /// Creates a manager storing allocations under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Allocation root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TmpManager for DirTmpManager {
    fn get_tmp_storage(&self, name: &str) -> Result<PathBuf> {
        let path = self.root.join(name);
        std::fs::create_dir_all(&path).map_err(|e| FuncletError::io(&path, e))?;
        tracing::debug!(name, path = %path.display(), "tmp storage allocated");
        Ok(path)
    }

    fn remove_tmp_storage(&self, name: &str) -> Result<()> {
        let path = self.root.join(name);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                tracing::debug!(name, "tmp storage removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FuncletError::io(&path, e)),
        }
    }

    fn snapshot_tmp_paths(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FuncletError::io(&self.root, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FuncletError::io(&self.root, e))?;
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = DirTmpManager::new(dir.path().join("tmp"));
        assert!(tmp.snapshot_tmp_paths().unwrap().is_empty());

        let a = tmp.get_tmp_storage("c0-1").unwrap();
        let _ = tmp.get_tmp_storage("c1-2").unwrap();
        std::fs::write(a.join("scratch"), b"x").unwrap();
        assert_eq!(tmp.snapshot_tmp_paths().unwrap(), vec!["c0-1", "c1-2"]);

        tmp.remove_tmp_storage("c0-1").unwrap();
        tmp.remove_tmp_storage("never-allocated").unwrap();
        assert_eq!(tmp.snapshot_tmp_paths().unwrap(), vec!["c1-2"]);
    }
}
