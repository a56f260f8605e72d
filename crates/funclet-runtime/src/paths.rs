//! Per-incarnation directory layout and the live path registry.
//!
//! Every Init realizes a fresh incarnation named `<container-id>-<unixnano>`
//! with two trees:
//!
//! ```text
//! <run>/spec/<name>/   config.json, hosts, container.pid, container.log, conf/
//! <run>/data/<name>/   code/ runtime/ conf/ workspace/
//! ```
//!
//! The data tree is what the container sees through bind mounts. Reset
//! outdates the incarnation and hands its name to the reclaim pipeline.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use funclet_common::constants::{BUNDLE_CONFIG, PID_FILE};
use funclet_common::error::{FuncletError, Result};
use funclet_common::types::ContainerId;

const SPEC_DIR: &str = "spec";
const DATA_DIR: &str = "data";

/// Concrete locations of one incarnation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPaths {
    /// Incarnation name, `<container-id>-<unixnano>`.
    pub name: String,
    /// Bundle directory handed to the OCI runtime.
    pub spec_dir: PathBuf,
    /// Root of the bind-mounted data tree.
    pub data_dir: PathBuf,
    /// Tmp storage, once allocated.
    pub tmp_dir: Option<PathBuf>,
}

impl ContainerPaths {
    /// Layout of incarnation `name` under `run_dir`.
    #[must_use]
    pub fn new(run_dir: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            spec_dir: run_dir.join(SPEC_DIR).join(name),
            data_dir: run_dir.join(DATA_DIR).join(name),
            tmp_dir: None,
        }
    }

    /// OCI `config.json`.
    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.spec_dir.join(BUNDLE_CONFIG)
    }

    /// Hosts file bound over `/etc/hosts`.
    #[must_use]
    pub fn hosts_file(&self) -> PathBuf {
        self.spec_dir.join("hosts")
    }

    /// Pid file written by the runtime.
    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.spec_dir.join(PID_FILE)
    }

    /// Container stdout and stderr.
    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.spec_dir.join("container.log")
    }

    /// Staging directory for the descriptor files of a warmup.
    #[must_use]
    pub fn conf_staging_dir(&self) -> PathBuf {
        self.spec_dir.join("conf")
    }

    /// Private, writable unpack of the code for IDE sessions.
    #[must_use]
    pub fn ide_code_dir(&self) -> PathBuf {
        self.spec_dir.join("ide-code")
    }

    /// Mount point of the function code.
    #[must_use]
    pub fn code_dir(&self) -> PathBuf {
        self.data_dir.join("code")
    }

    /// Mount point of the language runtime.
    #[must_use]
    pub fn runtime_dir(&self) -> PathBuf {
        self.data_dir.join("runtime")
    }

    /// Mount point of the descriptor files.
    #[must_use]
    pub fn conf_dir(&self) -> PathBuf {
        self.data_dir.join("conf")
    }

    /// Writable scratch space kept for the lifetime of the incarnation.
    #[must_use]
    pub fn workspace_dir(&self) -> PathBuf {
        self.data_dir.join("workspace")
    }

    /// Subdirectories of the data tree.
    #[must_use]
    pub fn data_subdirs(&self) -> [PathBuf; 4] {
        [self.code_dir(), self.runtime_dir(), self.conf_dir(), self.workspace_dir()]
    }

    /// Data subdirectories that only ever hold a bind mount, so they must be
    /// empty once everything below the data tree is unmounted.
    #[must_use]
    pub fn mount_targets(&self) -> [PathBuf; 3] {
        [self.code_dir(), self.runtime_dir(), self.conf_dir()]
    }

    fn create(&self) -> Result<()> {
        let dirs = [self.spec_dir.clone(), self.conf_staging_dir()]
            .into_iter()
            .chain(self.data_subdirs());
        for dir in dirs {
            std::fs::create_dir_all(&dir).map_err(|e| FuncletError::io(&dir, e))?;
        }
        Ok(())
    }
}

/// Generates incarnations and tracks the live one of every container.
#[derive(Debug)]
pub struct PathManager {
    run_dir: PathBuf,
    live: Mutex<HashMap<ContainerId, ContainerPaths>>,
    last_nanos: AtomicI64,
}

impl PathManager {
    /// Creates a manager rooted at `run_dir`.
    #[must_use]
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            live: Mutex::new(HashMap::new()),
            last_nanos: AtomicI64::new(0),
        }
    }

    /// Base directory.
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Creates the directories of a fresh incarnation and registers it as
    /// the container's live one.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a directory cannot be created. Directories
    /// created before the failure are left in place.
    pub fn generate_paths(&self, id: &ContainerId) -> Result<ContainerPaths> {
        let name = format!("{id}-{}", self.next_nanos());
        let paths = ContainerPaths::new(&self.run_dir, &name);
        paths.create()?;
        let _ = self.live().insert(id.clone(), paths.clone());
        tracing::debug!(id = %id, name = %name, "paths generated");
        Ok(paths)
    }

    /// Returns the live incarnation of a container.
    ///
    /// # Errors
    ///
    /// Returns the paths not-found error if the container has none.
    pub fn get_paths(&self, id: &ContainerId) -> Result<ContainerPaths> {
        self.live()
            .get(id)
            .cloned()
            .ok_or_else(|| FuncletError::paths_not_exist(id))
    }

    /// Records the tmp storage of the live incarnation.
    ///
    /// # Errors
    ///
    /// Returns the paths not-found error if the container has none.
    pub fn set_tmp_dir(&self, id: &ContainerId, tmp: PathBuf) -> Result<()> {
        let mut live = self.live();
        let paths = live.get_mut(id).ok_or_else(|| FuncletError::paths_not_exist(id))?;
        paths.tmp_dir = Some(tmp);
        Ok(())
    }

    /// Removes the live incarnation from the registry and returns its name
    /// for reclaim.
    pub fn outdate_paths(&self, id: &ContainerId) -> Option<String> {
        let outdated = self.live().remove(id).map(|paths| paths.name);
        if let Some(name) = &outdated {
            tracing::debug!(id = %id, name = %name, "paths outdated");
        }
        outdated
    }

    /// Layout of any incarnation, live or outdated.
    #[must_use]
    pub fn for_incarnation(&self, name: &str) -> ContainerPaths {
        ContainerPaths::new(&self.run_dir, name)
    }

    /// Names of every live incarnation.
    #[must_use]
    pub fn live_names(&self) -> HashSet<String> {
        self.live().values().map(|p| p.name.clone()).collect()
    }

    /// Strictly increasing wall-clock nanoseconds, so two incarnations of
    /// one container never share a name.
    fn next_nanos(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let prev = self
            .last_nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last.saturating_add(1))))
            .unwrap_or(now);
        now.max(prev.saturating_add(1))
    }

    fn live(&self) -> MutexGuard<'_, HashMap<ContainerId, ContainerPaths>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
