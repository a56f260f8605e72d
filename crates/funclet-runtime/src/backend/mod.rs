//! OCI runtime abstraction.
//!
//! The agent never creates container processes itself; it drives an
//! external OCI runtime through [`ContainerRuntime`].

pub mod runc;

use std::path::Path;

use async_trait::async_trait;
use funclet_common::error::Result;
use funclet_common::types::{ContainerId, ContainerStatus};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

pub use runc::Runc;

/// A container as reported by the OCI runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeContainer {
    /// Container ID.
    pub id: ContainerId,
    /// Pid of the init process on the host; zero if not running.
    pub pid: i32,
    /// Runtime status.
    pub status: ContainerStatus,
    /// Bundle directory.
    pub bundle: String,
    /// RFC 3339 creation time.
    pub created: String,
}

impl RuntimeContainer {
    /// Placeholder for an ID the runtime does not know.
    #[must_use]
    pub fn not_exists(id: &ContainerId) -> Self {
        Self {
            id: id.clone(),
            pid: 0,
            status: ContainerStatus::NotExists,
            bundle: String::new(),
            created: String::new(),
        }
    }
}

/// Capabilities consumed from the OCI runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates and starts a container from `bundle`, detached, writing the
    /// init pid to `pid_file`. Container output goes to `stdio` when given.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime fails to start the container.
    async fn start_container(
        &self,
        id: &ContainerId,
        bundle: &Path,
        pid_file: &Path,
        stdio: Option<&Path>,
    ) -> Result<()>;

    /// Sends `signal` to the init process, or to every process with `all`.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot deliver the signal.
    async fn kill_container(&self, id: &ContainerId, signal: Signal, all: bool) -> Result<()>;

    /// Deletes a stopped container; `force` also kills a live one.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot delete the container.
    async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<()>;

    /// Freezes every process of the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot pause the container.
    async fn pause_container(&self, id: &ContainerId) -> Result<()>;

    /// Thaws a paused container.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot resume the container.
    async fn resume_container(&self, id: &ContainerId) -> Result<()>;

    /// Lists every container the runtime knows.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot list containers.
    async fn list_containers(&self) -> Result<Vec<RuntimeContainer>>;

    /// Inspects one container. Unknown IDs report `not exists`.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime fails for another reason.
    async fn container_info(&self, id: &ContainerId) -> Result<RuntimeContainer>;
}
