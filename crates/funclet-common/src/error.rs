//! Unified error types for the funclet workspace.
//!
//! Every layer returns [`FuncletError`]. Lifecycle operations wrap the
//! underlying failure in [`FuncletError::Lifecycle`] so the container ID
//! and operation name travel with it.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ContainerId, ContainerStatus, Event};

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum FuncletError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// Another lifecycle event already holds the container's event lock.
    #[error("container {id} is busy with {current}, rejected {trigger}")]
    ContainerIsBusy {
        /// Container that was busy.
        id: ContainerId,
        /// Event currently holding the lock.
        current: Event,
        /// Event that was rejected.
        trigger: Event,
    },

    /// The container is not in the `running` state.
    #[error("container {id} is not running (status: {status})")]
    ContainerNotRunning {
        /// Container that was expected to run.
        id: ContainerId,
        /// Status reported by the runtime.
        status: ContainerStatus,
    },

    /// Teardown left the container in a status it cannot act on.
    #[error("container {id} stuck in status {status}")]
    UnexpectedStatus {
        /// Container being torn down.
        id: ContainerId,
        /// Status reported by the runtime.
        status: ContainerStatus,
    },

    /// The node cannot host the configured container pool.
    #[error("insufficient {resource}: need {required}, allocatable {allocatable}")]
    InsufficientResources {
        /// Resource kind (`memory` or `cpu`).
        resource: &'static str,
        /// Amount required by the pool.
        required: i64,
        /// Amount available after reservations.
        allocatable: i64,
    },

    /// The container's cgroup has not been created.
    #[error("cgroup does not exist: {path}")]
    CgroupNotExist {
        /// Expected cgroup directory.
        path: PathBuf,
    },

    /// A scale-up asked for less memory than the container already uses.
    #[error("cannot scale {id} to {requested} bytes, current usage is {usage} bytes")]
    ScaleBelowUsage {
        /// Target container.
        id: ContainerId,
        /// Requested memory limit in bytes.
        requested: i64,
        /// Live memory usage in bytes.
        usage: i64,
    },

    /// An external command exited unsuccessfully.
    #[error("{program} {args} exited with {code:?}: {stderr}")]
    Command {
        /// Program that was executed.
        program: String,
        /// Space-joined arguments.
        args: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// A bounded wait expired.
    #[error("timed out waiting for {operation} on {id}")]
    Timeout {
        /// Operation that timed out.
        operation: &'static str,
        /// Container or resource being waited on.
        id: String,
    },

    /// A hash validation failed.
    #[error("hash mismatch for {resource}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Resource that failed validation.
        resource: String,
        /// Expected hash value.
        expected: String,
        /// Actual computed hash value.
        actual: String,
    },

    /// Fetching or unpacking function code failed.
    #[error("code {hash} unavailable: {message}")]
    Code {
        /// Content hash of the code package.
        hash: String,
        /// Description of the failure.
        message: String,
    },

    /// A network configuration step failed.
    #[error("network error: {message}")]
    Network {
        /// Description of the failure.
        message: String,
    },

    /// The bridge subnet has no free, silent address left.
    #[error("no suitable IP in {subnet}")]
    NoSuitableIp {
        /// Subnet that was scanned.
        subnet: String,
    },

    /// A mount or unmount syscall failed.
    #[error("mount error at {path}: {message}")]
    Mount {
        /// Mount point involved.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// A function name could not be parsed.
    #[error("invalid function name: {name}")]
    InvalidFunctionName {
        /// Name as supplied by the caller.
        name: String,
    },

    /// A lifecycle operation on a container failed.
    #[error("{op} {id}: {source}")]
    Lifecycle {
        /// Container the operation ran on.
        id: ContainerId,
        /// Operation name.
        op: &'static str,
        /// Underlying failure.
        source: Box<FuncletError>,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl FuncletError {
    /// Builds an [`FuncletError::Io`] from a path and an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds the not-found error for an unknown container ID.
    pub fn container_not_exists(id: &ContainerId) -> Self {
        Self::NotFound {
            kind: "container",
            id: id.to_string(),
        }
    }

    /// Builds the not-found error for a container with no live paths.
    pub fn paths_not_exist(id: &ContainerId) -> Self {
        Self::NotFound {
            kind: "container paths",
            id: id.to_string(),
        }
    }

    /// Strips any [`FuncletError::Lifecycle`] wrappers.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::Lifecycle { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns `true` for lock contention, which callers may retry.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self.root_cause(), Self::ContainerIsBusy { .. })
    }

    /// Returns `true` for identity mismatches that are never auto-recovered.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), Self::NotFound { .. })
    }
}

/// Attaches a container ID and operation name to a failed result.
pub trait LifecycleContext<T> {
    /// Wraps the error as [`FuncletError::Lifecycle`].
    ///
    /// # Errors
    ///
    /// Returns the wrapped error if `self` is an error.
    fn during(self, id: &ContainerId, op: &'static str) -> Result<T>;
}

impl<T> LifecycleContext<T> for Result<T> {
    fn during(self, id: &ContainerId, op: &'static str) -> Result<T> {
        self.map_err(|e| match e {
            // Busy errors already carry the ID and both events.
            busy @ FuncletError::ContainerIsBusy { .. } => busy,
            other => FuncletError::Lifecycle {
                id: id.clone(),
                op,
                source: Box::new(other),
            },
        })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, FuncletError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_wrapper_keeps_root_cause() {
        let id = ContainerId::new("pod-controller-c0");
        let err: Result<()> = Err(FuncletError::container_not_exists(&id));
        let wrapped = err.during(&id, "warmup").unwrap_err();
        assert!(wrapped.is_not_found());
        assert!(wrapped.to_string().starts_with("warmup pod-controller-c0"));
    }

    #[test]
    fn busy_is_not_rewrapped() {
        let id = ContainerId::new("pod-controller-c1");
        let err: Result<()> = Err(FuncletError::ContainerIsBusy {
            id: id.clone(),
            current: Event::Warmup,
            trigger: Event::Reset,
        });
        let wrapped = err.during(&id, "reset").unwrap_err();
        assert!(matches!(wrapped, FuncletError::ContainerIsBusy { .. }));
        assert!(wrapped.is_busy());
    }
}
