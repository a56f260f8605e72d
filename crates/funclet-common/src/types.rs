//! Domain primitive types used across the funclet workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of a container slot on this node.
///
/// Slot IDs are deterministic: `<pod>-controller-c<index>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds the ID of slot `index` in `pod`.
    #[must_use]
    pub fn for_slot(pod: &str, index: usize) -> Self {
        Self(format!("{pod}-controller-c{index}"))
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Agent-level lifecycle event holding a container's event lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    /// Container is being created and started.
    Init,
    /// Function code is being loaded into a running container.
    Warmup,
    /// Container is being torn down and re-initialized.
    Reset,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Warmup => write!(f, "warmup"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

/// Container status as reported by the OCI runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// The runtime has no record of the container.
    #[serde(rename = "not exists")]
    NotExists,
    /// Created but the user process has not started.
    Created,
    /// The user process is running.
    Running,
    /// A freeze is in progress.
    Pausing,
    /// All processes are frozen.
    Paused,
    /// The user process has exited.
    Stopped,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotExists => "not exists",
            Self::Created => "created",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ContainerStatus {
    type Err = crate::error::FuncletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not exists" | "" => Ok(Self::NotExists),
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "pausing" => Ok(Self::Pausing),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            other => Err(crate::error::FuncletError::Config {
                message: format!("unknown container status: {other}"),
            }),
        }
    }
}

/// A CPU and memory grant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// CPU in thousandths of a core.
    pub milli_cpus: i64,
    /// Memory in bytes.
    pub memory_bytes: i64,
}

impl Resource {
    /// Creates a grant from milli-CPUs and bytes.
    #[must_use]
    pub const fn new(milli_cpus: i64, memory_bytes: i64) -> Self {
        Self {
            milli_cpus,
            memory_bytes,
        }
    }
}

/// Point-in-time usage of a container's cgroups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStats {
    /// Current memory usage in bytes.
    pub memory_usage_bytes: i64,
    /// Current memory limit in bytes.
    pub memory_limit_bytes: i64,
    /// Cumulative CPU time in nanoseconds.
    pub cpu_usage_ns: u64,
}
