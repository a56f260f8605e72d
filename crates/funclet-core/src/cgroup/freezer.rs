//! Process freezing via the cgroup v1 freezer subsystem.

use std::fmt;
use std::time::Duration;

use funclet_common::error::{FuncletError, Result};
use funclet_common::types::ContainerId;

use super::{CgroupFs, Subsystem};

const STATE_FILE: &str = "freezer.state";
const SETTLE_ATTEMPTS: u32 = 50;
const SETTLE_INTERVAL: Duration = Duration::from_millis(10);

/// Value of `freezer.state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezerState {
    /// Every task in the cgroup is frozen.
    Frozen,
    /// Tasks are being frozen.
    Freezing,
    /// Tasks run normally.
    Thawed,
}

impl FreezerState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Frozen => "FROZEN",
            Self::Freezing => "FREEZING",
            Self::Thawed => "THAWED",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "FROZEN" => Ok(Self::Frozen),
            "FREEZING" => Ok(Self::Freezing),
            "THAWED" => Ok(Self::Thawed),
            other => Err(FuncletError::Config {
                message: format!("unknown freezer state: {other}"),
            }),
        }
    }
}

impl fmt::Display for FreezerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reads the freezer state of a container.
///
/// # Errors
///
/// Returns `FuncletError::CgroupNotExist` if the container's freezer cgroup
/// was never created, or an I/O error if the state cannot be read.
pub fn state(cgroups: &CgroupFs, id: &ContainerId) -> Result<FreezerState> {
    let path = cgroups.require(Subsystem::Freezer, id)?.join(STATE_FILE);
    let content = std::fs::read_to_string(&path).map_err(|e| FuncletError::io(&path, e))?;
    FreezerState::parse(&content)
}

/// Freezes every process of a container and waits until the kernel
/// reports `FROZEN`.
///
/// # Errors
///
/// Returns `FuncletError::CgroupNotExist` if the container was never
/// started, or `FuncletError::Timeout` if the freeze does not settle.
pub fn freeze(cgroups: &CgroupFs, id: &ContainerId) -> Result<()> {
    set_state(cgroups, id, FreezerState::Frozen)?;
    for _ in 0..SETTLE_ATTEMPTS {
        if state(cgroups, id)? == FreezerState::Frozen {
            tracing::info!(id = %id, "container frozen");
            return Ok(());
        }
        std::thread::sleep(SETTLE_INTERVAL);
    }
    Err(FuncletError::Timeout {
        operation: "freeze",
        id: id.to_string(),
    })
}

/// Thaws a container.
///
/// # Errors
///
/// Returns `FuncletError::CgroupNotExist` if the container was never
/// started, or an I/O error if the write fails.
pub fn thaw(cgroups: &CgroupFs, id: &ContainerId) -> Result<()> {
    set_state(cgroups, id, FreezerState::Thawed)?;
    tracing::info!(id = %id, "container thawed");
    Ok(())
}

fn set_state(cgroups: &CgroupFs, id: &ContainerId, state: FreezerState) -> Result<()> {
    let path = cgroups.require(Subsystem::Freezer, id)?.join(STATE_FILE);
    super::write_value(&path, state)
}
