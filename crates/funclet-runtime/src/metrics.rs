//! Live resource usage read from a container's cgroups.

use funclet_common::error::Result;
use funclet_common::types::{ContainerId, ResourceStats};
use funclet_core::cgroup::{CgroupFs, Subsystem, cpu, memory};

/// Reads memory usage, memory limit and cumulative CPU time of a container.
///
/// # Errors
///
/// Returns `FuncletError::CgroupNotExist` if the container was never
/// started, or an I/O error if a control file cannot be read.
pub fn collect_stats(cgroups: &CgroupFs, id: &ContainerId) -> Result<ResourceStats> {
    let memory_path = cgroups.require(Subsystem::Memory, id)?;
    let cpuacct_path = cgroups.require(Subsystem::CpuAcct, id)?;
    let stats = ResourceStats {
        memory_usage_bytes: memory::read_usage(&memory_path)?,
        memory_limit_bytes: memory::read_limit(&memory_path)?,
        cpu_usage_ns: cpu::read_usage(&cpuacct_path)?,
    };
    tracing::debug!(id = %id, usage = stats.memory_usage_bytes, "stats collected");
    Ok(stats)
}
