//! CPU resource control via cgroup v1.
//!
//! Manages `cpu.shares`, `cpu.cfs_quota_us` and `cpu.cfs_period_us`, and
//! the milli-CPU conversions used to read grants back from them.

use std::path::Path;

use funclet_common::constants::{MILLI_CPU_TO_CPU, MIN_QUOTA_PERIOD, MIN_SHARES, SHARES_PER_CPU};
use funclet_common::error::Result;

/// Quota value meaning "no CFS bandwidth limit".
pub const UNLIMITED_QUOTA: i64 = -1;

/// Converts milli-CPUs to CPU shares.
///
/// One core is [`SHARES_PER_CPU`] shares; the result never drops below
/// [`MIN_SHARES`].
#[must_use]
pub const fn milli_cpu_to_shares(milli_cpu: i64) -> i64 {
    if milli_cpu <= 0 {
        return MIN_SHARES;
    }
    let shares = milli_cpu * SHARES_PER_CPU / MILLI_CPU_TO_CPU;
    if shares < MIN_SHARES { MIN_SHARES } else { shares }
}

/// Converts milli-CPUs to a CFS quota for the given period.
///
/// A negative input means unlimited and yields [`UNLIMITED_QUOTA`]; zero
/// yields zero (no quota written). Positive results are clamped to
/// [`MIN_QUOTA_PERIOD`].
#[must_use]
pub const fn milli_cpu_to_quota(milli_cpu: i64, period: i64) -> i64 {
    if milli_cpu < 0 {
        return UNLIMITED_QUOTA;
    }
    if milli_cpu == 0 {
        return 0;
    }
    let quota = milli_cpu * period / MILLI_CPU_TO_CPU;
    if quota < MIN_QUOTA_PERIOD {
        MIN_QUOTA_PERIOD
    } else {
        quota
    }
}

/// Converts a CFS quota back to milli-CPUs.
///
/// [`UNLIMITED_QUOTA`] maps to `-1`; a zero period maps to zero.
#[must_use]
pub const fn quota_to_milli_cpu(quota: i64, period: i64) -> i64 {
    if quota == UNLIMITED_QUOTA {
        return -1;
    }
    if period <= 0 {
        return 0;
    }
    quota * MILLI_CPU_TO_CPU / period
}

/// Reads `cpu.cfs_period_us` from a cgroup directory.
///
/// # Errors
///
/// Returns an error if the control file cannot be read.
pub fn read_cfs_period(cgroup_path: &Path) -> Result<i64> {
    super::read_i64(&cgroup_path.join("cpu.cfs_period_us"))
}

/// Reads `cpu.cfs_quota_us` from a cgroup directory.
///
/// # Errors
///
/// Returns an error if the control file cannot be read.
pub fn read_cfs_quota(cgroup_path: &Path) -> Result<i64> {
    super::read_i64(&cgroup_path.join("cpu.cfs_quota_us"))
}

/// Reads `cpu.shares` from a cgroup directory.
///
/// # Errors
///
/// Returns an error if the control file cannot be read.
pub fn read_shares(cgroup_path: &Path) -> Result<i64> {
    super::read_i64(&cgroup_path.join("cpu.shares"))
}

/// Sets the CPU shares for a cgroup.
///
/// # Errors
///
/// Returns an error if writing to `cpu.shares` fails.
pub fn set_shares(cgroup_path: &Path, shares: i64) -> Result<()> {
    super::write_value(&cgroup_path.join("cpu.shares"), shares)?;
    tracing::debug!(shares, "CPU shares set");
    Ok(())
}

/// Sets the CFS bandwidth limit.
///
/// The period is written first so the kernel never sees the new quota
/// against the old period.
///
/// # Errors
///
/// Returns an error if writing either control file fails.
pub fn set_cfs(cgroup_path: &Path, quota: i64, period: i64) -> Result<()> {
    super::write_value(&cgroup_path.join("cpu.cfs_period_us"), period)?;
    super::write_value(&cgroup_path.join("cpu.cfs_quota_us"), quota)?;
    tracing::debug!(quota, period, "CPU CFS quota set");
    Ok(())
}

/// Reads cumulative CPU time from `cpuacct.usage`, in nanoseconds.
///
/// # Errors
///
/// Returns an error if the control file cannot be read.
pub fn read_usage(cpuacct_path: &Path) -> Result<u64> {
    super::read_u64(&cpuacct_path.join("cpuacct.usage"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use funclet_common::constants::DEFAULT_CFS_PERIOD;

    #[test]
    fn shares_scale_with_cores() {
        assert_eq!(milli_cpu_to_shares(1000), 1024);
        assert_eq!(milli_cpu_to_shares(500), 512);
        assert_eq!(milli_cpu_to_shares(2500), 2560);
    }

    #[test]
    fn shares_never_below_minimum() {
        assert_eq!(milli_cpu_to_shares(0), MIN_SHARES);
        assert_eq!(milli_cpu_to_shares(1), MIN_SHARES);
        assert_eq!(milli_cpu_to_shares(-5), MIN_SHARES);
    }

    #[test]
    fn quota_uses_period() {
        assert_eq!(milli_cpu_to_quota(100, DEFAULT_CFS_PERIOD), 10_000);
        assert_eq!(milli_cpu_to_quota(1500, 50_000), 75_000);
    }

    #[test]
    fn quota_edge_values() {
        assert_eq!(milli_cpu_to_quota(-1, DEFAULT_CFS_PERIOD), UNLIMITED_QUOTA);
        assert_eq!(milli_cpu_to_quota(0, DEFAULT_CFS_PERIOD), 0);
        assert_eq!(milli_cpu_to_quota(1, DEFAULT_CFS_PERIOD), MIN_QUOTA_PERIOD);
    }

    #[test]
    fn quota_round_trips_to_milli_cpu() {
        for milli in [10, 100, 250, 1000, 3333] {
            let quota = milli_cpu_to_quota(milli, DEFAULT_CFS_PERIOD);
            assert_eq!(quota_to_milli_cpu(quota, DEFAULT_CFS_PERIOD), milli);
        }
        assert_eq!(quota_to_milli_cpu(UNLIMITED_QUOTA, DEFAULT_CFS_PERIOD), -1);
        assert_eq!(quota_to_milli_cpu(5000, 0), 0);
    }

    #[test]
    fn set_cfs_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        set_cfs(dir.path(), 20_000, 100_000).unwrap();
        assert_eq!(read_cfs_quota(dir.path()).unwrap(), 20_000);
        assert_eq!(read_cfs_period(dir.path()).unwrap(), 100_000);
    }
}
