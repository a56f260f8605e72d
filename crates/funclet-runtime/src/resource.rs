//! Cgroup resource planning.
//!
//! Computes the node capacity model at startup, converts human-readable
//! grants into cgroup values, and applies scale-up and donor shrink steps
//! to container cgroups.

use funclet_common::config::ResourceSettings;
use funclet_common::constants::DEFAULT_CFS_PERIOD;
use funclet_common::error::{FuncletError, Result};
use funclet_common::types::{ContainerId, Resource, ResourceStats};
use funclet_core::cgroup::{CgroupFs, Subsystem, cpu, freezer, memory};

/// Values written to a container's cgroups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceConfig {
    /// `memory.limit_in_bytes`.
    pub memory_bytes: i64,
    /// `cpu.shares`.
    pub cpu_shares: i64,
    /// `cpu.cfs_quota_us`; `-1` means unlimited.
    pub cpu_quota: i64,
    /// `cpu.cfs_period_us`.
    pub cpu_period: i64,
}

/// Capacity model of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncletResource {
    /// Hardware or cgroup ceiling.
    pub capacity: Resource,
    /// Amount carved out for the system and the agent.
    pub reserved: Resource,
    /// `capacity - reserved`.
    pub allocatable: Resource,
    /// Per-container grant at Init.
    pub default: Resource,
    /// Memory unit that CPU scales against.
    pub base_memory: i64,
}

impl FuncletResource {
    /// Builds the capacity model.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::InsufficientResources` if a reservation is not
    /// smaller than its capacity.
    pub fn new(capacity: Resource, reserved: Resource, default: Resource, base_memory: i64) -> Result<Self> {
        if reserved.memory_bytes >= capacity.memory_bytes {
            return Err(FuncletError::InsufficientResources {
                resource: "memory",
                required: reserved.memory_bytes,
                allocatable: capacity.memory_bytes,
            });
        }
        if reserved.milli_cpus >= capacity.milli_cpus {
            return Err(FuncletError::InsufficientResources {
                resource: "cpu",
                required: reserved.milli_cpus,
                allocatable: capacity.milli_cpus,
            });
        }
        Ok(Self {
            capacity,
            reserved,
            allocatable: Resource::new(
                capacity.milli_cpus - reserved.milli_cpus,
                capacity.memory_bytes - reserved.memory_bytes,
            ),
            default,
            base_memory,
        })
    }

    /// Returns `true` if `container_num` default grants fit in allocatable
    /// memory and CPU.
    #[must_use]
    pub fn has_sufficient_resources(&self, container_num: usize) -> bool {
        self.check(container_num).is_ok()
    }

    /// Like [`Self::has_sufficient_resources`], naming the short resource.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::InsufficientResources` for the first resource
    /// that does not fit.
    pub fn check(&self, container_num: usize) -> Result<()> {
        let n = i64::try_from(container_num).unwrap_or(i64::MAX);
        let memory = self.default.memory_bytes.saturating_mul(n);
        if memory > self.allocatable.memory_bytes {
            return Err(FuncletError::InsufficientResources {
                resource: "memory",
                required: memory,
                allocatable: self.allocatable.memory_bytes,
            });
        }
        let cpu = self.default.milli_cpus.saturating_mul(n);
        if cpu > self.allocatable.milli_cpus {
            return Err(FuncletError::InsufficientResources {
                resource: "cpu",
                required: cpu,
                allocatable: self.allocatable.milli_cpus,
            });
        }
        Ok(())
    }
}

/// Reads and writes container cgroups against the node capacity model.
#[derive(Debug, Clone)]
pub struct ResourcePlanner {
    cgroups: CgroupFs,
    resource: FuncletResource,
    donor_margin: i64,
}

impl ResourcePlanner {
    /// Reads the host ceiling from the parent cgroups and builds the
    /// capacity model.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::InsufficientResources` if reservations exceed
    /// capacity.
    pub fn plan(cgroups: CgroupFs, settings: &ResourceSettings) -> Result<Self> {
        let capacity = read_capacity(&cgroups, settings);
        let resource = FuncletResource::new(
            capacity,
            Resource::new(settings.reserved_milli_cpu, settings.reserved_memory),
            Resource::new(settings.default_milli_cpu, settings.default_memory),
            settings.base_memory,
        )?;
        tracing::info!(
            capacity_memory = resource.capacity.memory_bytes,
            capacity_milli_cpu = resource.capacity.milli_cpus,
            allocatable_memory = resource.allocatable.memory_bytes,
            allocatable_milli_cpu = resource.allocatable.milli_cpus,
            "resource plan computed"
        );
        Ok(Self {
            cgroups,
            resource,
            donor_margin: settings.donor_margin,
        })
    }

    /// Capacity model.
    #[must_use]
    pub const fn resource(&self) -> &FuncletResource {
        &self.resource
    }

    /// Cgroup path resolver.
    #[must_use]
    pub const fn cgroups(&self) -> &CgroupFs {
        &self.cgroups
    }

    /// Live CFS period of the parent cgroup, or the kernel default.
    #[must_use]
    pub fn cfs_period(&self) -> i64 {
        match cpu::read_cfs_period(&self.cgroups.parent_path(Subsystem::Cpu)) {
            Ok(period) if period > 0 => period,
            _ => DEFAULT_CFS_PERIOD,
        }
    }

    /// Converts a memory string and milli-CPU request and limit to cgroup
    /// values. A `cpu_limit` of `-1` leaves CFS bandwidth unlimited.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::Config` if the memory string is malformed.
    pub fn get_resources_config(&self, memory: &str, cpu_request: i64, cpu_limit: i64) -> Result<ResourceConfig> {
        let memory_bytes = memory::parse_memory(memory)?;
        let period = self.cfs_period();
        Ok(ResourceConfig {
            memory_bytes,
            cpu_shares: cpu::milli_cpu_to_shares(cpu_request),
            cpu_quota: cpu::milli_cpu_to_quota(cpu_limit, period),
            cpu_period: period,
        })
    }

    /// Cgroup values for a plain grant.
    #[must_use]
    pub fn config_for(&self, grant: Resource) -> ResourceConfig {
        let period = self.cfs_period();
        ResourceConfig {
            memory_bytes: grant.memory_bytes,
            cpu_shares: cpu::milli_cpu_to_shares(grant.milli_cpus),
            cpu_quota: cpu::milli_cpu_to_quota(grant.milli_cpus, period),
            cpu_period: period,
        }
    }

    /// Computes a scale-up grant for `memory`, with CPU proportional to
    /// memory over the base unit and clamped to allocatable CPU.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::Config` if the memory string is malformed.
    pub fn scale_grant(&self, memory: &str) -> Result<(Resource, ResourceConfig)> {
        let memory_bytes = memory::parse_memory(memory)?;
        let milli_cpus = self.scaled_milli_cpus(memory_bytes);
        let config = self.get_resources_config(memory, milli_cpus, milli_cpus)?;
        Ok((Resource::new(milli_cpus, memory_bytes), config))
    }

    fn scaled_milli_cpus(&self, memory_bytes: i64) -> i64 {
        let base = self.resource.base_memory.max(1);
        let scaled = i128::from(memory_bytes) * i128::from(self.resource.default.milli_cpus) / i128::from(base);
        let scaled = i64::try_from(scaled).unwrap_or(i64::MAX);
        scaled.clamp(1, self.resource.allocatable.milli_cpus)
    }

    /// Applies a larger grant to a running container.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::ScaleBelowUsage` if `config.memory_bytes` is
    /// below the container's live usage, `FuncletError::CgroupNotExist` if
    /// the container was never started, or an I/O error.
    pub fn scale_up_container(&self, id: &ContainerId, config: &ResourceConfig) -> Result<()> {
        let memory_path = self.cgroups.require(Subsystem::Memory, id)?;
        let usage = memory::read_usage(&memory_path)?;
        if config.memory_bytes < usage {
            return Err(FuncletError::ScaleBelowUsage {
                id: id.clone(),
                requested: config.memory_bytes,
                usage,
            });
        }
        memory::set_limit(&memory_path, config.memory_bytes)?;
        let cpu_path = self.cgroups.require(Subsystem::Cpu, id)?;
        cpu::set_shares(&cpu_path, config.cpu_shares)?;
        cpu::set_cfs(&cpu_path, config.cpu_quota, config.cpu_period)?;
        tracing::info!(id = %id, memory = config.memory_bytes, shares = config.cpu_shares, "container scaled up");
        Ok(())
    }

    /// Freezes a donor and shrinks its memory limit to usage plus the
    /// configured margin. Returns the new limit.
    ///
    /// Blocks while the freeze settles.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::CgroupNotExist` if the donor was never started,
    /// a timeout if the freeze does not settle, or an I/O error.
    pub fn shrink_donor(&self, id: &ContainerId) -> Result<i64> {
        self.freeze(id)?;
        let memory_path = self.cgroups.require(Subsystem::Memory, id)?;
        let usage = memory::read_usage(&memory_path)?;
        let limit = usage.saturating_add(self.donor_margin);
        memory::set_limit(&memory_path, limit)?;
        tracing::info!(id = %id, usage, limit, "donor shrunk");
        Ok(limit)
    }

    /// Freezes a container.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::CgroupNotExist` if the container was never
    /// started.
    pub fn freeze(&self, id: &ContainerId) -> Result<()> {
        freezer::freeze(&self.cgroups, id)
    }

    /// Thaws a container.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::CgroupNotExist` if the container was never
    /// started.
    pub fn thaw(&self, id: &ContainerId) -> Result<()> {
        freezer::thaw(&self.cgroups, id)
    }

    /// Live usage of a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container's cgroups cannot be read.
    pub fn stats(&self, id: &ContainerId) -> Result<ResourceStats> {
        crate::metrics::collect_stats(&self.cgroups, id)
    }
}

/// Reads the memory and CPU ceiling of the parent cgroups, falling back to
/// the configured ceiling where the cgroup reports no limit.
fn read_capacity(cgroups: &CgroupFs, settings: &ResourceSettings) -> Resource {
    let memory_bytes = match memory::read_limit(&cgroups.parent_path(Subsystem::Memory)) {
        Ok(limit) if limit > 0 && !memory::is_unlimited(limit) => limit,
        Ok(_) => settings.capacity_memory,
        Err(e) => {
            tracing::debug!(error = %e, "memory ceiling unreadable, using configured capacity");
            settings.capacity_memory
        }
    };
    let cpu_path = cgroups.parent_path(Subsystem::Cpu);
    let milli_cpus = match (cpu::read_cfs_quota(&cpu_path), cpu::read_cfs_period(&cpu_path)) {
        (Ok(quota), Ok(period)) if quota > 0 && period > 0 => cpu::quota_to_milli_cpu(quota, period),
        (Ok(_), Ok(_)) => settings.capacity_milli_cpu,
        (Err(e), _) | (_, Err(e)) => {
            tracing::debug!(error = %e, "cpu ceiling unreadable, using configured capacity");
            settings.capacity_milli_cpu
        }
    };
    Resource::new(milli_cpus, memory_bytes)
}

#[cfg(test)]
mod tests {
    use funclet_common::constants::MEMORY_NO_LIMIT;

    use super::*;

    const MIB: i64 = 1 << 20;

    fn scenario(default_memory: i64) -> FuncletResource {
        FuncletResource::new(
            Resource::new(4000, 1000),
            Resource::new(0, 100),
            Resource::new(0, default_memory),
            128,
        )
        .unwrap()
    }

    fn write(dir: &std::path::Path, file: &str, value: impl ToString) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(file), value.to_string()).unwrap();
    }

    fn fake_node() -> (tempfile::TempDir, CgroupFs) {
        let dir = tempfile::tempdir().unwrap();
        let cgroups = CgroupFs::new(dir.path(), "funclet");
        let cpu = cgroups.parent_path(Subsystem::Cpu);
        write(&cpu, "cpu.cfs_period_us", 100_000);
        write(&cpu, "cpu.cfs_quota_us", -1);
        write(&cgroups.parent_path(Subsystem::Memory), "memory.limit_in_bytes", MEMORY_NO_LIMIT);
        (dir, cgroups)
    }

    fn fake_container(cgroups: &CgroupFs, id: &ContainerId, usage: i64) {
        let mem = cgroups.container_path(Subsystem::Memory, id);
        write(&mem, "memory.usage_in_bytes", usage);
        write(&mem, "memory.limit_in_bytes", 128 * MIB);
        let cpu = cgroups.container_path(Subsystem::Cpu, id);
        write(&cpu, "cpu.shares", 102);
        write(&cpu, "cpu.cfs_quota_us", 10_000);
        write(&cpu, "cpu.cfs_period_us", 100_000);
        write(&cgroups.container_path(Subsystem::Freezer, id), "freezer.state", "THAWED");
    }

    #[test]
    fn sufficient_resources_boundary() {
        let resource = scenario(90);
        assert_eq!(resource.allocatable.memory_bytes, 900);
        assert!(resource.has_sufficient_resources(10));
        assert!(!resource.has_sufficient_resources(11));
    }

    #[test]
    fn allocatable_is_capacity_minus_reserved() {
        for (capacity, reserved) in [(1000, 1), (1000, 999), (8 << 30, 512 << 20)] {
            let r = FuncletResource::new(
                Resource::new(2, capacity),
                Resource::new(1, reserved),
                Resource::default(),
                1,
            )
            .unwrap();
            assert_eq!(r.allocatable.memory_bytes, capacity - reserved);
        }
    }

    #[test]
    fn reserved_at_or_above_capacity_is_fatal() {
        let err = FuncletResource::new(Resource::new(1000, 100), Resource::new(0, 100), Resource::default(), 1)
            .unwrap_err();
        assert!(matches!(err, FuncletError::InsufficientResources { resource: "memory", .. }));
    }

    #[test]
    fn check_names_short_cpu() {
        let r = FuncletResource::new(
            Resource::new(1000, 1 << 30),
            Resource::new(500, 0),
            Resource::new(100, 1),
            1,
        )
        .unwrap();
        let err = r.check(6).unwrap_err();
        assert!(matches!(err, FuncletError::InsufficientResources { resource: "cpu", required: 600, allocatable: 500 }));
    }

    #[test]
    fn unlimited_parent_falls_back_to_configured_capacity() {
        let (_dir, cgroups) = fake_node();
        let settings = ResourceSettings::default();
        let planner = ResourcePlanner::plan(cgroups, &settings).unwrap();
        assert_eq!(planner.resource().capacity.memory_bytes, settings.capacity_memory);
        assert_eq!(planner.resource().capacity.milli_cpus, settings.capacity_milli_cpu);
    }

    #[test]
    fn limited_parent_sets_capacity() {
        let (_dir, cgroups) = fake_node();
        write(&cgroups.parent_path(Subsystem::Memory), "memory.limit_in_bytes", 2048 * MIB);
        write(&cgroups.parent_path(Subsystem::Cpu), "cpu.cfs_quota_us", 200_000);
        let planner = ResourcePlanner::plan(cgroups, &ResourceSettings::default()).unwrap();
        assert_eq!(planner.resource().capacity, Resource::new(2000, 2048 * MIB));
    }

    #[test]
    fn resources_config_reads_live_period() {
        let (_dir, cgroups) = fake_node();
        write(&cgroups.parent_path(Subsystem::Cpu), "cpu.cfs_period_us", 50_000);
        let planner = ResourcePlanner::plan(cgroups, &ResourceSettings::default()).unwrap();
        let config = planner.get_resources_config("512M", 500, 500).unwrap();
        assert_eq!(config.memory_bytes, 512 * MIB);
        assert_eq!(config.cpu_shares, 512);
        assert_eq!(config.cpu_period, 50_000);
        assert_eq!(config.cpu_quota, 25_000);

        let unlimited = planner.get_resources_config("1G", 1000, -1).unwrap();
        assert_eq!(unlimited.cpu_quota, -1);
        assert!(planner.get_resources_config("lots", 1, 1).is_err());
    }

    #[test]
    fn scale_grant_is_proportional_and_clamped() {
        let (_dir, cgroups) = fake_node();
        let planner = ResourcePlanner::plan(cgroups, &ResourceSettings::default()).unwrap();
        let (grant, _) = planner.scale_grant("512M").unwrap();
        assert_eq!(grant, Resource::new(400, 512 * MIB));
        let (huge, _) = planner.scale_grant("1T").unwrap();
        assert_eq!(huge.milli_cpus, planner.resource().allocatable.milli_cpus);
    }

    #[test]
    fn scale_up_below_usage_is_rejected() {
        let (_dir, cgroups) = fake_node();
        let id = ContainerId::new("pod-controller-c0");
        fake_container(&cgroups, &id, 300 * MIB);
        let planner = ResourcePlanner::plan(cgroups.clone(), &ResourceSettings::default()).unwrap();

        let config = planner.get_resources_config("256M", 200, 200).unwrap();
        let err = planner.scale_up_container(&id, &config).unwrap_err();
        assert!(matches!(err, FuncletError::ScaleBelowUsage { usage, .. } if usage == 300 * MIB));
        let limit = memory::read_limit(&cgroups.container_path(Subsystem::Memory, &id)).unwrap();
        assert_eq!(limit, 128 * MIB);

        let config = planner.get_resources_config("512M", 400, 400).unwrap();
        planner.scale_up_container(&id, &config).unwrap();
        let mem = cgroups.container_path(Subsystem::Memory, &id);
        assert_eq!(memory::read_limit(&mem).unwrap(), 512 * MIB);
        let cpu_path = cgroups.container_path(Subsystem::Cpu, &id);
        assert_eq!(cpu::read_shares(&cpu_path).unwrap(), 409);
        assert_eq!(cpu::read_cfs_quota(&cpu_path).unwrap(), 40_000);
    }

    #[test]
    fn shrink_donor_freezes_and_leaves_margin() {
        let (_dir, cgroups) = fake_node();
        let id = ContainerId::new("pod-controller-c3");
        fake_container(&cgroups, &id, 40 * MIB);
        let planner = ResourcePlanner::plan(cgroups.clone(), &ResourceSettings::default()).unwrap();

        let limit = planner.shrink_donor(&id).unwrap();
        assert_eq!(limit, 44 * MIB);
        assert_eq!(freezer::state(&cgroups, &id).unwrap(), freezer::FreezerState::Frozen);
        planner.thaw(&id).unwrap();
        assert_eq!(freezer::state(&cgroups, &id).unwrap(), freezer::FreezerState::Thawed);
    }

    #[test]
    fn never_started_donor_is_cgroup_not_exist() {
        let (_dir, cgroups) = fake_node();
        let planner = ResourcePlanner::plan(cgroups, &ResourceSettings::default()).unwrap();
        let err = planner.shrink_donor(&ContainerId::new("ghost")).unwrap_err();
        assert!(matches!(err, FuncletError::CgroupNotExist { .. }));
    }
}
