//! `funclet plan`: show the capacity model before starting.

use clap::Args;
use funclet_common::config::FuncletConfig;
use funclet_common::types::{ContainerId, Resource};
use funclet_core::cgroup::CgroupFs;
use funclet_runtime::resource::ResourcePlanner;

use crate::output::format_memory;

/// Arguments for the `plan` command.
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Also list the container slot IDs.
    #[arg(long)]
    pub slots: bool,
}

/// Executes the `plan` command.
///
/// Reads the parent cgroup ceilings, computes capacity, reservation and
/// allocatable resources, and checks the pool against them.
///
/// # Errors
///
/// Returns an error if reservations exceed capacity or the pool does not fit.
#[allow(clippy::print_stdout)]
pub fn execute(config: &FuncletConfig, args: &PlanArgs) -> anyhow::Result<()> {
    let cgroups = CgroupFs::new(&config.cgroup.root, config.cgroup.parent.as_str());
    let planner = ResourcePlanner::plan(cgroups, &config.resource)?;
    let resource = planner.resource();

    println!("Capacity plan for pod {}", config.pod_name);
    println!();
    println!("{:<14} {:>12} {:>10}", "", "MEMORY", "CPU");
    for (label, r) in [
        ("capacity", resource.capacity),
        ("reserved", resource.reserved),
        ("allocatable", resource.allocatable),
        ("per container", resource.default),
    ] {
        println!("{:<14} {:>12} {:>10}", label, memory(r), cpu(r));
    }
    let n = i64::try_from(config.container_num).unwrap_or(i64::MAX);
    let pool = Resource::new(
        resource.default.milli_cpus.saturating_mul(n),
        resource.default.memory_bytes.saturating_mul(n),
    );
    println!("{:<14} {:>12} {:>10}", format!("pool x{n}"), memory(pool), cpu(pool));
    println!();

    if args.slots {
        for index in 0..config.container_num {
            println!("  {}", ContainerId::for_slot(&config.pod_name, index));
        }
        println!();
    }

    resource.check(config.container_num)?;
    println!("Pool fits.");
    Ok(())
}

fn memory(r: Resource) -> String {
    format_memory(r.memory_bytes)
}

fn cpu(r: Resource) -> String {
    format!("{}m", r.milli_cpus)
}
