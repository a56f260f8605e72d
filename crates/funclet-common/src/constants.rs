//! System-wide constants and default paths.

/// Default base directory for funclet state and container data.
pub const DEFAULT_RUN_DIR: &str = "/var/lib/funclet";

/// Default shared root filesystem for function containers.
pub const DEFAULT_ROOTFS: &str = "/var/lib/funclet/rootfs";

/// Default directory holding language runtimes, one subdirectory each.
pub const DEFAULT_RUNTIMES_DIR: &str = "/var/lib/funclet/runtimes";

/// Cgroup v1 hierarchy mount point.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Parent cgroup under every subsystem that holds the container cgroups.
pub const DEFAULT_CGROUP_PARENT: &str = "funclet";

/// Default bridge interface name.
pub const DEFAULT_BRIDGE: &str = "funclet0";

/// Default bridge subnet; the first host address is the gateway.
pub const DEFAULT_BRIDGE_CIDR: &str = "172.30.0.1/16";

/// Name of the container-side interface after it enters the namespace.
pub const CONTAINER_IFACE: &str = "eth0";

/// CPU shares granted per whole core.
pub const SHARES_PER_CPU: i64 = 1024;

/// Minimum CPU shares the kernel accepts.
pub const MIN_SHARES: i64 = 2;

/// Milli-CPUs in one core.
pub const MILLI_CPU_TO_CPU: i64 = 1000;

/// Smallest CFS quota the kernel accepts, in microseconds.
pub const MIN_QUOTA_PERIOD: i64 = 1000;

/// Default CFS period, in microseconds.
pub const DEFAULT_CFS_PERIOD: i64 = 100_000;

/// Memory limit the kernel reports for an unlimited cgroup.
pub const MEMORY_NO_LIMIT: i64 = 0x7FFF_FFFF_FFFF_F000;

/// Bounded wait on the code fetch step, in seconds.
pub const CODE_FETCH_TIMEOUT_SECS: u64 = 10;

/// Period of the background recycler, in seconds.
pub const RECYCLE_INTERVAL_SECS: u64 = 30;

/// Unmount attempts per path before an incarnation is requeued.
pub const UNMOUNT_RETRIES: u32 = 10;

/// Marker file written once a code package is fully unpacked.
pub const CODE_COMPLETE_TAG: &str = ".complete";

/// Pid file name inside an incarnation's spec directory.
pub const PID_FILE: &str = "container.pid";

/// OCI runtime configuration file name.
pub const BUNDLE_CONFIG: &str = "config.json";

/// Application name used in log output.
pub const APP_NAME: &str = "funclet";
