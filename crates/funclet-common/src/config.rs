//! Configuration model for the funclet agent.

use std::path::{Path, PathBuf};

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{FuncletError, Result};

const MIB: i64 = 1024 * 1024;

/// Root configuration for the node agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuncletConfig {
    /// Pod name used to derive container slot IDs.
    pub pod_name: String,
    /// Number of container slots managed on this node.
    pub container_num: usize,
    /// Base directory for spec, data, cache and tmp trees.
    pub run_dir: PathBuf,
    /// Shared read-only root filesystem for every container.
    pub rootfs: PathBuf,
    /// Directory holding one subdirectory per language runtime.
    pub runtimes_dir: PathBuf,
    /// Command started as the container's init process.
    pub bootstrap: Vec<String>,
    /// Whether containers start in stream mode.
    pub stream_mode: bool,
    /// Extra `ip hostname` lines written into each container's hosts file.
    pub extra_hosts: Vec<String>,
    /// Cgroup hierarchy location.
    pub cgroup: CgroupSettings,
    /// Capacity, reservation and per-container grants.
    pub resource: ResourceSettings,
    /// Bridge network settings.
    pub network: NetworkSettings,
    /// OCI runtime settings.
    pub runtime: RuntimeSettings,
    /// Bounded waits.
    pub timeouts: TimeoutSettings,
    /// Path reclaim pipeline settings.
    pub reclaim: ReclaimSettings,
    /// Period of the background recycler, in seconds.
    pub recycle_interval_secs: u64,
    /// How batch resets treat companions whose lock could not be taken.
    pub companion_lock_policy: CompanionLockPolicy,
}

impl Default for FuncletConfig {
    fn default() -> Self {
        Self {
            pod_name: "funclet".into(),
            container_num: 8,
            run_dir: PathBuf::from(constants::DEFAULT_RUN_DIR),
            rootfs: PathBuf::from(constants::DEFAULT_ROOTFS),
            runtimes_dir: PathBuf::from(constants::DEFAULT_RUNTIMES_DIR),
            bootstrap: vec!["/var/runtime/bootstrap".into()],
            stream_mode: false,
            extra_hosts: Vec::new(),
            cgroup: CgroupSettings::default(),
            resource: ResourceSettings::default(),
            network: NetworkSettings::default(),
            runtime: RuntimeSettings::default(),
            timeouts: TimeoutSettings::default(),
            reclaim: ReclaimSettings::default(),
            recycle_interval_secs: constants::RECYCLE_INTERVAL_SECS,
            companion_lock_policy: CompanionLockPolicy::default(),
        }
    }
}

impl FuncletConfig {
    /// Loads a configuration from a JSON file. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| FuncletError::io(path, e))?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Checks values that would otherwise fail deep inside startup.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::Config` describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.container_num == 0 {
            return Err(config_error("container_num must be at least 1"));
        }
        if self.pod_name.is_empty() {
            return Err(config_error("pod_name must not be empty"));
        }
        if self.bootstrap.is_empty() {
            return Err(config_error("bootstrap command must not be empty"));
        }
        let _ = self.network.subnet()?;
        if self.resource.base_memory <= 0 {
            return Err(config_error("resource.base_memory must be positive"));
        }
        if self.resource.default_memory <= 0 || self.resource.default_milli_cpu <= 0 {
            return Err(config_error("default per-container grant must be positive"));
        }
        if self.reclaim.unmount_retries == 0 {
            return Err(config_error("reclaim.unmount_retries must be at least 1"));
        }
        Ok(())
    }
}

fn config_error(message: &str) -> FuncletError {
    FuncletError::Config {
        message: message.into(),
    }
}

/// Location of the cgroup v1 hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupSettings {
    /// Mount point holding one directory per subsystem.
    pub root: PathBuf,
    /// Parent cgroup, relative to each subsystem.
    pub parent: String,
}

impl Default for CgroupSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from(constants::CGROUP_ROOT),
            parent: constants::DEFAULT_CGROUP_PARENT.into(),
        }
    }
}

/// Capacity model inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    /// Memory ceiling used when the parent cgroup reports no limit.
    pub capacity_memory: i64,
    /// CPU ceiling used when the parent cgroup has no CFS quota.
    pub capacity_milli_cpu: i64,
    /// Memory carved out for the agent and system overhead.
    pub reserved_memory: i64,
    /// CPU carved out for the agent and system overhead.
    pub reserved_milli_cpu: i64,
    /// Memory granted to each container at Init.
    pub default_memory: i64,
    /// CPU granted to each container at Init.
    pub default_milli_cpu: i64,
    /// Memory unit that CPU scales against on scale-up.
    pub base_memory: i64,
    /// Headroom left above a donor's usage when its limit is shrunk.
    pub donor_margin: i64,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            capacity_memory: 8192 * MIB,
            capacity_milli_cpu: 4000,
            reserved_memory: 512 * MIB,
            reserved_milli_cpu: 500,
            default_memory: 128 * MIB,
            default_milli_cpu: 100,
            base_memory: 128 * MIB,
            donor_margin: 4 * MIB,
        }
    }
}

/// Bridge network settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Bridge interface name.
    pub bridge: String,
    /// Gateway address with prefix, e.g. `172.30.0.1/16`.
    pub cidr: String,
    /// Timeout of the liveness ping on candidate addresses, in milliseconds.
    pub ping_timeout_ms: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bridge: constants::DEFAULT_BRIDGE.into(),
            cidr: constants::DEFAULT_BRIDGE_CIDR.into(),
            ping_timeout_ms: 200,
        }
    }
}

impl NetworkSettings {
    /// Parses the configured CIDR.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::Config` if the CIDR is malformed.
    pub fn subnet(&self) -> Result<Ipv4Network> {
        self.cidr.parse().map_err(|e| FuncletError::Config {
            message: format!("invalid bridge cidr {}: {e}", self.cidr),
        })
    }
}

/// OCI runtime adapter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Runtime binary name or path, resolved through `PATH`.
    pub binary: String,
    /// Whether Kill waits for the process to exit.
    pub sync_stop: bool,
    /// Number of exit polls before a synchronous stop times out.
    pub stop_max_wait: u32,
    /// Interval between exit polls, in milliseconds.
    pub stop_poll_interval_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            binary: "runc".into(),
            sync_stop: true,
            stop_max_wait: 10,
            stop_poll_interval_ms: 1000,
        }
    }
}

/// Bounded waits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Limit on the code fetch step of a warmup, in seconds.
    pub code_fetch_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            code_fetch_secs: constants::CODE_FETCH_TIMEOUT_SECS,
        }
    }
}

/// Path reclaim pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimSettings {
    /// Unmount attempts per path before the incarnation is requeued.
    pub unmount_retries: u32,
    /// First redelivery delay after a failed unmount pass, in milliseconds.
    pub backoff_base_ms: u64,
    /// Upper bound on the redelivery delay, in milliseconds.
    pub backoff_max_ms: u64,
}

impl Default for ReclaimSettings {
    fn default() -> Self {
        Self {
            unmount_retries: constants::UNMOUNT_RETRIES,
            backoff_base_ms: 1000,
            backoff_max_ms: 60_000,
        }
    }
}

/// Treatment of batch companions whose event lock is already held.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanionLockPolicy {
    /// Log the lock failure and reset the companion anyway.
    #[default]
    IncludeUnlocked,
    /// Report the companion as failed and leave it untouched.
    ExcludeUnlocked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        FuncletConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_containers_rejected() {
        let config = FuncletConfig {
            container_num: 0,
            ..FuncletConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_cidr_rejected() {
        let mut config = FuncletConfig::default();
        config.network.cidr = "300.1.1.1/40".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_takes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("funclet.json");
        std::fs::write(
            &path,
            r#"{"pod_name":"pod-x","container_num":3,"network":{"bridge":"br9"}}"#,
        )
        .unwrap();
        let config = FuncletConfig::load(&path).unwrap();
        assert_eq!(config.pod_name, "pod-x");
        assert_eq!(config.container_num, 3);
        assert_eq!(config.network.bridge, "br9");
        assert_eq!(config.network.cidr, constants::DEFAULT_BRIDGE_CIDR);
        assert_eq!(config.companion_lock_policy, CompanionLockPolicy::IncludeUnlocked);
    }
}
