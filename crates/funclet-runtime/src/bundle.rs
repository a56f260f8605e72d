//! OCI bundle generation for function containers.
//!
//! Every container shares one read-only rootfs. Per-incarnation state comes
//! in through bind mounts of the data tree, which is a shared mount on the
//! host; the container side is `rslave` so code and runtime mounted after
//! start still propagate in.

use std::path::Path;

use funclet_common::error::{FuncletError, Result};
use funclet_common::types::ContainerId;

use crate::paths::ContainerPaths;
use crate::resource::ResourceConfig;

/// In-container mount point of the function code.
pub const CODE_MOUNT: &str = "/code";
/// In-container mount point of the language runtime.
pub const RUNTIME_MOUNT: &str = "/var/runtime";
/// In-container mount point of the warmup descriptor files.
pub const CONF_MOUNT: &str = "/etc/funclet";
/// In-container writable workspace.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Inputs of one bundle.
#[derive(Debug, Clone)]
pub struct BundleSpec<'a> {
    /// Container ID, also used as hostname.
    pub id: &'a ContainerId,
    /// Incarnation layout.
    pub paths: &'a ContainerPaths,
    /// Shared root filesystem.
    pub rootfs: &'a Path,
    /// Init process command line.
    pub args: &'a [String],
    /// Value for `linux.cgroupsPath`.
    pub cgroups_path: String,
    /// Cgroup limits.
    pub resources: ResourceConfig,
    /// Whether the init process serves in stream mode.
    pub stream_mode: bool,
}

/// Builds the OCI runtime configuration.
#[must_use]
pub fn generate_config(spec: &BundleSpec<'_>) -> serde_json::Value {
    let env = vec![
        "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        format!("FUNCLET_CONTAINER_ID={}", spec.id),
        format!("FUNCLET_STREAM_MODE={}", spec.stream_mode),
        format!("FUNCLET_CONF_DIR={CONF_MOUNT}"),
    ];

    let mut mounts = vec![
        serde_json::json!({ "destination": "/proc", "type": "proc", "source": "proc" }),
        serde_json::json!({ "destination": "/dev", "type": "tmpfs", "source": "tmpfs",
          "options": ["nosuid", "strictatime", "mode=755", "size=65536k"] }),
        serde_json::json!({ "destination": "/dev/pts", "type": "devpts", "source": "devpts",
          "options": ["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"] }),
        serde_json::json!({ "destination": "/dev/shm", "type": "tmpfs", "source": "shm",
          "options": ["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"] }),
        serde_json::json!({ "destination": "/sys", "type": "sysfs", "source": "sysfs",
          "options": ["nosuid", "noexec", "nodev", "ro"] }),
        bind(&spec.paths.hosts_file(), "/etc/hosts", &["rbind", "ro"]),
        bind(&spec.paths.code_dir(), CODE_MOUNT, &["rbind", "rslave", "ro"]),
        bind(&spec.paths.runtime_dir(), RUNTIME_MOUNT, &["rbind", "rslave", "ro"]),
        bind(&spec.paths.conf_dir(), CONF_MOUNT, &["rbind", "rslave", "ro"]),
        bind(&spec.paths.workspace_dir(), WORKSPACE_MOUNT, &["rbind", "rw"]),
    ];
    if let Some(tmp) = &spec.paths.tmp_dir {
        mounts.push(bind(tmp, "/tmp", &["rbind", "rw"]));
    }

    let mut cpu = serde_json::json!({
        "shares": spec.resources.cpu_shares,
        "period": spec.resources.cpu_period,
    });
    if spec.resources.cpu_quota != 0 {
        cpu["quota"] = serde_json::json!(spec.resources.cpu_quota);
    }

    serde_json::json!({
        "ociVersion": "1.0.2",
        "process": {
            "terminal": false,
            "user": { "uid": 0, "gid": 0 },
            "args": spec.args,
            "env": env,
            "cwd": "/",
            "noNewPrivileges": true
        },
        "root": { "path": spec.rootfs.display().to_string(), "readonly": true },
        "hostname": spec.id.as_str(),
        "mounts": mounts,
        "linux": {
            "cgroupsPath": spec.cgroups_path,
            "resources": {
                "memory": { "limit": spec.resources.memory_bytes },
                "cpu": cpu
            },
            "namespaces": [
                { "type": "pid" },
                { "type": "ipc" },
                { "type": "uts" },
                { "type": "mount" },
                { "type": "network" }
            ],
            "maskedPaths": [
                "/proc/acpi", "/proc/kcore", "/proc/keys", "/proc/latency_stats",
                "/proc/timer_list", "/proc/sched_debug", "/sys/firmware", "/proc/scsi"
            ],
            "readonlyPaths": [
                "/proc/bus", "/proc/fs", "/proc/irq", "/proc/sys", "/proc/sysrq-trigger"
            ]
        }
    })
}

fn bind(source: &Path, destination: &str, options: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "destination": destination,
        "type": "bind",
        "source": source.display().to_string(),
        "options": options,
    })
}

/// Renders the container's `/etc/hosts`.
#[must_use]
pub fn hosts_content(hostname: &str, extra_hosts: &[String]) -> String {
    let mut hosts = format!("127.0.0.1\tlocalhost\n::1\tlocalhost ip6-localhost ip6-loopback\n127.0.1.1\t{hostname}\n");
    for line in extra_hosts {
        hosts.push_str(line.trim());
        hosts.push('\n');
    }
    hosts
}

/// Writes the hosts file and `config.json` into the spec directory.
///
/// # Errors
///
/// Returns an error if either file cannot be written.
pub fn write_bundle(spec: &BundleSpec<'_>, extra_hosts: &[String]) -> Result<()> {
    let hosts = spec.paths.hosts_file();
    std::fs::write(&hosts, hosts_content(spec.id.as_str(), extra_hosts)).map_err(|e| FuncletError::io(&hosts, e))?;
    let config = spec.paths.config_file();
    let content = serde_json::to_string_pretty(&generate_config(spec))?;
    std::fs::write(&config, content).map_err(|e| FuncletError::io(&config, e))?;
    tracing::debug!(id = %spec.id, bundle = %spec.paths.spec_dir.display(), "bundle written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::paths::PathManager;

    fn resources() -> ResourceConfig {
        ResourceConfig {
            memory_bytes: 128 << 20,
            cpu_shares: 102,
            cpu_quota: 10_000,
            cpu_period: 100_000,
        }
    }

    #[test]
    fn config_carries_limits_and_binds() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PathManager::new(dir.path());
        let id = ContainerId::new("pod-controller-c2");
        let mut paths = manager.generate_paths(&id).unwrap();
        paths.tmp_dir = Some(PathBuf::from("/scratch/t"));
        let args = vec!["/var/runtime/bootstrap".to_string()];
        let spec = BundleSpec {
            id: &id,
            paths: &paths,
            rootfs: Path::new("/rootfs"),
            args: &args,
            cgroups_path: "/funclet/pod-controller-c2".into(),
            resources: resources(),
            stream_mode: true,
        };
        let config = generate_config(&spec);

        assert_eq!(config["root"]["readonly"], true);
        assert_eq!(config["hostname"], "pod-controller-c2");
        assert_eq!(config["process"]["args"][0], "/var/runtime/bootstrap");
        assert_eq!(config["linux"]["cgroupsPath"], "/funclet/pod-controller-c2");
        assert_eq!(config["linux"]["resources"]["memory"]["limit"], 128 << 20);
        assert_eq!(config["linux"]["resources"]["cpu"]["quota"], 10_000);
        assert!(config["linux"]["namespaces"]
            .as_array()
            .unwrap()
            .iter()
            .any(|ns| ns["type"] == "network"));

        let mounts = config["mounts"].as_array().unwrap();
        let code = mounts.iter().find(|m| m["destination"] == CODE_MOUNT).unwrap();
        assert_eq!(code["source"], paths.code_dir().display().to_string());
        assert!(code["options"].as_array().unwrap().iter().any(|o| o == "rslave"));
        assert!(mounts.iter().any(|m| m["destination"] == "/tmp" && m["source"] == "/scratch/t"));
        let env = config["process"]["env"].as_array().unwrap();
        assert!(env.iter().any(|e| e == "FUNCLET_STREAM_MODE=true"));
    }

    #[test]
    fn zero_quota_is_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let id = ContainerId::new("c");
        let paths = PathManager::new(dir.path()).for_incarnation("c-1");
        let spec = BundleSpec {
            id: &id,
            paths: &paths,
            rootfs: Path::new("/rootfs"),
            args: &[],
            cgroups_path: "/funclet/c".into(),
            resources: ResourceConfig {
                cpu_quota: 0,
                ..resources()
            },
            stream_mode: false,
        };
        let config = generate_config(&spec);
        assert!(config["linux"]["resources"]["cpu"].get("quota").is_none());
        assert!(!config["mounts"].as_array().unwrap().iter().any(|m| m["destination"] == "/tmp"));
    }

    #[test]
    fn write_bundle_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PathManager::new(dir.path());
        let id = ContainerId::new("c");
        let paths = manager.generate_paths(&id).unwrap();
        let spec = BundleSpec {
            id: &id,
            paths: &paths,
            rootfs: Path::new("/rootfs"),
            args: &[],
            cgroups_path: "/funclet/c".into(),
            resources: resources(),
            stream_mode: false,
        };
        write_bundle(&spec, &["10.0.0.5 registry.local".into()]).unwrap();

        let hosts = std::fs::read_to_string(paths.hosts_file()).unwrap();
        assert!(hosts.contains("127.0.1.1\tc\n"));
        assert!(hosts.ends_with("10.0.0.5 registry.local\n"));
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(paths.config_file()).unwrap()).unwrap();
        assert_eq!(written["ociVersion"], "1.0.2");
    }
}
