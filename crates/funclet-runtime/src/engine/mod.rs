//! The funclet orchestrator.
//!
//! [`Funclet`] owns the container slots of this node and drives them through
//! Init, Warmup, Reset, Reborn and Cooldown. Every operation first takes the
//! target's event lock; a busy container rejects the request instead of
//! queueing it. Teardown hands outdated incarnations to the reclaim
//! pipeline and returns without waiting for unmount or deletion.

mod init;
mod reset;
mod warmup;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use funclet_common::config::FuncletConfig;
use funclet_common::error::{FuncletError, LifecycleContext, Result};
use funclet_common::types::{ContainerId, ContainerStatus, Event, Resource, ResourceStats};
use funclet_core::cgroup::CgroupFs;
use funclet_core::filesystem::{HostMounts, MountOps};
use funclet_core::network::{IpRoute, LinkOps, NetworkAllocator};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::backend::{ContainerRuntime, Runc, RuntimeContainer};
use crate::code::{CodeCache, CodeManager, LocalCodeManager};
use crate::container::Container;
use crate::paths::PathManager;
use crate::reclaim::ReclaimPipeline;
use crate::registry::ContainerRegistry;
use crate::resource::ResourcePlanner;
use crate::tmp::{DirTmpManager, TmpManager};

pub use reset::{ResetRequest, ResetResponse};
pub use warmup::{CodeSource, ScaleRequest, WarmupRequest};

/// External capabilities the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    /// OCI runtime.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Code package fetcher.
    pub code: Arc<dyn CodeManager>,
    /// Tmp storage allocator.
    pub tmp: Arc<dyn TmpManager>,
    /// Link, address and firewall operations.
    pub links: Arc<dyn LinkOps>,
    /// Mount syscalls.
    pub mounts: Arc<dyn MountOps>,
}

impl Collaborators {
    /// Host implementations: `runc`, a local code cache, directory tmp
    /// storage, iproute2 and `mount(2)`.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the runtime binary is not on `PATH`.
    pub fn host(config: &FuncletConfig) -> Result<Self> {
        Ok(Self {
            runtime: Arc::new(Runc::new(&config.runtime.binary)?),
            code: Arc::new(LocalCodeManager::new(
                config.run_dir.join("code"),
                config.run_dir.join("download"),
            )),
            tmp: Arc::new(DirTmpManager::new(config.run_dir.join("tmp"))),
            links: Arc::new(IpRoute),
            mounts: Arc::new(HostMounts),
        })
    }
}

/// A container as seen by callers of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Slot ID.
    pub id: ContainerId,
    /// Runtime status.
    pub status: ContainerStatus,
    /// Host pid of the init process; zero when down.
    pub host_pid: i32,
    /// Address on the bridge.
    pub ip: Option<Ipv4Addr>,
    /// Event holding the lock, if any.
    pub event: Option<Event>,
    /// Whether the agent froze the container.
    pub is_frozen: bool,
    /// Whether the container serves in stream mode.
    pub stream_mode: bool,
    /// Current grant.
    pub resource: Resource,
    /// Live usage; zero when the cgroups are gone.
    pub stats: ResourceStats,
    /// Failure that produced this record, for batch results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Inner {
    config: FuncletConfig,
    registry: ContainerRegistry,
    runtime: Arc<dyn ContainerRuntime>,
    planner: ResourcePlanner,
    network: Arc<NetworkAllocator>,
    paths: Arc<PathManager>,
    reclaim: ReclaimPipeline,
    code: CodeCache,
    tmp: Arc<dyn TmpManager>,
    mounts: Arc<dyn MountOps>,
    stop_tx: watch::Sender<bool>,
    recycler: Mutex<Option<JoinHandle<()>>>,
}

/// The node agent. Cheap to clone; clones share every slot.
#[derive(Clone)]
pub struct Funclet {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Funclet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Funclet")
            .field("pod", &self.inner.config.pod_name)
            .field("containers", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

impl Funclet {
    /// Builds the agent and its capacity model. Nothing touches the host
    /// until [`Self::start`].
    ///
    /// # Errors
    ///
    /// Returns a config error for invalid settings and
    /// `FuncletError::InsufficientResources` if reservations exceed capacity.
    pub fn new(config: FuncletConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let cgroups = CgroupFs::new(&config.cgroup.root, config.cgroup.parent.as_str());
        let planner = ResourcePlanner::plan(cgroups, &config.resource)?;
        let network = Arc::new(NetworkAllocator::new(&config.network, collaborators.links)?);
        let paths = Arc::new(PathManager::new(&config.run_dir));
        let reclaim = ReclaimPipeline::new(
            Arc::clone(&paths),
            Arc::clone(&collaborators.mounts),
            Arc::clone(&collaborators.tmp),
            config.reclaim.clone(),
        );
        let registry = ContainerRegistry::new(&config.pod_name, config.container_num, planner.resource().default);
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                runtime: collaborators.runtime,
                planner,
                network,
                paths,
                reclaim,
                code: CodeCache::new(collaborators.code),
                tmp: collaborators.tmp,
                mounts: collaborators.mounts,
                stop_tx,
                recycler: Mutex::new(None),
                config,
            }),
        })
    }

    /// Brings the node up: capacity check, bridge, background loops, then
    /// Init of every slot concurrently.
    ///
    /// A slot whose Init fails is logged and left for a later Reset.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::InsufficientResources` if the pool does not fit
    /// the node, or the first failure of cgroup or bridge setup.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        inner.planner.resource().check(inner.config.container_num)?;
        inner.planner.cgroups().ensure_parent()?;
        let network = Arc::clone(&inner.network);
        blocking(move || network.init_network()).await?;

        let _ = inner.reclaim.spawn();
        self.spawn_recycler();

        let mut inits = JoinSet::new();
        for id in inner.registry.ids() {
            let (this, id) = (self.clone(), id.clone());
            let _ = inits.spawn(async move {
                let result = this.init(&id).await;
                (id, result)
            });
        }
        let mut failed = 0usize;
        while let Some(joined) = inits.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => {
                    failed += 1;
                    tracing::warn!(id = %id, error = %e, "initial init failed");
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(error = %e, "init task failed");
                }
            }
        }
        tracing::info!(
            pod = %inner.config.pod_name,
            containers = inner.registry.len(),
            failed,
            "funclet started"
        );
        Ok(())
    }

    /// Stops the recycler, which thaws every frozen container on its way
    /// out. In-flight lifecycle requests are not interrupted.
    pub async fn shutdown(&self) {
        let _ = self.inner.stop_tx.send(true);
        let handle = self
            .inner
            .recycler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "recycler task failed");
            }
        }
        tracing::info!("funclet stopped");
    }

    /// Slot IDs in index order.
    #[must_use]
    pub fn container_ids(&self) -> &[ContainerId] {
        self.inner.registry.ids()
    }

    /// Loaded configuration.
    #[must_use]
    pub fn config(&self) -> &FuncletConfig {
        &self.inner.config
    }

    /// Slot registry, for callers that hold event locks across requests.
    #[must_use]
    pub fn registry(&self) -> &ContainerRegistry {
        &self.inner.registry
    }

    /// Registry state, runtime status and live usage of one container.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown IDs, or the runtime's failure.
    pub async fn container_info(&self, id: &ContainerId) -> Result<ContainerInfo> {
        let container = self.inner.registry.get_container(id).during(id, "info")?;
        let runtime = self.inner.runtime.container_info(id).await.during(id, "info")?;
        Ok(self.describe(&container, &runtime))
    }

    /// [`Self::container_info`] for every slot, from one runtime listing.
    ///
    /// # Errors
    ///
    /// Returns the runtime's failure to list containers.
    pub async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let listed: HashMap<ContainerId, RuntimeContainer> = self
            .inner
            .runtime
            .list_containers()
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        Ok(self
            .inner
            .registry
            .containers()
            .iter()
            .map(|container| {
                let runtime = listed
                    .get(&container.id)
                    .cloned()
                    .unwrap_or_else(|| RuntimeContainer::not_exists(&container.id));
                self.describe(container, &runtime)
            })
            .collect())
    }

    fn describe(&self, container: &Container, runtime: &RuntimeContainer) -> ContainerInfo {
        let state = container.snapshot();
        let stats = match self.inner.planner.stats(&container.id) {
            Ok(stats) => {
                container.update(|s| s.stats = stats);
                stats
            }
            Err(e) => {
                tracing::debug!(id = %container.id, error = %e, "stats unavailable");
                ResourceStats::default()
            }
        };
        ContainerInfo {
            id: container.id.clone(),
            status: runtime.status,
            host_pid: state.host_pid,
            ip: state.ip,
            event: container.locked_by(),
            is_frozen: state.is_frozen,
            stream_mode: state.with_stream_mode,
            resource: state.resource,
            stats,
            error: None,
        }
    }

    /// Info for a failed batch member; falls back to registry state alone.
    async fn failure_info(&self, id: &ContainerId, error: &FuncletError) -> ContainerInfo {
        let mut info = match self.container_info(id).await {
            Ok(info) => info,
            Err(_) => ContainerInfo {
                id: id.clone(),
                status: ContainerStatus::NotExists,
                host_pid: 0,
                ip: None,
                event: None,
                is_frozen: false,
                stream_mode: false,
                resource: Resource::default(),
                stats: ResourceStats::default(),
                error: None,
            },
        };
        info.error = Some(error.to_string());
        info
    }

    fn spawn_recycler(&self) {
        let this = self.clone();
        let mut stop_rx = self.inner.stop_tx.subscribe();
        let period = Duration::from_secs(self.inner.config.recycle_interval_secs.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.recycle_tmp(),
                    _ = stop_rx.changed() => {
                        this.thaw_all();
                        break;
                    }
                }
            }
            tracing::debug!("recycler stopped");
        });
        *self.inner.recycler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Releases tmp storage whose incarnation is no longer live.
    fn recycle_tmp(&self) {
        let allocated = match self.inner.tmp.snapshot_tmp_paths() {
            Ok(allocated) => allocated,
            Err(e) => {
                tracing::warn!(error = %e, "tmp snapshot failed");
                return;
            }
        };
        let live = self.inner.paths.live_names();
        for name in allocated.iter().filter(|name| !live.contains(*name)) {
            match self.inner.tmp.remove_tmp_storage(name) {
                Ok(()) => tracing::info!(name = %name, "orphan tmp storage released"),
                Err(e) => tracing::warn!(name = %name, error = %e, "tmp release failed"),
            }
        }
    }

    fn thaw_all(&self) {
        for container in self.inner.registry.containers() {
            if !container.snapshot().is_frozen {
                continue;
            }
            match self.inner.planner.thaw(&container.id) {
                Ok(()) => container.update(|s| s.is_frozen = false),
                Err(e) => tracing::warn!(id = %container.id, error = %e, "thaw on shutdown failed"),
            }
        }
    }
}

/// Runs blocking host work off the async workers.
async fn blocking<T: Send + 'static>(f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FuncletError::Command {
            program: "blocking task".into(),
            args: String::new(),
            code: None,
            stderr: e.to_string(),
        })?
}

/// Reads the pid the runtime wrote for a container.
fn read_pid_file(path: &Path) -> Result<i32> {
    let content = std::fs::read_to_string(path).map_err(|e| FuncletError::io(path, e))?;
    content.trim().parse().map_err(|e| FuncletError::Config {
        message: format!("{}: invalid pid {:?}: {e}", path.display(), content.trim()),
    })
}

/// Host directory of a language runtime.
fn runtime_source(config: &FuncletConfig, runtime: &str) -> Result<PathBuf> {
    let mut components = Path::new(runtime).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    let dir = config.runtimes_dir.join(runtime);
    if !single || !dir.is_dir() {
        return Err(FuncletError::NotFound {
            kind: "runtime",
            id: runtime.to_string(),
        });
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("container.pid");
        std::fs::write(&file, "4242\n").unwrap();
        assert_eq!(read_pid_file(&file).unwrap(), 4242);
        std::fs::write(&file, "").unwrap();
        assert!(read_pid_file(&file).is_err());
    }

    #[test]
    fn runtime_source_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("python3")).unwrap();
        let config = FuncletConfig {
            runtimes_dir: dir.path().to_path_buf(),
            ..FuncletConfig::default()
        };
        assert!(runtime_source(&config, "python3").is_ok());
        assert!(runtime_source(&config, "nodejs").unwrap_err().is_not_found());
        assert!(runtime_source(&config, "../etc").is_err());
        assert!(runtime_source(&config, "..").unwrap_err().is_not_found());
        assert!(runtime_source(&config, ".").unwrap_err().is_not_found());
        assert!(runtime_source(&config, "").is_err());
    }
}
