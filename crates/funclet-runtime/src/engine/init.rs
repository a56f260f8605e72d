//! Init: bring a slot from nothing to a running, networked container.

use funclet_common::error::{LifecycleContext, Result};
use funclet_common::types::{ContainerId, Event};

use super::{Funclet, blocking, read_pid_file};
use crate::bundle::{BundleSpec, write_bundle};

impl Funclet {
    /// Creates and starts a container in an empty slot.
    ///
    /// Generates a fresh incarnation, writes its bundle with the container's
    /// current grant, starts it through the runtime and plugs it into the
    /// bridge.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::ContainerIsBusy` if another event holds the
    /// slot, or the first failing step wrapped with the container ID.
    pub async fn init(&self, id: &ContainerId) -> Result<()> {
        let _guard = self.inner.registry.lock_container(id, Event::Init)?;
        self.init_locked(id).await.during(id, "init")
    }

    /// Init body; the caller holds the event lock.
    pub(super) async fn init_locked(&self, id: &ContainerId) -> Result<()> {
        let inner = &self.inner;
        let container = inner.registry.get_container(id)?;

        // A failed earlier Init may have left an incarnation behind.
        if let Some(stale) = inner.paths.outdate_paths(id) {
            tracing::debug!(id = %id, name = %stale, "reclaiming stale incarnation");
            inner.reclaim.submit(stale);
        }

        let mut paths = inner.paths.generate_paths(id)?;
        let tmp = inner.tmp.get_tmp_storage(&paths.name)?;
        inner.paths.set_tmp_dir(id, tmp.clone())?;
        paths.tmp_dir = Some(tmp);
        inner.mounts.make_shared(&paths.data_dir)?;

        let grant = container.snapshot().resource;
        let stream_mode = inner.config.stream_mode;
        let spec = BundleSpec {
            id,
            paths: &paths,
            rootfs: &inner.config.rootfs,
            args: &inner.config.bootstrap,
            cgroups_path: inner.planner.cgroups().cgroups_path(id),
            resources: inner.planner.config_for(grant),
            stream_mode,
        };
        write_bundle(&spec, &inner.config.extra_hosts)?;

        let (pid_file, log_file) = (paths.pid_file(), paths.log_file());
        inner
            .runtime
            .start_container(id, &paths.spec_dir, &pid_file, Some(log_file.as_path()))
            .await?;
        let pid = read_pid_file(&pid_file)?;

        let network = std::sync::Arc::clone(&inner.network);
        let veth = blocking(move || network.set_container_net(pid)).await?;

        container.update(|s| {
            s.host_pid = pid;
            s.ip = Some(veth.ip);
            s.with_stream_mode = stream_mode;
            s.is_frozen = false;
        });
        tracing::info!(
            id = %id,
            pid,
            ip = %veth.ip,
            name = %paths.name,
            memory = grant.memory_bytes,
            milli_cpus = grant.milli_cpus,
            "container initialized"
        );
        Ok(())
    }
}
