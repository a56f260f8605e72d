//! Warmup: load function code, runtime and descriptors into a running
//! container, optionally after growing its grant at the expense of donors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use funclet_common::error::{FuncletError, LifecycleContext, Result};
use funclet_common::types::{ContainerId, ContainerStatus, Event};
use funclet_core::filesystem::MountOps;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use super::{Funclet, blocking, runtime_source};
use crate::brn::{FunctionRef, deal_fname};
use crate::paths::ContainerPaths;

/// Where a function's code package lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSource {
    /// `file://` or `http(s)://` reference to the package.
    pub storage_ref: String,
    /// Hex SHA-256 of the package; also the cache key.
    pub sha256: String,
}

/// Grant change applied before the code is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleRequest {
    /// New memory limit, e.g. `512M`.
    pub memory: String,
    /// Donors frozen and shrunk to make room.
    #[serde(default)]
    pub merge_ids: Vec<ContainerId>,
}

/// Inputs of a warmup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmupRequest {
    /// Target container.
    pub container_id: ContainerId,
    /// Function name, `name[:qualifier]` or a full BRN.
    pub function_name: String,
    /// Owner of the function.
    pub uid: String,
    /// Code package.
    pub code: CodeSource,
    /// Language runtime, a directory under the runtimes root.
    pub runtime: String,
    /// Entry point handed to the runtime.
    pub handler: String,
    /// Function environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Optional grant change.
    #[serde(default)]
    pub scale: Option<ScaleRequest>,
    /// Unpack the code privately and writable, and switch to stream mode.
    #[serde(default)]
    pub ide: bool,
}

#[derive(Debug, Serialize)]
struct RuntimeDescriptor<'a> {
    runtime: &'a str,
    handler: &'a str,
    memory_bytes: i64,
    milli_cpus: i64,
    stream_mode: bool,
}

#[derive(Debug, Serialize)]
struct MetaDescriptor<'a> {
    container_id: &'a ContainerId,
    uid: &'a str,
    function: &'a FunctionRef,
    code_sha256: &'a str,
    incarnation: &'a str,
    ide: bool,
}

impl Funclet {
    /// Loads a function into a running container and signals its init
    /// process that bootstrap data is ready.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::ContainerIsBusy` if another event holds the
    /// slot, `FuncletError::ContainerNotRunning` if the runtime does not
    /// report it running, `FuncletError::Timeout` if the code fetch
    /// overruns, or the first failing step. Nothing is rolled back; the
    /// next Reset converges the slot.
    pub async fn warmup(&self, request: &WarmupRequest) -> Result<()> {
        let id = &request.container_id;
        let _guard = self.inner.registry.lock_container(id, Event::Warmup)?;
        self.warmup_locked(request).await.during(id, "warmup")
    }

    async fn warmup_locked(&self, request: &WarmupRequest) -> Result<()> {
        let inner = &self.inner;
        let id = &request.container_id;
        let container = inner.registry.get_container(id)?;
        let function = deal_fname(&request.uid, &request.function_name)?;
        let runtime_dir = runtime_source(&inner.config, &request.runtime)?;

        if let Some(scale) = &request.scale {
            self.scale_up(id, scale).await?;
        }

        let status = inner.runtime.container_info(id).await?.status;
        if status != ContainerStatus::Running {
            return Err(FuncletError::ContainerNotRunning { id: id.clone(), status });
        }
        let paths = inner.paths.get_paths(id)?;

        let fetch_limit = Duration::from_secs(inner.config.timeouts.code_fetch_secs);
        let code_dir = tokio::time::timeout(fetch_limit, self.load_code(request, &paths))
            .await
            .map_err(|_| FuncletError::Timeout {
                operation: "code fetch",
                id: id.to_string(),
            })??;

        let stream_mode = request.ide || container.snapshot().with_stream_mode;
        let grant = container.snapshot().resource;
        write_descriptors(
            &paths.conf_staging_dir(),
            &request.env,
            &RuntimeDescriptor {
                runtime: &request.runtime,
                handler: &request.handler,
                memory_bytes: grant.memory_bytes,
                milli_cpus: grant.milli_cpus,
                stream_mode,
            },
            &MetaDescriptor {
                container_id: id,
                uid: &request.uid,
                function: &function,
                code_sha256: &request.code.sha256,
                incarnation: &paths.name,
                ide: request.ide,
            },
        )?;

        let mounts = Arc::clone(&inner.mounts);
        let binds = [
            (code_dir, paths.code_dir(), !request.ide),
            (runtime_dir, paths.runtime_dir(), true),
            (paths.conf_staging_dir(), paths.conf_dir(), true),
        ];
        blocking(move || {
            for (source, target, readonly) in &binds {
                rebind(mounts.as_ref(), source, target, *readonly)?;
            }
            Ok(())
        })
        .await?;

        inner.runtime.kill_container(id, Signal::SIGUSR1, false).await?;
        container.update(|s| s.with_stream_mode = stream_mode);
        tracing::info!(
            id = %id,
            function = %function.thumbnail,
            version = %function.version,
            alias = %function.alias,
            hash = %request.code.sha256,
            ide = request.ide,
            "container warmed up"
        );
        Ok(())
    }

    /// Directory holding the unpacked code: the shared cache entry, or a
    /// private unpack for IDE sessions.
    async fn load_code(&self, request: &WarmupRequest, paths: &ContainerPaths) -> Result<PathBuf> {
        let code = &request.code;
        if !request.ide {
            return self.inner.code.ensure(&code.storage_ref, &code.sha256).await;
        }
        let manager = self.inner.code.manager();
        let archive = manager.fetch_code(&code.storage_ref).await?;
        manager.check_code(&archive, &code.sha256).await?;
        let dest = paths.ide_code_dir();
        if dest.exists() {
            tokio::fs::remove_dir_all(&dest)
                .await
                .map_err(|e| FuncletError::io(&dest, e))?;
        }
        manager.unzip_code(&archive, &dest).await?;
        Ok(dest)
    }

    /// Freezes and shrinks every donor, then grows the target.
    ///
    /// Any failure aborts the remaining steps; donors already shrunk stay
    /// shrunk until their next Reset.
    async fn scale_up(&self, id: &ContainerId, scale: &ScaleRequest) -> Result<()> {
        let inner = &self.inner;
        for donor_id in &scale.merge_ids {
            if donor_id == id {
                continue;
            }
            let donor = inner.registry.get_container(donor_id)?;
            let this = self.clone();
            let donor_key = donor_id.clone();
            let limit = blocking(move || this.inner.planner.shrink_donor(&donor_key)).await?;
            donor.update(|s| {
                s.is_frozen = true;
                s.resource.memory_bytes = limit;
            });
        }

        let (grant, config) = inner.planner.scale_grant(&scale.memory)?;
        let this = self.clone();
        let target = id.clone();
        blocking(move || this.inner.planner.scale_up_container(&target, &config)).await?;
        inner.registry.get_container(id)?.update(|s| s.resource = grant);
        tracing::info!(
            id = %id,
            memory = grant.memory_bytes,
            milli_cpus = grant.milli_cpus,
            donors = scale.merge_ids.len(),
            "scale-up applied"
        );
        Ok(())
    }
}

/// Bind-mounts `source` onto `target`, replacing an earlier warmup's mount.
fn rebind(mounts: &dyn MountOps, source: &Path, target: &Path, readonly: bool) -> Result<()> {
    let _ = mounts.unmount(target)?;
    mounts.bind_mount(source, target, readonly)
}

fn write_descriptors(
    dir: &Path,
    env: &BTreeMap<String, String>,
    runtime: &RuntimeDescriptor<'_>,
    meta: &MetaDescriptor<'_>,
) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| FuncletError::io(dir, e))?;
    write_json(&dir.join("env.json"), env)?;
    write_json(&dir.join("runtime.json"), runtime)?;
    write_json(&dir.join("meta.json"), meta)
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;
    std::fs::write(path, content).map_err(|e| FuncletError::io(path, e))
}
