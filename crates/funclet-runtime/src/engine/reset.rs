//! Reset, Reborn and Cooldown: tear a slot down to nothing and Init it
//! again, optionally together with a batch of companions.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use funclet_common::config::CompanionLockPolicy;
use funclet_common::error::{FuncletError, LifecycleContext, Result};
use funclet_common::types::{ContainerId, ContainerStatus, Event, ResourceStats};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use super::{ContainerInfo, Funclet, blocking, read_pid_file};
use crate::registry::EventGuard;

/// Inputs of a reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetRequest {
    /// Target container.
    pub container_id: ContainerId,
    /// Companions reset alongside the target, from a scale-down
    /// recommendation.
    #[serde(default)]
    pub scale_down: Option<Vec<ContainerId>>,
}

/// Outcome of a batch reset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetResponse {
    /// Companions that are running again.
    pub success: Vec<ContainerId>,
    /// Companions that failed, with their state after the failure.
    pub fails: HashMap<ContainerId, ContainerInfo>,
}

/// What a teardown restores before Init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rebuild {
    /// Keep the current grant.
    Reset,
    /// Restore the default grant.
    Reborn,
}

impl Rebuild {
    const fn op(self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::Reborn => "reborn",
        }
    }
}

impl Funclet {
    /// Tears a container down and starts a fresh incarnation with the same
    /// grant. Companions listed in `scale_down` are reset concurrently, each
    /// at most once.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::ContainerIsBusy` if the target's lock is held,
    /// or the target's first failing step. Companion failures are reported
    /// in the response, not as an error. When the target fails, companions
    /// still run to completion and each outcome is logged at `warn`.
    pub async fn reset(&self, request: &ResetRequest) -> Result<ResetResponse> {
        self.rebuild(request, Rebuild::Reset).await
    }

    /// Like [`Self::reset`], also restoring every rebuilt container to the
    /// default grant.
    ///
    /// # Errors
    ///
    /// Same as [`Self::reset`].
    pub async fn reborn(&self, request: &ResetRequest) -> Result<ResetResponse> {
        self.rebuild(request, Rebuild::Reborn).await
    }

    /// Single-target reset.
    ///
    /// # Errors
    ///
    /// Same as [`Self::reset`].
    pub async fn cooldown(&self, id: &ContainerId) -> Result<()> {
        let request = ResetRequest {
            container_id: id.clone(),
            scale_down: None,
        };
        let _ = self.rebuild(&request, Rebuild::Reset).await?;
        Ok(())
    }

    async fn rebuild(&self, request: &ResetRequest, mode: Rebuild) -> Result<ResetResponse> {
        let id = &request.container_id;
        let _guard = self.inner.registry.lock_container(id, Event::Reset)?;

        let mut response = ResetResponse::default();
        let mut companions = JoinSet::new();
        let batch: BTreeSet<&ContainerId> = request
            .scale_down
            .iter()
            .flatten()
            .filter(|c| *c != id)
            .collect();
        for companion in batch {
            let guard = match self.lock_companion(companion) {
                Ok(guard) => guard,
                Err(e) => {
                    let info = self.failure_info(companion, &e).await;
                    let _ = response.fails.insert(companion.clone(), info);
                    continue;
                }
            };
            let (this, companion) = (self.clone(), companion.clone());
            let _ = companions.spawn(async move {
                let _guard = guard;
                let result = this.rebuild_locked(&companion, mode).await.during(&companion, mode.op());
                (companion, result)
            });
        }

        let target = self.rebuild_locked(id, mode).await.during(id, mode.op());

        while let Some(joined) = companions.join_next().await {
            match joined {
                Ok((companion, Ok(()))) => response.success.push(companion),
                Ok((companion, Err(e))) => {
                    tracing::warn!(id = %companion, error = %e, "companion {} failed", mode.op());
                    let info = self.failure_info(&companion, &e).await;
                    let _ = response.fails.insert(companion, info);
                }
                Err(e) => tracing::error!(error = %e, "companion task failed"),
            }
        }
        response.success.sort();
        if let Err(e) = target {
            for companion in &response.success {
                tracing::warn!(id = %companion, target = %id, "companion {} succeeded, target failed", mode.op());
            }
            for (companion, info) in &response.fails {
                tracing::warn!(
                    id = %companion,
                    target = %id,
                    error = info.error.as_deref().unwrap_or_default(),
                    "companion {} failed, target failed",
                    mode.op()
                );
            }
            return Err(e);
        }
        Ok(response)
    }

    /// Takes a companion's lock under the configured policy. `Ok(None)`
    /// means the companion proceeds without its lock.
    fn lock_companion(&self, id: &ContainerId) -> Result<Option<EventGuard>> {
        match self.inner.registry.lock_container(id, Event::Reset) {
            Ok(guard) => Ok(Some(guard)),
            Err(e) if e.is_busy() => match self.inner.config.companion_lock_policy {
                CompanionLockPolicy::IncludeUnlocked => {
                    tracing::warn!(id = %id, error = %e, "companion busy, resetting without lock");
                    Ok(None)
                }
                CompanionLockPolicy::ExcludeUnlocked => {
                    tracing::warn!(id = %id, error = %e, "companion busy, skipped");
                    Err(e)
                }
            },
            Err(e) => Err(e),
        }
    }

    /// Drives a container to `not exists`, retires its incarnation and
    /// Inits it again. The caller holds the event lock.
    async fn rebuild_locked(&self, id: &ContainerId, mode: Rebuild) -> Result<()> {
        let inner = &self.inner;
        let container = inner.registry.get_container(id)?;
        let runtime = &inner.runtime;

        let mut status = runtime.container_info(id).await?.status;
        if matches!(status, ContainerStatus::Paused | ContainerStatus::Pausing) {
            runtime.resume_container(id).await?;
            container.update(|s| s.is_frozen = false);
            status = runtime.container_info(id).await?.status;
        } else if container.snapshot().is_frozen {
            // Frozen by a donor shrink rather than by the runtime.
            if let Err(e) = inner.planner.thaw(id) {
                tracing::debug!(id = %id, error = %e, "thaw before kill failed");
            }
            container.update(|s| s.is_frozen = false);
        }

        if matches!(status, ContainerStatus::Running | ContainerStatus::Created) {
            let pid = container.snapshot().host_pid;
            runtime.kill_container(id, Signal::SIGKILL, true).await?;
            if inner.config.runtime.sync_stop {
                self.wait_exit(id, pid).await?;
            }
            status = runtime.container_info(id).await?.status;
        }

        if status == ContainerStatus::Stopped {
            if let Err(e) = runtime.remove_container(id, false).await {
                tracing::warn!(id = %id, error = %e, "delete failed, forcing");
                runtime.remove_container(id, true).await?;
            }
            status = runtime.container_info(id).await?.status;
        }

        if status != ContainerStatus::NotExists {
            return Err(FuncletError::UnexpectedStatus { id: id.clone(), status });
        }

        self.retire(id);

        container.update(|s| {
            s.host_pid = 0;
            s.ip = None;
            s.is_frozen = false;
            s.with_stream_mode = false;
            s.stats = ResourceStats::default();
            if mode == Rebuild::Reborn {
                s.resource = inner.planner.resource().default;
            }
        });
        tracing::info!(id = %id, "container torn down");

        self.init_locked(id).await
    }

    /// Releases the network of a removed container and hands its
    /// incarnation to reclaim.
    fn retire(&self, id: &ContainerId) {
        let inner = &self.inner;
        let recorded = inner.registry.get_container(id).map(|c| c.snapshot().host_pid).unwrap_or(0);
        let pid = match inner.paths.get_paths(id).and_then(|p| read_pid_file(&p.pid_file())) {
            Ok(pid) => pid,
            Err(e) => {
                tracing::debug!(id = %id, error = %e, "pid file unreadable, using recorded pid");
                recorded
            }
        };
        if pid > 0 && !inner.network.unset_container_net(pid) && recorded > 0 && recorded != pid {
            let _ = inner.network.unset_container_net(recorded);
        }
        if let Some(name) = inner.paths.outdate_paths(id) {
            inner.reclaim.submit(name);
        }
    }

    /// Polls until `pid` is gone, up to the configured number of polls.
    async fn wait_exit(&self, id: &ContainerId, pid: i32) -> Result<()> {
        if pid <= 0 {
            return Ok(());
        }
        let settings = &self.inner.config.runtime;
        let interval = Duration::from_millis(settings.stop_poll_interval_ms);
        for _ in 0..settings.stop_max_wait {
            let alive = blocking(move || Ok(process_alive(pid))).await?;
            if !alive {
                return Ok(());
            }
            tokio::time::sleep(interval).await;
        }
        if blocking(move || Ok(process_alive(pid))).await? {
            return Err(FuncletError::Timeout {
                operation: "process exit",
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

/// Signal-0 probe. Anything but `ESRCH` counts as alive.
fn process_alive(pid: i32) -> bool {
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_pid_is_dead() {
        assert!(!process_alive(2_000_000_000));
        assert!(process_alive(std::process::id().try_into().unwrap()));
    }

    #[test]
    fn batch_field_is_optional() {
        let request: ResetRequest = serde_json::from_str(r#"{"container_id":"c1"}"#).unwrap();
        assert!(request.scale_down.is_none());
    }
}
