//! Asynchronous reclaim of outdated incarnations.
//!
//! Teardown happens in two stages linked by unbounded channels, so
//! lifecycle requests never wait on unmount or deletion:
//!
//! 1. The unmount stage takes an incarnation name, unmounts everything
//!    below its data tree (deepest first, each path retried a bounded
//!    number of times) and forwards the name. If any path stays mounted
//!    the name is redelivered after an exponential, capped backoff.
//! 2. The clear stage checks that every mount target is empty, then
//!    deletes the spec and data trees and releases tmp storage. A non-empty
//!    mount target means something still references the incarnation; the
//!    name is logged and dropped for manual cleanup.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use funclet_common::config::ReclaimSettings;
use funclet_common::error::{FuncletError, Result};
use funclet_core::filesystem::{MountOps, UnmountOutcome};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::paths::{ContainerPaths, PathManager};
use crate::tmp::TmpManager;

#[derive(Debug)]
struct Unload {
    name: String,
    attempt: u32,
}

/// Receivers of a pipeline whose loops have not been spawned yet.
#[derive(Debug)]
struct Pending {
    unload_rx: mpsc::UnboundedReceiver<Unload>,
    clear_tx: mpsc::UnboundedSender<String>,
    clear_rx: mpsc::UnboundedReceiver<String>,
}

/// Handle for submitting outdated incarnations.
pub struct ReclaimPipeline {
    unload_tx: mpsc::UnboundedSender<Unload>,
    pending: std::sync::Mutex<Option<Pending>>,
    paths: Arc<PathManager>,
    mounts: Arc<dyn MountOps>,
    tmp: Arc<dyn TmpManager>,
    settings: ReclaimSettings,
}

impl std::fmt::Debug for ReclaimPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReclaimPipeline")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ReclaimPipeline {
    /// Creates the channels. Nothing is processed until [`Self::spawn`].
    #[must_use]
    pub fn new(
        paths: Arc<PathManager>,
        mounts: Arc<dyn MountOps>,
        tmp: Arc<dyn TmpManager>,
        settings: ReclaimSettings,
    ) -> Self {
        let (unload_tx, unload_rx) = mpsc::unbounded_channel();
        let (clear_tx, clear_rx) = mpsc::unbounded_channel();
        Self {
            unload_tx,
            pending: std::sync::Mutex::new(Some(Pending {
                unload_rx,
                clear_tx,
                clear_rx,
            })),
            paths,
            mounts,
            tmp,
            settings,
        }
    }

    /// Queues an outdated incarnation for reclaim. Never blocks.
    pub fn submit(&self, name: String) {
        tracing::debug!(name = %name, "queued for reclaim");
        if self.unload_tx.send(Unload { name, attempt: 0 }).is_err() {
            tracing::warn!("reclaim pipeline closed, incarnation left on disk");
        }
    }

    /// Spawns the unmount and clear loops on the current runtime.
    ///
    /// The loops run until the pipeline is dropped. Calling this twice
    /// returns no handles the second time.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let Some(pending) = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        else {
            return Vec::new();
        };
        let unmounter = Unmounter {
            paths: Arc::clone(&self.paths),
            mounts: Arc::clone(&self.mounts),
            settings: self.settings.clone(),
            requeue: self.unload_tx.downgrade(),
            clear_tx: pending.clear_tx,
        };
        let clearer = Clearer {
            paths: Arc::clone(&self.paths),
            tmp: Arc::clone(&self.tmp),
        };
        vec![
            tokio::spawn(unmounter.run(pending.unload_rx)),
            tokio::spawn(clearer.run(pending.clear_rx)),
        ]
    }
}

struct Unmounter {
    paths: Arc<PathManager>,
    mounts: Arc<dyn MountOps>,
    settings: ReclaimSettings,
    requeue: mpsc::WeakUnboundedSender<Unload>,
    clear_tx: mpsc::UnboundedSender<String>,
}

impl Unmounter {
    async fn run(self, mut unload_rx: mpsc::UnboundedReceiver<Unload>) {
        tracing::debug!("unmount stage started");
        while let Some(item) = unload_rx.recv().await {
            let layout = self.paths.for_incarnation(&item.name);
            let mounts = Arc::clone(&self.mounts);
            let retries = self.settings.unmount_retries;
            let outcome = tokio::task::spawn_blocking(move || unmount_incarnation(mounts.as_ref(), &layout, retries))
                .await
                .unwrap_or_else(|e| {
                    Err(FuncletError::Mount {
                        path: item.name.clone().into(),
                        message: format!("unmount task failed: {e}"),
                    })
                });
            match outcome {
                Ok(()) => {
                    if self.clear_tx.send(item.name).is_err() {
                        tracing::warn!("clear stage closed");
                    }
                }
                Err(e) => self.redeliver(item, &e),
            }
        }
        tracing::debug!("unmount stage stopped");
    }

    fn redeliver(&self, item: Unload, error: &FuncletError) {
        let delay = backoff(&self.settings, item.attempt);
        tracing::warn!(
            name = %item.name,
            attempt = item.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "unmount incomplete, requeueing"
        );
        let requeue = self.requeue.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = requeue.upgrade() {
                let _ = tx.send(Unload {
                    name: item.name,
                    attempt: item.attempt.saturating_add(1),
                });
            }
        });
    }
}

struct Clearer {
    paths: Arc<PathManager>,
    tmp: Arc<dyn TmpManager>,
}

impl Clearer {
    async fn run(self, mut clear_rx: mpsc::UnboundedReceiver<String>) {
        tracing::debug!("clear stage started");
        while let Some(name) = clear_rx.recv().await {
            let layout = self.paths.for_incarnation(&name);
            let tmp = Arc::clone(&self.tmp);
            let result = tokio::task::spawn_blocking(move || {
                clear_incarnation(&layout)?;
                tmp.remove_tmp_storage(&layout.name)
            })
            .await;
            match result {
                Ok(Ok(())) => tracing::info!(name = %name, "incarnation reclaimed"),
                Ok(Err(e)) => tracing::error!(name = %name, error = %e, "reclaim aborted"),
                Err(e) => tracing::error!(name = %name, error = %e, "clear task failed"),
            }
        }
        tracing::debug!("clear stage stopped");
    }
}

/// Delay before redelivery `attempt`: `base * 2^attempt`, capped.
fn backoff(settings: &ReclaimSettings, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(settings.backoff_base_ms.saturating_mul(factor).min(settings.backoff_max_ms))
}

/// Unmounts every mount at or below the incarnation's data tree, deepest
/// first, trying each up to `retries` times.
///
/// # Errors
///
/// Returns the last unmount error if any path is still mounted.
pub fn unmount_incarnation(mounts: &dyn MountOps, layout: &ContainerPaths, retries: u32) -> Result<()> {
    let mut failure = None;
    for target in mounts.mounts_under(&layout.data_dir)? {
        if let Err(e) = unmount_with_retries(mounts, &target, retries) {
            failure = Some(e);
        }
    }
    failure.map_or(Ok(()), Err)
}

fn unmount_with_retries(mounts: &dyn MountOps, target: &Path, retries: u32) -> Result<()> {
    let mut last = None;
    for attempt in 1..=retries.max(1) {
        match mounts.unmount(target) {
            Ok(UnmountOutcome::Unmounted) => return Ok(()),
            Ok(UnmountOutcome::NotMounted) => {
                tracing::debug!(path = %target.display(), "already unmounted");
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(path = %target.display(), attempt, error = %e, "unmount failed");
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| FuncletError::Mount {
        path: target.to_path_buf(),
        message: "unmount not attempted".into(),
    }))
}

/// Deletes the spec and data trees of an unmounted incarnation.
///
/// # Errors
///
/// Returns `FuncletError::Mount` without deleting anything if a mount
/// target still has entries, or an I/O error if deletion fails.
pub fn clear_incarnation(layout: &ContainerPaths) -> Result<()> {
    for target in layout.mount_targets() {
        match std::fs::read_dir(&target) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return Err(FuncletError::Mount {
                        path: target,
                        message: "not empty after unmount".into(),
                    });
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(FuncletError::io(&target, e)),
        }
    }
    for tree in [&layout.spec_dir, &layout.data_dir] {
        match std::fs::remove_dir_all(tree) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(FuncletError::io(tree, e)),
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{BTreeSet, HashSet};
    use std::path::PathBuf;
    use std::sync::Mutex;

    use super::*;

    /// In-memory mount table. Paths marked busy refuse to unmount.
    #[derive(Debug, Default)]
    pub struct FakeMounts {
        pub table: Mutex<BTreeSet<PathBuf>>,
        pub busy: Mutex<HashSet<PathBuf>>,
        pub binds: Mutex<Vec<(PathBuf, PathBuf, bool)>>,
    }

    impl FakeMounts {
        pub fn mounted(&self, path: &Path) -> bool {
            self.table.lock().unwrap().contains(path)
        }
    }

    impl MountOps for FakeMounts {
        fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> Result<()> {
            let _ = self.table.lock().unwrap().insert(target.to_path_buf());
            self.binds
                .lock()
                .unwrap()
                .push((source.to_path_buf(), target.to_path_buf(), readonly));
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<UnmountOutcome> {
            if self.busy.lock().unwrap().contains(target) {
                return Err(FuncletError::Mount {
                    path: target.to_path_buf(),
                    message: "device or resource busy".into(),
                });
            }
            if self.table.lock().unwrap().remove(target) {
                Ok(UnmountOutcome::Unmounted)
            } else {
                Ok(UnmountOutcome::NotMounted)
            }
        }

        fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>> {
            let all: Vec<PathBuf> = self.table.lock().unwrap().iter().cloned().collect();
            Ok(funclet_core::filesystem::mount::filter_under(all, root))
        }

        fn make_shared(&self, path: &Path) -> Result<()> {
            let _ = self.table.lock().unwrap().insert(path.to_path_buf());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeMounts;
    use super::*;
    use crate::tmp::DirTmpManager;

    fn settings() -> ReclaimSettings {
        ReclaimSettings {
            unmount_retries: 3,
            backoff_base_ms: 10,
            backoff_max_ms: 40,
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let s = settings();
        assert_eq!(backoff(&s, 0), Duration::from_millis(10));
        assert_eq!(backoff(&s, 1), Duration::from_millis(20));
        assert_eq!(backoff(&s, 2), Duration::from_millis(40));
        assert_eq!(backoff(&s, 9), Duration::from_millis(40));
        assert_eq!(backoff(&s, 200), Duration::from_millis(40));
    }

    #[test]
    fn unmount_goes_deepest_first_and_tolerates_not_mounted() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PathManager::new(dir.path());
        let layout = manager.for_incarnation("c-1");
        let mounts = FakeMounts::default();
        mounts.make_shared(&layout.data_dir).unwrap();
        mounts.bind_mount(Path::new("/cache/abc"), &layout.code_dir(), true).unwrap();

        unmount_incarnation(&mounts, &layout, 3).unwrap();
        assert!(mounts.table.lock().unwrap().is_empty());
        // A second pass finds nothing and succeeds.
        unmount_incarnation(&mounts, &layout, 3).unwrap();
    }

    #[test]
    fn busy_mount_fails_the_pass() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PathManager::new(dir.path()).for_incarnation("c-1");
        let mounts = FakeMounts::default();
        mounts.bind_mount(Path::new("/rt"), &layout.runtime_dir(), true).unwrap();
        let _ = mounts.busy.lock().unwrap().insert(layout.runtime_dir());
        assert!(unmount_incarnation(&mounts, &layout, 3).is_err());
        assert!(mounts.mounted(&layout.runtime_dir()));
    }

    #[test]
    fn clear_refuses_non_empty_mount_target() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PathManager::new(dir.path());
        let id = "pod-controller-c0".into();
        let layout = manager.generate_paths(&id).unwrap();
        std::fs::write(layout.code_dir().join("handler.py"), b"print()").unwrap();

        let err = clear_incarnation(&layout).unwrap_err();
        assert!(matches!(err, FuncletError::Mount { .. }));
        assert!(layout.spec_dir.is_dir());
        assert!(layout.data_dir.is_dir());

        std::fs::remove_file(layout.code_dir().join("handler.py")).unwrap();
        std::fs::write(layout.workspace_dir().join("scratch"), b"x").unwrap();
        clear_incarnation(&layout).unwrap();
        assert!(!layout.spec_dir.exists());
        assert!(!layout.data_dir.exists());
    }

    #[tokio::test]
    async fn stuck_mount_is_redelivered_until_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(PathManager::new(dir.path()));
        let mounts = Arc::new(FakeMounts::default());
        let tmp = Arc::new(DirTmpManager::new(dir.path().join("tmp")));
        let id = "pod-controller-c1".into();
        let layout = manager.generate_paths(&id).unwrap();
        let _ = tmp.get_tmp_storage(&layout.name).unwrap();
        mounts.make_shared(&layout.data_dir).unwrap();
        mounts.bind_mount(Path::new("/cache/x"), &layout.code_dir(), true).unwrap();
        let _ = mounts.busy.lock().unwrap().insert(layout.code_dir());

        let pipeline = ReclaimPipeline::new(
            Arc::clone(&manager),
            Arc::clone(&mounts) as Arc<dyn MountOps>,
            Arc::clone(&tmp) as Arc<dyn TmpManager>,
            settings(),
        );
        assert_eq!(pipeline.spawn().len(), 2);
        assert!(pipeline.spawn().is_empty());
        let name = manager.outdate_paths(&id).unwrap();
        pipeline.submit(name);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(layout.data_dir.is_dir(), "removed while still mounted");
        assert!(mounts.mounted(&layout.code_dir()));

        mounts.busy.lock().unwrap().clear();
        assert!(wait_until(|| !layout.data_dir.exists() && !layout.spec_dir.exists()).await);
        assert!(mounts.table.lock().unwrap().is_empty());
        assert!(tmp.snapshot_tmp_paths().unwrap().is_empty());
    }
}
