//! Fixed-size registry of container slots.
//!
//! Every slot `0..container_num` is created at startup. Unknown IDs are a
//! hard error; slots are never created lazily and never removed.

use std::sync::Arc;

use dashmap::DashMap;
use funclet_common::error::{FuncletError, Result};
use funclet_common::types::{ContainerId, Event, Resource};

use crate::container::Container;

/// Maps container IDs to their slots.
#[derive(Debug)]
pub struct ContainerRegistry {
    containers: DashMap<ContainerId, Arc<Container>>,
    ids: Vec<ContainerId>,
}

impl ContainerRegistry {
    /// Creates `container_num` slots for `pod`, each with `default` grant.
    #[must_use]
    pub fn new(pod: &str, container_num: usize, default: Resource) -> Self {
        let containers = DashMap::with_capacity(container_num);
        let ids: Vec<ContainerId> = (0..container_num)
            .map(|index| ContainerId::for_slot(pod, index))
            .collect();
        for (index, id) in ids.iter().enumerate() {
            let _ = containers.insert(id.clone(), Arc::new(Container::new(id.clone(), index, default)));
        }
        Self { containers, ids }
    }

    /// Slot IDs in index order.
    #[must_use]
    pub fn ids(&self) -> &[ContainerId] {
        &self.ids
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns `true` if the registry has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Looks up a slot.
    ///
    /// # Errors
    ///
    /// Returns the container not-found error for unknown IDs.
    pub fn get_container(&self, id: &ContainerId) -> Result<Arc<Container>> {
        self.containers
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| FuncletError::container_not_exists(id))
    }

    /// Takes a slot's event lock for `event`.
    ///
    /// The returned guard releases the lock when dropped, so every
    /// successful lock is paired with exactly one release.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown IDs and `ContainerIsBusy` if another
    /// event holds the lock.
    pub fn lock_container(&self, id: &ContainerId, event: Event) -> Result<EventGuard> {
        let container = self.get_container(id)?;
        container.try_lock(event)?;
        tracing::debug!(id = %id, event = %event, "event lock acquired");
        Ok(EventGuard { container })
    }

    /// Releases a slot's event lock without a guard.
    ///
    /// Releasing a lock that is not held is caller error and goes
    /// undetected.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown IDs.
    pub fn unlock_container(&self, id: &ContainerId) -> Result<()> {
        self.get_container(id)?.unlock();
        Ok(())
    }

    /// All slots in index order.
    #[must_use]
    pub fn containers(&self) -> Vec<Arc<Container>> {
        self.ids
            .iter()
            .filter_map(|id| self.containers.get(id).map(|e| Arc::clone(e.value())))
            .collect()
    }
}

/// Holds a container's event lock until dropped.
#[derive(Debug)]
pub struct EventGuard {
    container: Arc<Container>,
}

impl EventGuard {
    /// The locked container.
    #[must_use]
    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }
}

impl Drop for EventGuard {
    fn drop(&mut self) {
        self.container.unlock();
        tracing::debug!(id = %self.container.id, "event lock released");
    }
}
