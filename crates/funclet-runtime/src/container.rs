//! Container slot state and its event lock.

use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use funclet_common::error::{FuncletError, Result};
use funclet_common::types::{ContainerId, Event, Resource, ResourceStats};

/// Non-blocking try-lock serializing lifecycle events on one container.
///
/// The lock records which event holds it so a rejected caller learns what
/// it collided with. Acquisition never waits.
#[derive(Debug, Default)]
pub struct EventLock {
    holder: Mutex<Option<Event>>,
}

impl EventLock {
    /// Creates a released lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            holder: Mutex::new(None),
        }
    }

    /// Takes the lock for `event`, or returns the event already holding it.
    ///
    /// # Errors
    ///
    /// Returns the current holder if the lock is taken.
    pub fn try_acquire(&self, event: Event) -> std::result::Result<(), Event> {
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        match *holder {
            Some(current) => Err(current),
            None => {
                *holder = Some(event);
                Ok(())
            }
        }
    }

    /// Releases the lock. Releasing an unheld lock is a no-op.
    pub fn release(&self) {
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Event currently holding the lock.
    #[must_use]
    pub fn holder(&self) -> Option<Event> {
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Mutable part of a container slot, written only by the event-lock holder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerState {
    /// Pid of the container's init process on the host; zero when down.
    pub host_pid: i32,
    /// Last event that took the lock.
    pub current_event: Option<Event>,
    /// Whether the agent froze the container's cgroup.
    pub is_frozen: bool,
    /// Whether the container serves in stream mode.
    pub with_stream_mode: bool,
    /// Current CPU and memory grant.
    pub resource: Resource,
    /// Last usage snapshot.
    pub stats: ResourceStats,
    /// Address on the bridge, while networked.
    pub ip: Option<Ipv4Addr>,
}

/// A container slot. Created once at startup and never removed.
#[derive(Debug)]
pub struct Container {
    /// Deterministic slot ID.
    pub id: ContainerId,
    /// Slot index on this node.
    pub index: usize,
    lock: EventLock,
    state: Mutex<ContainerState>,
}

impl Container {
    /// Creates a slot with the default grant.
    #[must_use]
    pub fn new(id: ContainerId, index: usize, resource: Resource) -> Self {
        Self {
            id,
            index,
            lock: EventLock::new(),
            state: Mutex::new(ContainerState {
                resource,
                ..ContainerState::default()
            }),
        }
    }

    /// Takes the event lock for `event`.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::ContainerIsBusy` carrying both events if
    /// another event holds the lock.
    pub fn try_lock(&self, event: Event) -> Result<()> {
        self.lock
            .try_acquire(event)
            .map_err(|current| FuncletError::ContainerIsBusy {
                id: self.id.clone(),
                current,
                trigger: event,
            })?;
        self.state().current_event = Some(event);
        Ok(())
    }

    /// Releases the event lock.
    pub fn unlock(&self) {
        self.lock.release();
    }

    /// Event holding the lock, if any.
    #[must_use]
    pub fn locked_by(&self) -> Option<Event> {
        self.lock.holder()
    }

    /// Returns a copy of the mutable state.
    #[must_use]
    pub fn snapshot(&self) -> ContainerState {
        self.state().clone()
    }

    /// Applies `f` to the mutable state.
    pub fn update<T>(&self, f: impl FnOnce(&mut ContainerState) -> T) -> T {
        f(&mut self.state())
    }

    fn state(&self) -> MutexGuard<'_, ContainerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_reports_holder() {
        let lock = EventLock::new();
        assert!(lock.try_acquire(Event::Warmup).is_ok());
        assert_eq!(lock.try_acquire(Event::Reset), Err(Event::Warmup));
        lock.release();
        assert!(lock.try_acquire(Event::Reset).is_ok());
        assert_eq!(lock.holder(), Some(Event::Reset));
    }

    #[test]
    fn busy_error_names_both_events() {
        let c = Container::new(ContainerId::new("p-controller-c0"), 0, Resource::default());
        c.try_lock(Event::Init).unwrap();
        let err = c.try_lock(Event::Warmup).unwrap_err();
        match err {
            FuncletError::ContainerIsBusy {
                current, trigger, ..
            } => {
                assert_eq!(current, Event::Init);
                assert_eq!(trigger, Event::Warmup);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(c.snapshot().current_event, Some(Event::Init));
    }

    #[test]
    fn new_container_carries_default_grant() {
        let grant = Resource::new(100, 128 << 20);
        let c = Container::new(ContainerId::new("p-controller-c1"), 1, grant);
        let state = c.snapshot();
        assert_eq!(state.resource, grant);
        assert_eq!(state.host_pid, 0);
        assert!(!state.is_frozen);
    }
}
