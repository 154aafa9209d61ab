use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::error::SupervisorError;
use crate::instance::ProcessHandle;
use crate::process_id::ProcessId;
use crate::state::ProcessState;

/// An id is either being spawned right now or owned by a started instance.
/// Reserved ids are invisible to lookups but block a second spawn.
#[derive(Debug)]
enum Entry {
    Reserved { token: u64, cancelled: bool },
    Live(Arc<ProcessHandle>),
}

/// What `claim_for_kill` found under an id.
#[derive(Debug)]
pub(crate) enum KillTarget {
    Live(Arc<ProcessHandle>),
    /// A spawn was in flight; it will kill its process as soon as it
    /// finishes.
    PendingSpawn,
    Missing,
}

/// Spawn lost its reservation to a kill or shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReservationCancelled;

/// The map lock is never held across an await, so every operation is a
/// single synchronous step and cannot be interrupted by a dropped future.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: Mutex<HashMap<ProcessId, Entry>>,
    next_token: AtomicU64,
}

/// A claim on an id held by one in-flight spawn. Dropping it without
/// [`Reservation::commit`] frees the id again.
#[derive(Debug)]
pub(crate) struct Reservation<'a> {
    registry: &'a Registry,
    id: ProcessId,
    token: u64,
    settled: bool,
}

impl Reservation<'_> {
    /// Publishes a started instance under this reservation.
    pub fn commit(mut self, handle: Arc<ProcessHandle>) -> Result<(), ReservationCancelled> {
        self.settled = true;
        let mut entries = self.registry.lock();
        match entries.get(&self.id) {
            Some(&Entry::Reserved { token, cancelled }) if token == self.token => {
                if cancelled {
                    entries.remove(&self.id);
                    Err(ReservationCancelled)
                } else {
                    entries.insert(self.id.clone(), Entry::Live(handle));
                    Ok(())
                }
            }
            // Drained by shutdown, possibly re-reserved since.
            _ => Err(ReservationCancelled),
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut entries = self.registry.lock();
        if matches!(entries.get(&self.id), Some(&Entry::Reserved { token, .. }) if token == self.token)
        {
            entries.remove(&self.id);
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProcessId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims `id` for a spawn. A stopped or errored instance under the same
    /// id is dropped to make room.
    pub fn reserve(&self, id: &ProcessId) -> Result<Reservation<'_>, SupervisorError> {
        let mut entries = self.lock();
        match entries.get(id) {
            Some(Entry::Reserved { .. }) => return Err(SupervisorError::already_running(id)),
            Some(Entry::Live(handle)) if handle.status().is_live() => {
                return Err(SupervisorError::already_running(id));
            }
            _ => {}
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            id.clone(),
            Entry::Reserved {
                token,
                cancelled: false,
            },
        );
        Ok(Reservation {
            registry: self,
            id: id.clone(),
            token,
            settled: false,
        })
    }

    pub fn lookup(&self, id: &ProcessId) -> Result<Arc<ProcessHandle>, SupervisorError> {
        match self.lock().get(id) {
            Some(Entry::Live(handle)) => Ok(Arc::clone(handle)),
            _ => Err(SupervisorError::not_found(id)),
        }
    }

    /// Resolves a kill target in one step so a spawn committing concurrently
    /// is either seen live or told to abort.
    pub fn claim_for_kill(&self, id: &ProcessId) -> KillTarget {
        let mut entries = self.lock();
        match entries.get_mut(id) {
            Some(Entry::Live(handle)) => KillTarget::Live(Arc::clone(handle)),
            Some(Entry::Reserved { cancelled, .. }) => {
                *cancelled = true;
                KillTarget::PendingSpawn
            }
            None => KillTarget::Missing,
        }
    }

    /// Removes `id` only if it still maps to `handle`. A concurrent respawn
    /// under the same id is left alone.
    pub fn remove_if_same(&self, id: &ProcessId, handle: &Arc<ProcessHandle>) -> bool {
        let mut entries = self.lock();
        let same = matches!(entries.get(id), Some(Entry::Live(current)) if Arc::ptr_eq(current, handle));
        if same {
            entries.remove(id);
        }
        same
    }

    /// States of every started instance, sorted by id. The lock is held only
    /// while the handles are collected.
    pub fn snapshot_all(&self) -> Vec<ProcessState> {
        let handles: Vec<Arc<ProcessHandle>> = self
            .lock()
            .values()
            .filter_map(|entry| match entry {
                Entry::Live(handle) => Some(Arc::clone(handle)),
                Entry::Reserved { .. } => None,
            })
            .collect();
        let mut states: Vec<ProcessState> = handles.iter().map(|handle| handle.state()).collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    /// Empties the registry. In-flight spawns will find their reservation
    /// gone and kill what they started.
    pub fn drain(&self) -> Vec<Arc<ProcessHandle>> {
        self.lock()
            .drain()
            .filter_map(|(_, entry)| match entry {
                Entry::Live(handle) => Some(handle),
                Entry::Reserved { .. } => None,
            })
            .collect()
    }
}
