//! In-process lock provider for tests and embedded use.
//!
//! All processes sharing one `MemoryLockProvider` behave as if they were on
//! the same host. [`MemoryLockProvider::force_release`] plays the role of the
//! OS reclaiming a lock from a crashed holder: the lock becomes free, the old
//! guard turns into a no-op, and the next owner sees `reclaimed_from`.

use super::{Acquisition, HeldLock, LockGuard, LockProvider};
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Slot {
    holder: Option<u64>,
    abandoned_by: Option<u64>,
}

#[derive(Debug, Default)]
struct State {
    slots: HashMap<String, Slot>,
    next_holder: u64,
}

/// Shared-memory lock provider.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockProvider {
    state: Arc<Mutex<State>>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether anyone currently owns `name`.
    pub fn is_held(&self, name: &str) -> bool {
        self.lock_state()
            .slots
            .get(name)
            .is_some_and(|slot| slot.holder.is_some())
    }

    /// Simulate the holder of `name` dying without releasing.
    ///
    /// Returns false if nobody held it.
    pub fn force_release(&self, name: &str) -> bool {
        let mut state = self.lock_state();
        match state.slots.get_mut(name) {
            Some(slot) => match slot.holder.take() {
                Some(holder) => {
                    slot.abandoned_by = Some(holder);
                    true
                }
                None => false,
            },
            None => false,
        }
    }
}

impl LockProvider for MemoryLockProvider {
    fn try_acquire(&self, name: &str) -> Result<Acquisition> {
        let mut state = self.lock_state();
        state.next_holder += 1;
        let holder = state.next_holder;

        let slot = state.slots.entry(name.to_string()).or_default();
        if slot.holder.is_some() {
            return Ok(Acquisition::Contended);
        }
        slot.holder = Some(holder);
        let reclaimed_from = slot
            .abandoned_by
            .take()
            .map(|previous| format!("holder #{}", previous));

        Ok(Acquisition::Owner(LockGuard::new(
            name,
            Box::new(MemoryLock {
                state: self.state.clone(),
                name: name.to_string(),
                holder,
            }),
            reclaimed_from,
        )))
    }
}

#[derive(Debug)]
struct MemoryLock {
    state: Arc<Mutex<State>>,
    name: String,
    holder: u64,
}

impl HeldLock for MemoryLock {
    fn release(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(slot) = state.slots.get_mut(&self.name) {
            // A forced release already handed the lock on; don't free the new owner's.
            if slot.holder == Some(self.holder) {
                slot.holder = None;
            }
        }
        Ok(())
    }
}
