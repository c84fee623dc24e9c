//! Named, host-wide exclusive locks.
//!
//! The election uses two of them: the instance lock ("first process ever")
//! and the arbiter lock ("replacement after a hub failure"). Both come from a
//! [`LockProvider`], an injected capability with three operations:
//!
//! - **acquire**: [`LockProvider::try_acquire`], non-blocking, owner or contended
//! - **release**: dropping or explicitly releasing the [`LockGuard`]
//! - **forced release**: the holder dies without releasing; the next
//!   acquisition succeeds and reports [`LockGuard::reclaimed_from`]
//!
//! [`FileLockProvider`] backs this with OS file locks, which the kernel drops
//! when a process dies. [`MemoryLockProvider`] simulates the same contract in
//! one process so crash scenarios are deterministic in tests.

pub mod file;
pub mod memory;

pub use file::FileLockProvider;
pub use memory::MemoryLockProvider;

use crate::Result;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Source of named exclusive locks.
pub trait LockProvider: Send + Sync + fmt::Debug {
    /// Try to take `name` right now. Never blocks, never polls.
    fn try_acquire(&self, name: &str) -> Result<Acquisition>;
}

/// A lock as held by its owner. Released through [`LockGuard`].
pub trait HeldLock: Send + fmt::Debug {
    fn release(&mut self) -> Result<()>;
}

/// Outcome of an acquisition attempt.
#[derive(Debug)]
pub enum Acquisition {
    Owner(LockGuard),
    Contended,
}

impl Acquisition {
    pub fn is_owner(&self) -> bool {
        matches!(self, Acquisition::Owner(_))
    }

    pub fn into_guard(self) -> Option<LockGuard> {
        match self {
            Acquisition::Owner(guard) => Some(guard),
            Acquisition::Contended => None,
        }
    }
}

/// Ownership of a named lock. Dropping releases it.
#[derive(Debug)]
pub struct LockGuard {
    name: String,
    reclaimed_from: Option<String>,
    held: Option<Box<dyn HeldLock>>,
}

impl LockGuard {
    pub fn new(
        name: impl Into<String>,
        held: Box<dyn HeldLock>,
        reclaimed_from: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            reclaimed_from,
            held: Some(held),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Previous holder that died without releasing, if any.
    pub fn reclaimed_from(&self) -> Option<&str> {
        self.reclaimed_from.as_deref()
    }

    /// Release explicitly, surfacing any error.
    pub fn release(mut self) -> Result<()> {
        match self.held.take() {
            Some(mut held) => held.release(),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(mut held) = self.held.take() {
            if let Err(e) = held.release() {
                tracing::warn!("Failed to release lock {}: {}", self.name, e);
            }
        }
    }
}

/// Named-lock front door used by the election.
#[derive(Debug, Clone)]
pub struct InstanceGuard {
    provider: Arc<dyn LockProvider>,
}

impl InstanceGuard {
    pub fn new(provider: Arc<dyn LockProvider>) -> Self {
        Self { provider }
    }

    /// Attempt a non-blocking, instantaneous acquisition of `name`.
    ///
    /// A lock abandoned by a crashed holder counts as ordinary ownership.
    pub fn acquire_exclusive(&self, name: &str) -> Result<Acquisition> {
        let acquisition = self.provider.try_acquire(name)?;
        match &acquisition {
            Acquisition::Owner(guard) => match guard.reclaimed_from() {
                Some(previous) => info!(
                    "Acquired lock {} (reclaimed from abandoned holder {})",
                    name, previous
                ),
                None => debug!("Acquired lock {}", name),
            },
            Acquisition::Contended => debug!("Lock {} is held elsewhere", name),
        }
        Ok(acquisition)
    }
}
