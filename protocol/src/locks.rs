//! Per-credit mutual exclusion.
//!
//! Transitions on the same credit are serialized end to end, ledger call
//! included; transitions on different credits never contend. A credit's
//! entry lives only while someone holds or waits for it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::credit::CreditId;

#[derive(Debug, Default)]
pub struct CreditLocks {
    locks: DashMap<CreditId, Arc<Mutex<()>>>,
}

impl CreditLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `id`. The shard lock is released before
    /// awaiting so other credits stay available.
    pub async fn acquire(&self, id: CreditId) -> CreditGuard<'_> {
        let lock = self.locks.entry(id).or_default().clone();
        // Built before the wait so a cancelled waiter still cleans up.
        let mut held = CreditGuard {
            guard: None,
            locks: &self.locks,
            id,
        };
        held.guard = Some(lock.lock_owned().await);
        held
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one credit. Dropping it releases the lock and
/// removes the entry once no other task holds or waits for it.
#[derive(Debug)]
pub struct CreditGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a DashMap<CreditId, Arc<Mutex<()>>>,
    id: CreditId,
}

impl Drop for CreditGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // `entry` clones under the same shard lock, so a waiter that got in
        // first keeps the count above one.
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
