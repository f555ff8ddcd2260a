// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-device Lock Table
//!
//! Writes to any one device's mailbox are serialised by that device's mutex.
//! A multi-recipient batch acquires the whole recipient set in sorted order,
//! which together with the rule that no holder ever acquires a second set
//! makes the protocol deadlock-free.
//!
//! Mutex creation is lazy and entries are never removed for the lifetime of
//! the process.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Dynamic mapping from device id to its mutex.
pub struct DeviceLocks {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

/// Guards for an acquired set of device mutexes. Dropping releases them in
/// reverse acquisition order.
pub struct LockSet {
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for LockSet {
    fn drop(&mut self) {
        while self.guards.pop().is_some() {}
    }
}

impl DeviceLocks {
    pub fn new() -> Self {
        DeviceLocks {
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the mutex for a device, creating it on first use.
    fn lock_for(&self, device_id: &str) -> Arc<Mutex<()>> {
        if let Some(mutex) = self.locks.read().unwrap().get(device_id) {
            return mutex.clone();
        }

        // Another writer may have inserted the entry between releasing the
        // read lock and acquiring the write lock; the entry API re-checks.
        let mut locks = self.locks.write().unwrap();
        locks
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Locks one device's mutex.
    pub async fn acquire(&self, device_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(device_id).lock_owned().await
    }

    /// Locks every listed device's mutex. Duplicates are collapsed and the
    /// set is acquired in lexicographic order.
    pub async fn acquire_all<'a, I>(&self, ids: I) -> LockSet
    where
        I: IntoIterator<Item = &'a str>,
    {
        let sorted: BTreeSet<&str> = ids.into_iter().collect();
        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            guards.push(self.lock_for(id).lock_owned().await);
        }
        LockSet { guards }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.locks.read().unwrap().len()
    }
}

impl Default for DeviceLocks {
    fn default() -> Self {
        Self::new()
    }
}
