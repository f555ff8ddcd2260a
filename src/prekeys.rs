// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! One-time Key Storage
//!
//! Devices pre-publish opaque keyId → publicKey pairs under
//! `"otkeys/" || owner || 0x00 || keyId` so offline peers can bootstrap
//! sessions. A peer lookup pops the first key in iteration order; pops for
//! the same owner are serialised by a per-device mutex so two concurrent
//! lookups never serve the same key. When a pop leaves the pool below the
//! low-water mark the caller is told to signal the owner for a restock.

use std::collections::HashMap;
use std::sync::Arc;

use crate::locks::DeviceLocks;
use crate::store::{OrderedStore, StoreError, WriteOp};

/// Pool size below which the owner is asked to publish more keys.
pub const LOW_WATER: usize = 10;

/// Suggested restock size carried in the replenishment signal.
pub const RESTOCK: u32 = 20;

const PREFIX: &[u8] = b"otkeys/";

/// Result of a pop attempt.
#[derive(Debug)]
pub struct FetchOutcome {
    /// The served public key, or None when the pool is empty.
    pub otkey: Option<String>,
    /// True when the post-pop pool is below [`LOW_WATER`].
    pub low: bool,
}

pub struct PrekeyStore {
    store: Arc<dyn OrderedStore>,
    fetch_locks: DeviceLocks,
}

fn otkey_key(owner: &str, key_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(PREFIX.len() + owner.len() + 1 + key_id.len());
    key.extend_from_slice(PREFIX);
    key.extend_from_slice(owner.as_bytes());
    key.push(0x00);
    key.extend_from_slice(key_id.as_bytes());
    key
}

fn otkey_range(owner: &str) -> (Vec<u8>, Vec<u8>) {
    let mut lower = Vec::with_capacity(PREFIX.len() + owner.len() + 1);
    lower.extend_from_slice(PREFIX);
    lower.extend_from_slice(owner.as_bytes());
    lower.push(0x00);

    let mut upper = Vec::with_capacity(PREFIX.len() + owner.len() + 1);
    upper.extend_from_slice(PREFIX);
    upper.extend_from_slice(owner.as_bytes());
    upper.push(0x01);

    (lower, upper)
}

impl PrekeyStore {
    pub fn new(store: Arc<dyn OrderedStore>) -> Self {
        PrekeyStore {
            store,
            fetch_locks: DeviceLocks::new(),
        }
    }

    /// Durably inserts a mapping of keyId → publicKey for `owner`. KeyIds
    /// within a device are unique; re-adding an id overwrites it.
    pub fn add(&self, owner: &str, keys: &HashMap<String, String>) -> Result<(), StoreError> {
        let mut batch = Vec::with_capacity(keys.len());
        for (key_id, public_key) in keys {
            batch.push(WriteOp::Put {
                key: otkey_key(owner, key_id),
                value: public_key.as_bytes().to_vec(),
            });
        }
        self.store.apply(batch)
    }

    /// Pops the first key in iteration order for `owner`.
    ///
    /// One bounded scan yields both the popped entry and the post-pop count
    /// from the same snapshot; the per-device lock keeps concurrent pops off
    /// that snapshot.
    pub async fn fetch(&self, owner: &str) -> Result<FetchOutcome, StoreError> {
        let _guard = self.fetch_locks.acquire(owner).await;

        let (lower, upper) = otkey_range(owner);
        let entries = self.store.scan(&lower, &upper, LOW_WATER + 1)?;

        match entries.first() {
            None => Ok(FetchOutcome {
                otkey: None,
                low: true,
            }),
            Some((key, value)) => {
                self.store
                    .apply(vec![WriteOp::Delete { key: key.clone() }])?;
                let remaining = entries.len() - 1;
                Ok(FetchOutcome {
                    otkey: Some(String::from_utf8_lossy(value).into_owned()),
                    low: remaining < LOW_WATER,
                })
            }
        }
    }

    /// Whether `owner`'s pool is currently below the low-water mark. Used by
    /// the dispatcher when a device joins the event stream.
    pub fn is_low(&self, owner: &str) -> Result<bool, StoreError> {
        let (lower, upper) = otkey_range(owner);
        Ok(self.store.scan(&lower, &upper, LOW_WATER)?.len() < LOW_WATER)
    }
}
