// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Sequenced Per-device Mailboxes
//!
//! Every accepted batch gets one seqID, and each element is persisted under
//! `recipient || 0x00 || be64(seqID)`, big-endian so byte-lexicographic
//! key order equals numeric seqID order. All writes touching a recipient are
//! serialised by that recipient's mutex, which is what makes the per-recipient
//! FIFO guarantee hold; the batch commits atomically and durably before the
//! locks are released.
//!
//! Reads are snapshot scans of the caller's range and never hold locks.

use std::sync::Arc;

use tracing::debug;

use crate::locks::DeviceLocks;
use crate::protocol::{IncomingMessage, OutgoingMessage};
use crate::sequence::SequenceAllocator;
use crate::store::{OrderedStore, StoreError, WriteOp};

/// A freshly persisted message together with its recipient, handed to the
/// caller for live fan-out.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub to: String,
    pub outgoing: OutgoingMessage,
}

/// The message plane: writer, reader, and truncator over one shared store.
pub struct Mailbox {
    store: Arc<dyn OrderedStore>,
    locks: DeviceLocks,
    seq: SequenceAllocator,
}

/// Mailbox entry key: `device_id || 0x00 || be64(seq_id)`.
pub fn message_key(device_id: &str, seq_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(device_id.len() + 9);
    key.extend_from_slice(device_id.as_bytes());
    key.push(0x00);
    key.extend_from_slice(&seq_id.to_be_bytes());
    key
}

/// Half-open key range `[device||0x00, device||0x01)` covering one device's
/// whole mailbox.
pub fn mailbox_range(device_id: &str) -> (Vec<u8>, Vec<u8>) {
    let mut lower = Vec::with_capacity(device_id.len() + 1);
    lower.extend_from_slice(device_id.as_bytes());
    lower.push(0x00);

    let mut upper = Vec::with_capacity(device_id.len() + 1);
    upper.extend_from_slice(device_id.as_bytes());
    upper.push(0x01);

    (lower, upper)
}

impl Mailbox {
    /// Opens the mailbox over a store, recovering the sequence counter by
    /// scanning for the highest persisted seqID.
    pub fn open(store: Arc<dyn OrderedStore>) -> Result<Self, StoreError> {
        let seq = SequenceAllocator::recover(store.as_ref())?;
        Ok(Mailbox {
            store,
            locks: DeviceLocks::new(),
            seq,
        })
    }

    /// Persists a batch from `sender`, one shared seqID for every element.
    ///
    /// Recipient locks are acquired in sorted order, held across the durable
    /// commit, and released before this returns; fan-out is the caller's job
    /// and must never happen under these locks.
    pub async fn post(
        &self,
        sender: &str,
        batch: &[IncomingMessage],
    ) -> Result<Vec<Delivery>, StoreError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let guards = self
            .locks
            .acquire_all(batch.iter().map(|m| m.device_id.as_str()))
            .await;

        let seq_id = self.seq.next();

        let mut write = Vec::with_capacity(batch.len());
        let mut deliveries = Vec::with_capacity(batch.len());
        for msg in batch {
            let outgoing = OutgoingMessage {
                sender: sender.to_string(),
                payload: msg.payload.clone(),
                seq_id,
            };
            write.push(WriteOp::Put {
                key: message_key(&msg.device_id, seq_id),
                value: serde_json::to_vec(&outgoing).map_err(StoreError::Decode)?,
            });
            deliveries.push(Delivery {
                to: msg.device_id.clone(),
                outgoing,
            });
        }

        self.store.apply(write)?;
        drop(guards);

        debug!(sender, seq_id, count = batch.len(), "batch persisted");
        Ok(deliveries)
    }

    /// Snapshot read of every undelivered message for `device_id`, in seqID
    /// order.
    pub fn fetch(&self, device_id: &str) -> Result<Vec<OutgoingMessage>, StoreError> {
        let (lower, upper) = mailbox_range(device_id);
        let mut messages = Vec::new();
        for (_key, value) in self.store.scan(&lower, &upper, 0)? {
            messages.push(serde_json::from_slice(&value).map_err(StoreError::Decode)?);
        }
        Ok(messages)
    }

    /// Deletes every message for `device_id` up to and including `seq_id`.
    /// Idempotent; a seqID beyond anything present clears the whole mailbox.
    pub fn truncate(&self, device_id: &str, seq_id: u64) -> Result<(), StoreError> {
        let (lower, range_end) = mailbox_range(device_id);
        let upper = match seq_id.checked_add(1) {
            Some(next) => message_key(device_id, next),
            None => range_end,
        };
        self.store.delete_range(&lower, &upper)?;
        debug!(device_id, seq_id, "mailbox truncated");
        Ok(())
    }
}
