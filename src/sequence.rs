//! Sequence Allocator
//!
//! One process-wide monotonic counter stamps every accepted batch. Nothing
//! about the counter is persisted directly: concurrent writers to disjoint
//! recipients commit in arrival order, not allocation order, so no single
//! watermark written alongside a batch can be trusted to be the maximum.
//! Instead, startup scans the mailbox keyspace for the highest seqID still
//! present and resumes strictly above it.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::store::{OrderedStore, StoreError};

const OTKEYS_LOWER: &[u8] = b"otkeys/";
const OTKEYS_UPPER: &[u8] = b"otkeys0";
const KEYSPACE_END: &[u8] = &[0xff];

/// Process-wide monotonic seqID source.
pub struct SequenceAllocator {
    last: AtomicU64,
}

impl SequenceAllocator {
    /// Scans the mailbox keyspace maxima and resumes strictly above them.
    ///
    /// Mailbox entries are `device || 0x00 || be64(seqID)`; device ids are
    /// UTF-8, so no mailbox key starts with 0xFF. The one-time key range is
    /// skipped wholesale, and anything not shaped like a mailbox entry is
    /// ignored.
    pub fn recover(store: &dyn OrderedStore) -> Result<Self, StoreError> {
        let mut last = 0u64;
        for (lower, upper) in [(&b""[..], OTKEYS_LOWER), (OTKEYS_UPPER, KEYSPACE_END)] {
            for (key, _value) in store.scan(lower, upper, 0)? {
                if key.len() >= 9 && key[key.len() - 9] == 0 {
                    let mut seq_bytes = [0u8; 8];
                    seq_bytes.copy_from_slice(&key[key.len() - 8..]);
                    last = last.max(u64::from_be_bytes(seq_bytes));
                }
            }
        }
        Ok(SequenceAllocator {
            last: AtomicU64::new(last),
        })
    }

    /// Returns the next seqID. Strictly monotonic, wait-free.
    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }
}
