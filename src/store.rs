// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Ordered Key-Value Storage
//!
//! The relay's durable state lives in a single byte-ordered keyspace:
//! mailbox entries under `deviceId || 0x00 || be64(seqID)` and one-time keys
//! under `"otkeys/" || deviceId || 0x00 || keyId`. Higher layers depend on
//! the [`OrderedStore`] contract only: atomic durable batches, snapshot
//! range scans, and range deletion. Use `MemoryStore` for testing.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use redb::{Database, ReadableTable, TableDefinition};

const KV_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("kv");

/// Storage layer failure.
#[derive(Debug)]
pub enum StoreError {
    Redb(redb::Error),
    Decode(serde_json::Error),
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Redb(e) => write!(f, "store error: {e}"),
            StoreError::Decode(e) => write!(f, "stored value decode error: {e}"),
            StoreError::Corrupt(msg) => write!(f, "corrupt store entry: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<redb::Error> for StoreError {
    fn from(e: redb::Error) -> Self {
        StoreError::Redb(e)
    }
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        StoreError::Redb(e.into())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        StoreError::Redb(e.into())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        StoreError::Redb(e.into())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        StoreError::Redb(e.into())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        StoreError::Redb(e.into())
    }
}

/// A single operation inside an atomic write batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered list of operations applied atomically.
pub type WriteBatch = Vec<WriteOp>;

/// Trait for ordered key-value storage backends.
pub trait OrderedStore: Send + Sync {
    /// Applies every operation in the batch atomically. The batch is durable
    /// before this returns.
    fn apply(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Key-ordered snapshot read of the half-open range `[lower, upper)`.
    /// A `limit` of 0 means unbounded. The returned pairs come from one
    /// consistent view of the keyspace.
    fn scan(
        &self,
        lower: &[u8],
        upper: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Removes every key in `[lower, upper)`. Durable and idempotent.
    fn delete_range(&self, lower: &[u8], upper: &[u8]) -> Result<(), StoreError>;
}

// ============================================================================
// In-memory Storage
// ============================================================================

/// BTreeMap-backed store. State is lost on restart; intended for tests and
/// local development.
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            map: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderedStore for MemoryStore {
    fn apply(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut map = self.map.write().unwrap();
        for op in batch {
            match op {
                WriteOp::Put { key, value } => {
                    map.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan(
        &self,
        lower: &[u8],
        upper: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let map = self.map.read().unwrap();
        let take = if limit == 0 { usize::MAX } else { limit };
        Ok(map
            .range::<[u8], _>((std::ops::Bound::Included(lower), std::ops::Bound::Excluded(upper)))
            .take(take)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn delete_range(&self, lower: &[u8], upper: &[u8]) -> Result<(), StoreError> {
        let mut map = self.map.write().unwrap();
        let doomed: Vec<Vec<u8>> = map
            .range::<[u8], _>((std::ops::Bound::Included(lower), std::ops::Bound::Excluded(upper)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            map.remove(&key);
        }
        Ok(())
    }
}

// ============================================================================
// Redb Storage
// ============================================================================

/// Persistent store backed by an embedded redb database. Write transactions
/// commit with full durability, which gives `apply` its fsync guarantee.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Opens or creates the database file at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(KV_TABLE)?;
        }
        txn.commit()?;
        Ok(RedbStore { db })
    }
}

impl OrderedStore for RedbStore {
    fn apply(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(KV_TABLE)?;
            for op in batch {
                match op {
                    WriteOp::Put { key, value } => {
                        table.insert(key.as_slice(), value.as_slice())?;
                    }
                    WriteOp::Delete { key } => {
                        table.remove(key.as_slice())?;
                    }
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn scan(
        &self,
        lower: &[u8],
        upper: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(KV_TABLE)?;
        let mut out = Vec::new();
        for entry in table.range::<&[u8]>(lower..upper)? {
            let (k, v) = entry?;
            out.push((k.value().to_vec(), v.value().to_vec()));
            if limit != 0 && out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    fn delete_range(&self, lower: &[u8], upper: &[u8]) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(KV_TABLE)?;
            let doomed: Vec<Vec<u8>> = table
                .range::<&[u8]>(lower..upper)?
                .map(|entry| entry.map(|(k, _)| k.value().to_vec()))
                .collect::<Result<_, _>>()?;
            for key in doomed {
                table.remove(key.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }
}

// ============================================================================
// Storage Factory
// ============================================================================

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// In-memory storage (lost on restart, for testing/dev).
    Memory,
    /// Persistent redb storage.
    #[default]
    Redb,
}

/// Creates a store based on the backend type.
pub fn create_store(
    backend: StorageBackend,
    data_dir: Option<&Path>,
) -> Result<Box<dyn OrderedStore>, StoreError> {
    match backend {
        StorageBackend::Memory => Ok(Box::new(MemoryStore::new())),
        StorageBackend::Redb => {
            let path = data_dir
                .map(|d| d.join("relay.redb"))
                .unwrap_or_else(|| std::path::PathBuf::from("relay.redb"));

            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            Ok(Box::new(RedbStore::open(&path)?))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &[u8], value: &[u8]) -> WriteOp {
        WriteOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    /// Point read through the scan contract: `[key, key || 0x00)` holds
    /// exactly `key`.
    fn get(store: &dyn OrderedStore, key: &[u8]) -> Option<Vec<u8>> {
        let mut upper = key.to_vec();
        upper.push(0x00);
        store
            .scan(key, &upper, 1)
            .unwrap()
            .into_iter()
            .next()
            .map(|(_, value)| value)
    }

    fn test_apply_and_get_impl(store: &dyn OrderedStore) {
        store.apply(vec![put(b"k1", b"v1"), put(b"k2", b"v2")]).unwrap();

        assert_eq!(get(store, b"k1"), Some(b"v1".to_vec()));
        assert_eq!(get(store, b"k2"), Some(b"v2".to_vec()));
        assert_eq!(get(store, b"k3"), None);

        store
            .apply(vec![WriteOp::Delete { key: b"k1".to_vec() }])
            .unwrap();
        assert_eq!(get(store, b"k1"), None);
    }

    fn test_scan_order_impl(store: &dyn OrderedStore) {
        // Inserted out of order; scan must return key order.
        store
            .apply(vec![put(b"c", b"3"), put(b"a", b"1"), put(b"b", b"2")])
            .unwrap();

        let all = store.scan(b"a", b"z", 0).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].0, b"a".to_vec());
        assert_eq!(all[1].0, b"b".to_vec());
        assert_eq!(all[2].0, b"c".to_vec());
    }

    fn test_scan_bounds_and_limit_impl(store: &dyn OrderedStore) {
        store
            .apply(vec![
                put(b"a", b"1"),
                put(b"b", b"2"),
                put(b"c", b"3"),
                put(b"d", b"4"),
            ])
            .unwrap();

        // Upper bound is exclusive.
        let range = store.scan(b"b", b"d", 0).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].0, b"b".to_vec());
        assert_eq!(range[1].0, b"c".to_vec());

        let limited = store.scan(b"a", b"z", 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    fn test_prefix_isolation_impl(store: &dyn OrderedStore) {
        // Device "a" entries use separator 0x00; device "ab" keys sort after
        // "a\x01" and must not leak into "a"'s range.
        store
            .apply(vec![
                put(b"a\x00one", b"1"),
                put(b"ab\x00other", b"2"),
            ])
            .unwrap();

        let range = store.scan(b"a\x00", b"a\x01", 0).unwrap();
        assert_eq!(range.len(), 1);
        assert_eq!(range[0].1, b"1".to_vec());
    }

    fn test_delete_range_impl(store: &dyn OrderedStore) {
        store
            .apply(vec![put(b"a", b"1"), put(b"b", b"2"), put(b"c", b"3")])
            .unwrap();

        store.delete_range(b"a", b"c").unwrap();
        assert_eq!(get(store, b"a"), None);
        assert_eq!(get(store, b"b"), None);
        assert_eq!(get(store, b"c"), Some(b"3".to_vec()));

        // Deleting an already-empty range succeeds.
        store.delete_range(b"a", b"c").unwrap();
    }

    #[test]
    fn test_memory_apply_and_get() {
        test_apply_and_get_impl(&MemoryStore::new());
    }

    #[test]
    fn test_memory_scan_order() {
        test_scan_order_impl(&MemoryStore::new());
    }

    #[test]
    fn test_memory_scan_bounds_and_limit() {
        test_scan_bounds_and_limit_impl(&MemoryStore::new());
    }

    #[test]
    fn test_memory_prefix_isolation() {
        test_prefix_isolation_impl(&MemoryStore::new());
    }

    #[test]
    fn test_memory_delete_range() {
        test_delete_range_impl(&MemoryStore::new());
    }

    fn open_redb(dir: &tempfile::TempDir) -> RedbStore {
        RedbStore::open(dir.path().join("test.redb")).unwrap()
    }

    #[test]
    fn test_redb_apply_and_get() {
        let dir = tempfile::tempdir().unwrap();
        test_apply_and_get_impl(&open_redb(&dir));
    }

    #[test]
    fn test_redb_scan_order() {
        let dir = tempfile::tempdir().unwrap();
        test_scan_order_impl(&open_redb(&dir));
    }

    #[test]
    fn test_redb_scan_bounds_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        test_scan_bounds_and_limit_impl(&open_redb(&dir));
    }

    #[test]
    fn test_redb_prefix_isolation() {
        let dir = tempfile::tempdir().unwrap();
        test_prefix_isolation_impl(&open_redb(&dir));
    }

    #[test]
    fn test_redb_delete_range() {
        let dir = tempfile::tempdir().unwrap();
        test_delete_range_impl(&open_redb(&dir));
    }

    #[test]
    fn test_redb_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.redb");

        {
            let store = RedbStore::open(&path).unwrap();
            store
                .apply(vec![put(b"survives", b"restart")])
                .unwrap();
        }

        {
            let store = RedbStore::open(&path).unwrap();
            assert_eq!(get(&store, b"survives"), Some(b"restart".to_vec()));
        }
    }

    #[test]
    fn test_factory_memory() {
        let store = create_store(StorageBackend::Memory, None).unwrap();
        store.apply(vec![put(b"k", b"v")]).unwrap();
        assert_eq!(get(store.as_ref(), b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_factory_redb_creates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested").join("deeper");
        let store = create_store(StorageBackend::Redb, Some(&nested)).unwrap();
        store.apply(vec![put(b"k", b"v")]).unwrap();
        assert!(nested.join("relay.redb").exists());
    }
}
