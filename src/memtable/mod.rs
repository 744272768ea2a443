//! In-memory ordered tables backing the active WAL segment.
//!
//! [`MemTable`] is a single ordered `seq -> (time, payload)` map.
//! [`MemTableManager`] owns the active memtable plus a queue of frozen
//! ("immutable") memtables awaiting flush, and arbitrates rotation
//! between them under a single reader-writer lock.

use std::collections::BTreeMap;
use std::sync::RwLock;

use thiserror::Error;
use tracing::{debug, info};

/// Errors produced by memtable operations.
///
/// Kept as an enum (rather than a bare `Result<_, Infallible>`) for
/// call-site consistency with the rest of the crate's error handling,
/// even though no variant is currently constructible from within this
/// module — memtable operations are pure in-memory bookkeeping.
#[derive(Debug, Error)]
pub enum MemTableError {
    /// A lock guarding shared memtable state was poisoned by a panic
    /// in another thread.
    #[error("memtable lock poisoned")]
    LockPoisoned,
}

/// One record held in a [`MemTable`], as stored in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Insertion timestamp, opaque to this layer.
    pub time: u64,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

/// An ordered, append-only, in-memory table keyed by `seq`.
///
/// Entries are never updated or removed individually; the table is
/// either actively accepting `put`s or frozen and read-only while
/// awaiting flush.
#[derive(Debug, Default)]
pub struct MemTable {
    entries: BTreeMap<u64, Entry>,
    /// Running total of key + value bytes, used for rotation sizing.
    size_bytes: usize,
}

impl MemTable {
    /// Creates an empty memtable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record. Callers must supply strictly increasing
    /// `seq` values; this is enforced by the caller (the engine's
    /// write-mutex critical section), not re-validated here.
    pub fn put(&mut self, seq: u64, time: u64, payload: Vec<u8>) {
        self.size_bytes += std::mem::size_of::<u64>() + std::mem::size_of::<u64>() + payload.len();
        self.entries.insert(seq, Entry { time, payload });
    }

    /// Looks up a record by `seq`.
    pub fn get(&self, seq: u64) -> Option<&Entry> {
        self.entries.get(&seq)
    }

    /// Iterates entries in ascending `seq` order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Entry)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    /// Number of records held.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Approximate size in bytes of all keys and values held.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Removes all entries, for reuse after a successful flush.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.size_bytes = 0;
    }

    /// Largest `seq` currently held, if any.
    pub fn max_seq(&self) -> Option<u64> {
        self.entries.keys().next_back().copied()
    }
}

/// A frozen memtable paired with the WAL segment number it was backed
/// by, handed to the flush worker.
#[derive(Debug)]
pub struct FrozenMemTable {
    pub memtable: MemTable,
    pub wal_number: u64,
}

struct ManagerInner {
    active: MemTable,
    active_wal_number: u64,
    immutables: Vec<FrozenMemTable>,
}

/// Owns the active memtable and a queue of immutable memtables
/// awaiting flush, behind a single reader-writer lock.
///
/// `put` and `rotate` take the write lock; `get` and stats-style
/// queries take the read lock, per §4.3.
pub struct MemTableManager {
    inner: RwLock<ManagerInner>,
    max_bytes: usize,
}

impl MemTableManager {
    /// Creates a manager with an empty active memtable backed by
    /// `initial_wal_number`, rotating once `max_bytes` is reached.
    pub fn new(initial_wal_number: u64, max_bytes: usize) -> Self {
        Self {
            inner: RwLock::new(ManagerInner {
                active: MemTable::new(),
                active_wal_number: initial_wal_number,
                immutables: Vec::new(),
            }),
            max_bytes,
        }
    }

    /// Inserts a record into the active memtable.
    ///
    /// Callers are expected to have already appended the record to
    /// the active WAL segment before calling this, per the write-path
    /// ordering in §5.
    pub fn put(&self, seq: u64, time: u64, payload: Vec<u8>) -> Result<(), MemTableError> {
        let mut guard = self.inner.write().map_err(|_| MemTableError::LockPoisoned)?;
        guard.active.put(seq, time, payload);
        Ok(())
    }

    /// Looks up a record, searching the active memtable first, then
    /// immutables from newest to oldest.
    pub fn get(&self, seq: u64) -> Result<Option<Entry>, MemTableError> {
        let guard = self.inner.read().map_err(|_| MemTableError::LockPoisoned)?;
        if let Some(entry) = guard.active.get(seq) {
            return Ok(Some(entry.clone()));
        }
        for frozen in guard.immutables.iter().rev() {
            if let Some(entry) = frozen.memtable.get(seq) {
                return Ok(Some(entry.clone()));
            }
        }
        Ok(None)
    }

    /// True once the active memtable has reached the rotation
    /// threshold.
    pub fn should_rotate(&self) -> Result<bool, MemTableError> {
        let guard = self.inner.read().map_err(|_| MemTableError::LockPoisoned)?;
        Ok(guard.active.size_bytes() >= self.max_bytes)
    }

    /// Number of immutable memtables currently queued for flush.
    pub fn immutable_count(&self) -> Result<usize, MemTableError> {
        let guard = self.inner.read().map_err(|_| MemTableError::LockPoisoned)?;
        Ok(guard.immutables.len())
    }

    /// Approximate size in bytes of the active memtable.
    pub fn active_size_bytes(&self) -> Result<usize, MemTableError> {
        let guard = self.inner.read().map_err(|_| MemTableError::LockPoisoned)?;
        Ok(guard.active.size_bytes())
    }

    /// Total record count across the active memtable and all
    /// immutables — used by crash-recovery stats (§8, S4).
    pub fn total_count(&self) -> Result<usize, MemTableError> {
        let guard = self.inner.read().map_err(|_| MemTableError::LockPoisoned)?;
        let mut total = guard.active.count();
        for frozen in &guard.immutables {
            total += frozen.memtable.count();
        }
        Ok(total)
    }

    /// Freezes the active memtable, installs a fresh one backed by
    /// `new_wal_number`, and returns the old WAL number for the
    /// caller to close out.
    pub fn rotate(&self, new_wal_number: u64) -> Result<u64, MemTableError> {
        let mut guard = self.inner.write().map_err(|_| MemTableError::LockPoisoned)?;
        let old_wal_number = guard.active_wal_number;
        let frozen = FrozenMemTable {
            memtable: std::mem::take(&mut guard.active),
            wal_number: old_wal_number,
        };
        info!(
            old_wal_number,
            new_wal_number,
            records = frozen.memtable.count(),
            "rotated active memtable"
        );
        guard.immutables.push(frozen);
        guard.active_wal_number = new_wal_number;
        Ok(old_wal_number)
    }

    /// Returns the oldest immutable memtable without removing it, for
    /// the flush worker to read from.
    pub fn oldest_immutable_wal_number(&self) -> Result<Option<u64>, MemTableError> {
        let guard = self.inner.read().map_err(|_| MemTableError::LockPoisoned)?;
        Ok(guard.immutables.first().map(|f| f.wal_number))
    }

    /// Hands a clone of the oldest immutable memtable's entries to the
    /// flush worker without removing it from the queue; removal
    /// happens only once the flush has durably committed, via
    /// [`MemTableManager::drop_immutable`].
    pub fn snapshot_oldest_immutable(&self) -> Result<Option<(u64, Vec<(u64, Entry)>)>, MemTableError> {
        let guard = self.inner.read().map_err(|_| MemTableError::LockPoisoned)?;
        Ok(guard.immutables.first().map(|f| {
            let entries = f.memtable.iter().map(|(seq, e)| (seq, e.clone())).collect();
            (f.wal_number, entries)
        }))
    }

    /// Removes the immutable memtable backed by `wal_number` after
    /// its flush has committed.
    pub fn drop_immutable(&self, wal_number: u64) -> Result<(), MemTableError> {
        let mut guard = self.inner.write().map_err(|_| MemTableError::LockPoisoned)?;
        guard.immutables.retain(|f| f.wal_number != wal_number);
        debug!(wal_number, "dropped flushed immutable memtable");
        Ok(())
    }

    /// Largest `seq` across the active memtable and all immutables.
    pub fn max_seq(&self) -> Result<Option<u64>, MemTableError> {
        let guard = self.inner.read().map_err(|_| MemTableError::LockPoisoned)?;
        let mut max = guard.active.max_seq();
        for frozen in &guard.immutables {
            max = match (max, frozen.memtable.max_seq()) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, None) => a,
                (None, b) => b,
            };
        }
        Ok(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_get_round_trip() {
        let mut table = MemTable::new();
        table.put(1, 100, b"a".to_vec());
        table.put(2, 101, b"bb".to_vec());
        assert_eq!(table.get(1).unwrap().payload, b"a");
        assert_eq!(table.get(2).unwrap().payload, b"bb");
        assert!(table.get(3).is_none());
        assert_eq!(table.count(), 2);
    }

    #[test]
    fn iteration_is_key_ordered() {
        let mut table = MemTable::new();
        for seq in [5u64, 1, 3, 2, 4] {
            table.put(seq, seq, vec![]);
        }
        let keys: Vec<u64> = table.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn manager_routes_get_through_active_then_immutables() {
        let mgr = MemTableManager::new(1, 1024);
        mgr.put(1, 10, b"first".to_vec()).unwrap();
        mgr.rotate(2).unwrap();
        mgr.put(2, 20, b"second".to_vec()).unwrap();

        assert_eq!(mgr.get(1).unwrap().unwrap().payload, b"first");
        assert_eq!(mgr.get(2).unwrap().unwrap().payload, b"second");
        assert!(mgr.get(3).unwrap().is_none());
        assert_eq!(mgr.immutable_count().unwrap(), 1);
    }

    #[test]
    fn should_rotate_reflects_size_threshold() {
        let mgr = MemTableManager::new(1, 16);
        assert!(!mgr.should_rotate().unwrap());
        mgr.put(1, 1, vec![0u8; 32]).unwrap();
        assert!(mgr.should_rotate().unwrap());
    }

    #[test]
    fn drop_immutable_removes_flushed_table() {
        let mgr = MemTableManager::new(1, 1024);
        mgr.put(1, 1, b"x".to_vec()).unwrap();
        mgr.rotate(2).unwrap();
        assert_eq!(mgr.immutable_count().unwrap(), 1);
        mgr.drop_immutable(1).unwrap();
        assert_eq!(mgr.immutable_count().unwrap(), 0);
    }
}
