use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Arc, RwLock};

/// Number of buckets in the hash table.
pub const TABLE_SIZE: usize = 26;

/// Sentinel emitted by `READ` for a key that is not present.
pub const KVS_ERROR: &str = "KVSERROR";
/// Sentinel emitted by `DELETE` for a key that could not be removed.
pub const KVS_MISSING: &str = "KVSMISSING";

/// Maps a key to its bucket by a stable pure function of its bytes.
fn bucket_of(key: &str) -> usize {
    key.bytes()
        .fold(0usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize))
        % TABLE_SIZE
}

/// A sharded, in-memory key-value store.
///
/// The table has a fixed number of buckets, each behind its own
/// read/write lock, plus one coarse lock over the whole table.
/// Single-key operations take the coarse lock in read mode and then the
/// bucket lock, so they proceed in parallel on different buckets;
/// batch deletion and full-table iteration take the coarse lock in
/// write mode to exclude every mutator at once.
///
/// Cloning is cheap: all clones share the same table via `Arc`.
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<Table>,
}

struct Table {
    buckets: Vec<RwLock<BTreeMap<String, String>>>,
    /// Coarse table lock. Read-held by single-key operations and by
    /// snapshots; write-held by `delete` and `show`. Holding it in
    /// write mode makes every bucket lock uncontended, since all other
    /// bucket-lock holders enter through the read side first.
    table_lock: RwLock<()>,
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    /// Creates an empty store with `TABLE_SIZE` buckets.
    pub fn new() -> Self {
        let buckets = (0..TABLE_SIZE)
            .map(|_| RwLock::new(BTreeMap::new()))
            .collect();
        Self {
            inner: Arc::new(Table {
                buckets,
                table_lock: RwLock::new(()),
            }),
        }
    }

    /// Inserts or overwrites each pair in order.
    ///
    /// Concurrent writes to the same key serialize on the bucket lock,
    /// so the last writer wins and a reader never observes a torn
    /// value. Change events are published by the caller after this
    /// returns, once every lock is released.
    pub fn write_pairs(&self, pairs: &[(String, String)]) {
        for (key, value) in pairs {
            let _table = self.inner.table_lock.read().unwrap();
            let mut bucket = self.inner.buckets[bucket_of(key)].write().unwrap();
            bucket.insert(key.clone(), value.clone());
        }
    }

    /// Looks up each key, sorted lexicographically first so that the
    /// result ordering is a pure function of the requested key set.
    ///
    /// Missing keys yield `None`.
    pub fn read_keys(&self, keys: &[String]) -> Vec<(String, Option<String>)> {
        let mut sorted: Vec<String> = keys.to_vec();
        sorted.sort();
        sorted
            .into_iter()
            .map(|key| {
                let _table = self.inner.table_lock.read().unwrap();
                let bucket = self.inner.buckets[bucket_of(&key)].read().unwrap();
                let value = bucket.get(&key).cloned();
                (key, value)
            })
            .collect()
    }

    /// Removes each key under the coarse write lock.
    ///
    /// Returns the keys actually removed and the keys that were absent,
    /// both in request order. Deletion events for the removed keys are
    /// published by the caller after release.
    pub fn delete_keys(&self, keys: &[String]) -> DeleteOutcome {
        let _table = self.inner.table_lock.write().unwrap();
        let mut outcome = DeleteOutcome::default();
        for key in keys {
            // Uncontended under the coarse write lock; see `table_lock`.
            let mut bucket = self.inner.buckets[bucket_of(key)].write().unwrap();
            if bucket.remove(key).is_some() {
                outcome.deleted.push(key.clone());
            } else {
                outcome.missing.push(key.clone());
            }
        }
        outcome
    }

    /// Returns whether `key` currently has an entry.
    pub fn contains(&self, key: &str) -> bool {
        let _table = self.inner.table_lock.read().unwrap();
        let bucket = self.inner.buckets[bucket_of(key)].read().unwrap();
        bucket.contains_key(key)
    }

    /// Writes every entry as a `(key, value)` line, iterating buckets in
    /// index order under the coarse write lock so no mutation is in
    /// progress while the table is walked.
    pub fn show<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let _table = self.inner.table_lock.write().unwrap();
        for bucket in &self.inner.buckets {
            // Uncontended under the coarse write lock; see `table_lock`.
            let bucket = bucket.read().unwrap();
            for (key, value) in bucket.iter() {
                writeln!(out, "({key}, {value})")?;
            }
        }
        Ok(())
    }

    /// Captures a consistent point-in-time image of the store.
    ///
    /// Holds the coarse read lock and every bucket read lock at once
    /// while copying, so no writer is mid-update anywhere in the table;
    /// the moment all guards are held is the snapshot instant. Writers
    /// resume as soon as the copy completes, independent of whatever the
    /// caller later does with the image.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let _table = self.inner.table_lock.read().unwrap();
        let guards: Vec<_> = self
            .inner
            .buckets
            .iter()
            .map(|b| b.read().unwrap())
            .collect();
        guards
            .iter()
            .flat_map(|bucket| bucket.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        let _table = self.inner.table_lock.read().unwrap();
        self.inner
            .buckets
            .iter()
            .map(|b| b.read().unwrap().len())
            .sum()
    }

    /// Returns whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a batch deletion: which keys went away and which were
/// never there.
#[derive(Debug, Default)]
pub struct DeleteOutcome {
    /// Keys removed by this call, in request order.
    pub deleted: Vec<String>,
    /// Keys that had no entry, in request order.
    pub missing: Vec<String>,
}
