// index.rs - Equality index for join and existence nodes

use crate::arena::TupleIndex;
use crate::element_list::{ElementAwareList, EntryId};
use rustc_hash::FxHashMap;

/// Maps a join key to the bucket of tuples currently filed under it.
///
/// Buckets are intrusive lists, so a tuple leaves its bucket in O(1) through
/// the entry handle it stored when it was filed. Probing a key visits the
/// bucket in insertion order, which fixes the emission order of join matches.
#[derive(Debug, Default)]
pub struct UniIndex {
    buckets: FxHashMap<u64, ElementAwareList<TupleIndex>>,
}

impl UniIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files `tuple` under `key`; the returned handle is required to unfile it.
    pub fn put(&mut self, key: u64, tuple: TupleIndex) -> EntryId {
        self.buckets.entry(key).or_default().add(tuple)
    }

    /// Unfiles the entry behind `handle` from the `key` bucket.
    pub fn remove(&mut self, key: u64, handle: EntryId) -> Option<TupleIndex> {
        let bucket = self.buckets.get_mut(&key)?;
        let removed = bucket.remove(handle);
        if bucket.is_empty() {
            self.buckets.remove(&key);
        }
        removed
    }

    /// Insertion-order snapshot of the `key` bucket.
    pub fn matches(&self, key: u64) -> Vec<TupleIndex> {
        self.buckets
            .get(&key)
            .map(|bucket| bucket.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, key: u64) -> usize {
        self.buckets.get(&key).map_or(0, ElementAwareList::len)
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
