// element_list.rs - Intrusive doubly linked list with stable entry handles

use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Stable handle to one entry of an [`ElementAwareList`].
    pub struct EntryId;
}

#[derive(Debug)]
struct ListEntry<T> {
    value: T,
    prev: Option<EntryId>,
    next: Option<EntryId>,
}

/// A linked list whose elements know their own position.
///
/// `add` appends at the tail and hands back an [`EntryId`]; `remove` through
/// that handle is O(1) with no search. Iteration follows insertion order.
/// A handle is only meaningful for the list that issued it and is dead after
/// removal (stale handles are detected by the slotmap generation, not UB).
#[derive(Debug)]
pub struct ElementAwareList<T> {
    entries: SlotMap<EntryId, ListEntry<T>>,
    head: Option<EntryId>,
    tail: Option<EntryId>,
}

impl<T> Default for ElementAwareList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ElementAwareList<T> {
    pub fn new() -> Self {
        Self {
            entries: SlotMap::with_key(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends `value` at the tail. O(1).
    pub fn add(&mut self, value: T) -> EntryId {
        let old_tail = self.tail;
        let id = self.entries.insert(ListEntry {
            value,
            prev: old_tail,
            next: None,
        });
        match old_tail {
            Some(tail) => self.entries[tail].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        id
    }

    /// Unlinks the entry behind `id` and returns its value. O(1).
    /// Returns `None` for a stale or foreign handle.
    pub fn remove(&mut self, id: EntryId) -> Option<T> {
        let entry = self.entries.remove(id)?;
        match entry.prev {
            Some(prev) => self.entries[prev].next = entry.next,
            None => self.head = entry.next,
        }
        match entry.next {
            Some(next) => self.entries[next].prev = entry.prev,
            None => self.tail = entry.prev,
        }
        Some(entry.value)
    }

    pub fn get(&self, id: EntryId) -> Option<&T> {
        self.entries.get(id).map(|e| &e.value)
    }

    /// Visits every entry in insertion order, allowing the callback to
    /// mutate the list. The successor is captured before the callback runs,
    /// so the callback may remove the entry it is currently visiting.
    pub fn for_each_entry(&mut self, mut f: impl FnMut(&mut Self, EntryId)) {
        let mut cursor = self.head;
        while let Some(id) = cursor {
            cursor = self.entries.get(id).and_then(|e| e.next);
            if self.entries.contains_key(id) {
                f(self, id);
            }
        }
    }

    /// Insertion-order iterator over the values.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Insertion-order snapshot of all entry ids. Useful when the caller
    /// needs to mutate the list (or unrelated state) while walking it.
    pub fn ids(&self) -> Vec<EntryId> {
        self.iter_ids().collect()
    }

    fn iter_ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let id = cursor?;
            cursor = self.entries.get(id).and_then(|e| e.next);
            Some(id)
        })
    }
}

pub struct Iter<'a, T> {
    list: &'a ElementAwareList<T>,
    cursor: Option<EntryId>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let id = self.cursor?;
        let entry = self.list.entries.get(id)?;
        self.cursor = entry.next;
        Some(&entry.value)
    }
}
