//! LRU ordering lists
//!
//! Lists only order eviction candidates; lookups go through the hash buckets.
//! Each insertion takes a fresh monotonically increasing tick, so the smallest
//! tick is always the least recently released entry.

use std::collections::BTreeMap;

/// Stable identity of an entry inside one cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) u64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tick-ordered list of unpinned entries
#[derive(Debug, Default)]
pub(crate) struct LruList {
    order: BTreeMap<u64, EntryId>,
    next_tick: u64,
}

impl LruList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the most-recently-used end and return the position tick
    pub fn push_back(&mut self, id: EntryId) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        self.order.insert(tick, id);
        tick
    }

    /// Remove the entry stored at `tick`
    pub fn remove(&mut self, tick: u64) -> Option<EntryId> {
        self.order.remove(&tick)
    }

    /// Remove and return the least recently used entry
    pub fn pop_front(&mut self) -> Option<EntryId> {
        self.order.pop_first().map(|(_, id)| id)
    }

    /// Entries from least to most recently used
    pub fn iter(&self) -> impl Iterator<Item = (u64, EntryId)> + '_ {
        self.order.iter().map(|(tick, id)| (*tick, *id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
