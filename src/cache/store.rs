//! Generic two-level cache
//!
//! `Cache<K, P>` stores payloads addressed by a [`CacheKey`] and shaped by
//! [`CacheParams`]. One structural mutex guards the hash buckets, both LRU
//! lists, the size counters and every entry's pin count; payload bytes sit
//! behind per-entry locks.
//!
//! ## Residency
//!
//! - **Memory**: heap buffer or live mapping; charged to `memory_size`
//! - **Disk**: unmapped file-backed payload; charged to `disk_size`
//!
//! Pinned entries are always memory-resident. When the memory portion is over
//! budget the least recently used unpinned entry is demoted (mapped entries)
//! or deleted (heap entries); when the whole cache is over budget disk-resident
//! entries are deleted.
//!
//! Demotion only detaches a mapping under the lock; flushing and closing it
//! happen after the lock is released, like file deletion in the deleter.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::deleter::Deleter;
use super::entry::{BuildLatch, CacheEntry};
use super::holder::CacheEntryHolder;
use super::key::CacheKey;
use super::lru::{EntryId, LruList};
use super::metrics::{CacheMetrics, CacheStats};
use super::params::{CacheParams, StorageMode};
use super::storage::{payload_path, FileHandleBudget, HandleReclaimer, Storage};
use crate::error::{Error, Result};

/// Configuration of one cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Name used in logs and as the directory name under the cache root
    pub name: String,
    /// Memory plus disk budget, in bytes
    pub maximum_size: usize,
    /// Share of `maximum_size` that may be memory-resident, in [0, 1]
    pub in_memory_fraction: f64,
    /// Where disk-backed payloads live; required for [`StorageMode::Disk`]
    pub directory: Option<PathBuf>,
}

impl CacheConfig {
    /// Heap-only cache
    pub fn in_memory(name: impl Into<String>, maximum_size: usize) -> Self {
        Self {
            name: name.into(),
            maximum_size,
            in_memory_fraction: 1.0,
            directory: None,
        }
    }

    /// Cache able to hold file-backed payloads under `directory`
    pub fn on_disk(
        name: impl Into<String>,
        maximum_size: usize,
        in_memory_fraction: f64,
        directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            maximum_size,
            in_memory_fraction: in_memory_fraction.clamp(0.0, 1.0),
            directory: Some(directory.into()),
        }
    }
}

/// How bulk removal treats pinned entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveMode {
    /// Detach pinned entries now; their handles keep the bytes alive
    Force,
    /// Delete unpinned entries now and pinned ones on their last release
    WhenUnused,
}

/// Bytes one holder occupies in a cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HolderMemoryStats {
    pub ram: usize,
    pub disk: usize,
}

impl std::ops::AddAssign for HolderMemoryStats {
    fn add_assign(&mut self, other: Self) {
        self.ram += other.ram;
        self.disk += other.disk;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residence {
    Memory,
    Disk,
}

enum Phase {
    Building(Arc<BuildLatch>),
    Ready,
}

struct Record<K: CacheKey, P: CacheParams> {
    entry: Arc<CacheEntry<K, P>>,
    pins: usize,
    residence: Residence,
    lru_tick: Option<u64>,
    phase: Phase,
    /// Delete on last release instead of returning to the LRU
    doomed: bool,
}

impl<K: CacheKey, P: CacheParams> Record<K, P> {
    fn is_ready(&self) -> bool {
        matches!(self.phase, Phase::Ready)
    }
}

enum Probe {
    Hit(EntryId),
    Wait(Arc<BuildLatch>),
    Miss,
}

struct Index<K: CacheKey, P: CacheParams> {
    records: HashMap<EntryId, Record<K, P>>,
    buckets: HashMap<u64, Vec<EntryId>>,
    memory_lru: LruList,
    disk_lru: LruList,
    memory_size: usize,
    disk_size: usize,
    maximum_size: usize,
    in_memory_fraction: f64,
    next_id: u64,
    next_slot: u64,
    /// Unpinned entries removed under the lock, handed to the deleter after it
    graveyard: Vec<Arc<CacheEntry<K, P>>>,
    /// Mappings detached by demotion, flushed and closed after the lock
    unmapped: Vec<Storage>,
}

impl<K: CacheKey, P: CacheParams> Index<K, P> {
    fn new(maximum_size: usize, in_memory_fraction: f64) -> Self {
        Self {
            records: HashMap::new(),
            buckets: HashMap::new(),
            memory_lru: LruList::new(),
            disk_lru: LruList::new(),
            memory_size: 0,
            disk_size: 0,
            maximum_size,
            in_memory_fraction,
            next_id: 0,
            next_slot: 0,
            graveyard: Vec::new(),
            unmapped: Vec::new(),
        }
    }

    fn maximum_memory_size(&self) -> usize {
        ((self.maximum_size as f64 * self.in_memory_fraction) as usize).max(1)
    }

    fn total_size(&self) -> usize {
        self.memory_size + self.disk_size
    }

    fn allocate_id(&mut self) -> EntryId {
        self.next_id += 1;
        EntryId(self.next_id)
    }

    fn allocate_slot(&mut self) -> u64 {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    fn probe(&self, hash: u64, key: &K, params: &P) -> Probe {
        let Some(ids) = self.buckets.get(&hash) else {
            return Probe::Miss;
        };
        let mut pending = None;
        for id in ids {
            let Some(record) = self.records.get(id) else {
                continue;
            };
            if record.entry.key() != key {
                continue;
            }
            match &record.phase {
                Phase::Building(latch) => {
                    if pending.is_none() {
                        pending = Some(Arc::clone(latch));
                    }
                }
                Phase::Ready => {
                    if !record.doomed && record.entry.params() == params {
                        return Probe::Hit(*id);
                    }
                }
            }
        }
        pending.map_or(Probe::Miss, Probe::Wait)
    }

    fn insert(&mut self, record: Record<K, P>) {
        let id = record.entry.id();
        let hash = record.entry.hash();
        let size = record.entry.size();
        let linkable = record.pins == 0 && record.is_ready();

        match record.residence {
            Residence::Memory => self.memory_size += size,
            Residence::Disk => self.disk_size += size,
        }
        self.buckets.entry(hash).or_default().push(id);
        self.records.insert(id, record);
        if linkable {
            self.link_lru(id);
        }
    }

    fn remove(&mut self, id: EntryId) -> Option<Record<K, P>> {
        self.unlink_lru(id);
        let record = self.records.remove(&id)?;
        let hash = record.entry.hash();
        if let Some(ids) = self.buckets.get_mut(&hash) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.buckets.remove(&hash);
            }
        }
        let size = record.entry.size();
        match record.residence {
            Residence::Memory => self.memory_size = self.memory_size.saturating_sub(size),
            Residence::Disk => self.disk_size = self.disk_size.saturating_sub(size),
        }
        Some(record)
    }

    fn link_lru(&mut self, id: EntryId) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        if record.lru_tick.is_some() {
            return;
        }
        let tick = match record.residence {
            Residence::Memory => self.memory_lru.push_back(id),
            Residence::Disk => self.disk_lru.push_back(id),
        };
        record.lru_tick = Some(tick);
    }

    fn unlink_lru(&mut self, id: EntryId) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        if let Some(tick) = record.lru_tick.take() {
            match record.residence {
                Residence::Memory => self.memory_lru.remove(tick),
                Residence::Disk => self.disk_lru.remove(tick),
            };
        }
    }

    fn pin(&mut self, id: EntryId) {
        self.unlink_lru(id);
        if let Some(record) = self.records.get_mut(&id) {
            record.pins += 1;
        }
    }

    /// Move residence between the memory and disk counters
    fn set_residence(&mut self, id: EntryId, residence: Residence) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        if record.residence == residence {
            return;
        }
        let size = record.entry.size();
        record.residence = residence;
        match residence {
            Residence::Memory => {
                self.disk_size = self.disk_size.saturating_sub(size);
                self.memory_size += size;
            }
            Residence::Disk => {
                self.memory_size = self.memory_size.saturating_sub(size);
                self.disk_size += size;
            }
        }
    }

    fn ids_where(&self, pred: impl Fn(&Record<K, P>) -> bool) -> Vec<EntryId> {
        self.records
            .iter()
            .filter(|(_, record)| pred(record))
            .map(|(id, _)| *id)
            .collect()
    }
}

pub(crate) struct Shared<K: CacheKey, P: CacheParams> {
    name: String,
    directory: Option<PathBuf>,
    index: Mutex<Index<K, P>>,
    file_handles: Arc<FileHandleBudget>,
    /// Identifies this cache among the budget's reclaimers
    reclaim_token: u64,
    metrics: CacheMetrics,
    deleter: Deleter<Arc<CacheEntry<K, P>>>,
}

impl<K: CacheKey, P: CacheParams> Shared<K, P> {
    /// Release the index lock, close demoted mappings and hand removed
    /// entries to the deleter
    fn unlock(&self, mut index: MutexGuard<'_, Index<K, P>>) {
        let dead = std::mem::take(&mut index.graveyard);
        let unmapped = std::mem::take(&mut index.unmapped);
        drop(index);
        self.close_mappings(unmapped);
        self.deleter.discard(dead);
    }

    fn close_mappings(&self, unmapped: Vec<Storage>) {
        for storage in unmapped {
            if let Err(e) = storage.flush() {
                warn!("{}: failed to flush demoted entry: {}", self.name, e);
            }
        }
    }

    /// Remove a record; unpinned entries go to the graveyard, pinned ones are
    /// detached and die with their last handle
    fn delete(&self, index: &mut Index<K, P>, id: EntryId) -> bool {
        let Some(record) = index.remove(id) else {
            return false;
        };
        record.entry.mark_discarded();
        if let Phase::Building(latch) = &record.phase {
            latch.fail();
        }
        if record.pins == 0 {
            index.graveyard.push(record.entry);
        }
        true
    }

    /// Remove now, or defer to the last release when the record cannot go yet
    fn discard(&self, index: &mut Index<K, P>, id: EntryId, mode: RemoveMode) {
        let Some(record) = index.records.get_mut(&id) else {
            return;
        };
        let in_flight = !record.is_ready();
        if in_flight || (mode == RemoveMode::WhenUnused && record.pins > 0) {
            record.doomed = true;
            return;
        }
        self.delete(index, id);
    }

    /// Detach a file-backed entry's mapping and move it to the disk LRU
    ///
    /// The descriptor slot is returned at once; the mapping itself waits in
    /// `unmapped` until the lock is released.
    fn demote(&self, index: &mut Index<K, P>, id: EntryId) {
        let Some(record) = index.records.get(&id) else {
            return;
        };
        let entry = Arc::clone(&record.entry);
        index.unlink_lru(id);
        if let Some(mut storage) = entry.take_storage() {
            storage.release_handle_slot();
            index.unmapped.push(storage);
        }
        index.set_residence(id, Residence::Disk);
        index.link_lru(id);
        self.metrics.record_demotion();
        trace!("{}: demoted entry {}", self.name, id);
    }

    /// Re-map a disk-resident entry
    fn promote(&self, index: &mut Index<K, P>, id: EntryId) -> Result<()> {
        let Some(record) = index.records.get(&id) else {
            return Ok(());
        };
        let entry = Arc::clone(&record.entry);
        let path = entry.payload_path().ok_or_else(|| {
            Error::Config(format!("{}: disk-resident entry {} has no file", self.name, id))
        })?;

        while self.file_handles.is_capped() && self.reclaim_handle(index) {}
        let storage = Storage::open_mapped(path, entry.size(), &self.file_handles)?;
        entry.install(storage);

        index.unlink_lru(id);
        index.set_residence(id, Residence::Memory);
        self.metrics.record_promotion();
        Ok(())
    }

    /// Evict the least recently used memory-resident entry
    fn evict_one_from_memory(&self, index: &mut Index<K, P>) -> bool {
        let Some(id) = index.memory_lru.pop_front() else {
            return false;
        };
        let Some(record) = index.records.get_mut(&id) else {
            return true;
        };
        record.lru_tick = None;
        match record.entry.storage_mode() {
            StorageMode::Disk => self.demote(index, id),
            StorageMode::Ram => {
                self.delete(index, id);
                self.metrics.record_memory_eviction();
            }
        }
        true
    }

    fn evict_one_from_disk(&self, index: &mut Index<K, P>) -> bool {
        let Some(id) = index.disk_lru.pop_front() else {
            return false;
        };
        if let Some(record) = index.records.get_mut(&id) {
            record.lru_tick = None;
        }
        self.delete(index, id);
        self.metrics.record_disk_eviction();
        true
    }

    /// Demote the least recently used mapped entry, freeing a file handle
    fn demote_one_mapped(&self, index: &mut Index<K, P>) -> bool {
        let victim = index.memory_lru.iter().find(|(_, id)| {
            index
                .records
                .get(id)
                .is_some_and(|r| r.entry.storage_mode() == StorageMode::Disk)
        });
        let Some((tick, id)) = victim else {
            return false;
        };
        index.memory_lru.remove(tick);
        if let Some(record) = index.records.get_mut(&id) {
            record.lru_tick = None;
        }
        self.demote(index, id);
        true
    }

    /// Free one file handle, from this cache's idle mappings first, then
    /// from the other caches sharing the budget
    fn reclaim_handle(&self, index: &mut Index<K, P>) -> bool {
        if self.demote_one_mapped(index) {
            return true;
        }
        let released = self.file_handles.reclaim_elsewhere(self.reclaim_token);
        let freed = !released.is_empty();
        index.unmapped.extend(released);
        freed
    }

    /// Evict until both the memory portion and the total are within budget
    fn trim(&self, index: &mut Index<K, P>) {
        let max_memory = index.maximum_memory_size();
        while index.memory_size > max_memory && self.evict_one_from_memory(index) {}
        while index.total_size() > index.maximum_size {
            if self.evict_one_from_disk(index) {
                continue;
            }
            if !self.evict_one_from_memory(index) {
                break;
            }
        }
    }

    /// Make room for a new entry of `size` bytes
    fn admit(&self, index: &mut Index<K, P>, size: usize, mode: StorageMode) -> Result<()> {
        let max_memory = index.maximum_memory_size();
        let capacity = match mode {
            StorageMode::Ram => max_memory,
            StorageMode::Disk => index.maximum_size,
        };
        if size > capacity {
            return Err(Error::EntryTooLarge { size, capacity });
        }

        self.trim(index);

        match mode {
            StorageMode::Ram => {
                if index.memory_size > max_memory {
                    return Err(Error::AllocationFailed {
                        size,
                        reason: format!(
                            "{} of {} memory bytes held by pinned entries",
                            index.memory_size, max_memory
                        ),
                    });
                }
            }
            StorageMode::Disk => {
                if self.directory.is_none() {
                    return Err(Error::Config(format!(
                        "{} has no directory for file-backed entries",
                        self.name
                    )));
                }
                if index.total_size() > index.maximum_size {
                    return Err(Error::AllocationFailed {
                        size,
                        reason: format!(
                            "{} of {} bytes held by pinned entries",
                            index.total_size(),
                            index.maximum_size
                        ),
                    });
                }
                while self.file_handles.is_capped() && self.reclaim_handle(index) {}
                if self.file_handles.is_capped() {
                    return Err(Error::FileHandlesExhausted {
                        opened: self.file_handles.opened(),
                        max: self.file_handles.max(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Pin a ready entry, re-mapping it first if it sits on disk
    ///
    /// The flag tells whether the entry was promoted, growing the memory
    /// portion.
    fn acquire(
        &self,
        index: &mut Index<K, P>,
        id: EntryId,
    ) -> Result<(Arc<CacheEntry<K, P>>, bool)> {
        let Some(record) = index.records.get(&id) else {
            return Err(Error::BuildAborted);
        };
        let entry = Arc::clone(&record.entry);
        let promoted = record.residence == Residence::Disk;
        if promoted {
            self.promote(index, id)?;
        }
        index.pin(id);
        Ok((entry, promoted))
    }

    /// Insert a building record charged to memory and pinned once
    fn reserve(
        &self,
        index: &mut Index<K, P>,
        key: K,
        params: P,
        hash: u64,
    ) -> Result<(Arc<CacheEntry<K, P>>, Arc<BuildLatch>)> {
        let size = params.size_in_bytes();
        let mode = params.storage_mode();
        self.admit(index, size, mode)?;

        let id = index.allocate_id();
        let (slot, path) = match (mode, &self.directory) {
            (StorageMode::Disk, Some(dir)) => {
                let slot = index.allocate_slot();
                (slot, Some(payload_path(dir, hash, slot)))
            }
            _ => (0, None),
        };
        let entry = Arc::new(CacheEntry::new(id, key, params, hash, slot, path));
        let latch = Arc::new(BuildLatch::new());
        index.insert(Record {
            entry: Arc::clone(&entry),
            pins: 1,
            residence: Residence::Memory,
            lru_tick: None,
            phase: Phase::Building(Arc::clone(&latch)),
            doomed: false,
        });
        Ok((entry, latch))
    }

    fn allocate(&self, entry: &CacheEntry<K, P>) -> Result<Storage> {
        match (entry.storage_mode(), entry.payload_path()) {
            (StorageMode::Disk, Some(path)) => {
                Storage::create_mapped(path, entry.size(), &self.file_handles)
            }
            _ => Storage::allocate_ram(entry.size()),
        }
    }

    /// Free something the failed allocation might have been waiting on
    fn evict_for_retry(&self, mode: StorageMode) -> bool {
        let mut index = self.index.lock();
        let freed = match mode {
            StorageMode::Ram => self.evict_one_from_memory(&mut index),
            StorageMode::Disk => {
                self.reclaim_handle(&mut index) || self.evict_one_from_disk(&mut index)
            }
        };
        self.unlock(index);
        self.deleter.wait_idle();
        freed
    }

    /// Publish a built entry and wake its waiters
    fn publish(&self, entry: &CacheEntry<K, P>, latch: &BuildLatch) {
        let mut index = self.index.lock();
        entry.mark_ready();
        let id = entry.id();
        let doomed = match index.records.get_mut(&id) {
            Some(record) => {
                record.phase = Phase::Ready;
                record.doomed
            }
            None => false,
        };
        if doomed {
            self.delete(&mut index, id);
        }
        self.unlock(index);
        latch.complete();
    }

    /// Drop a build that never finished
    fn abort(&self, entry: &CacheEntry<K, P>, latch: &BuildLatch) {
        let mut index = self.index.lock();
        self.delete(&mut index, entry.id());
        self.unlock(index);
        latch.fail();
        self.metrics.record_build_aborted();
    }

    fn add_pin(&self, entry: &CacheEntry<K, P>) {
        let mut index = self.index.lock();
        if let Some(record) = index.records.get_mut(&entry.id()) {
            record.pins += 1;
        }
    }

    fn release(&self, entry: &CacheEntry<K, P>) {
        let mut index = self.index.lock();
        let id = entry.id();
        let Some(record) = index.records.get_mut(&id) else {
            return;
        };
        record.pins = record.pins.saturating_sub(1);
        if record.pins > 0 || !record.is_ready() {
            return;
        }
        if record.doomed {
            self.delete(&mut index, id);
        } else {
            index.link_lru(id);
        }
        self.unlock(index);
    }
}

impl<K: CacheKey, P: CacheParams> HandleReclaimer for Shared<K, P> {
    fn release_mapped(&self) -> Vec<Storage> {
        let Some(mut index) = self.index.try_lock() else {
            return Vec::new();
        };
        if !self.demote_one_mapped(&mut index) {
            return Vec::new();
        }
        debug!("{}: demoted an idle mapping for another cache", self.name);
        std::mem::take(&mut index.unmapped)
    }
}

/// Whether a failed re-map means the payload file itself is gone or damaged
fn payload_lost(err: &Error) -> bool {
    match err {
        Error::Persistence { .. } | Error::Config(_) => true,
        Error::Io(e) => e.kind() == ErrorKind::NotFound,
        _ => false,
    }
}

/// Pinned reference to a ready entry
///
/// While a handle exists the entry is memory-resident and never evicted.
/// Dropping the last handle returns the entry to the LRU.
pub struct EntryHandle<K: CacheKey, P: CacheParams> {
    entry: Arc<CacheEntry<K, P>>,
    shared: Arc<Shared<K, P>>,
}

impl<K: CacheKey, P: CacheParams> EntryHandle<K, P> {
    /// Copy the payload out
    pub fn to_bytes(&self) -> Bytes {
        self.entry
            .read(Bytes::copy_from_slice)
            .unwrap_or_default()
    }

    /// Whether two handles point at the same entry
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.entry, &b.entry)
    }
}

impl<K: CacheKey, P: CacheParams> std::ops::Deref for EntryHandle<K, P> {
    type Target = CacheEntry<K, P>;

    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

impl<K: CacheKey, P: CacheParams> Clone for EntryHandle<K, P> {
    fn clone(&self) -> Self {
        self.shared.add_pin(&self.entry);
        Self {
            entry: Arc::clone(&self.entry),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: CacheKey, P: CacheParams> Drop for EntryHandle<K, P> {
    fn drop(&mut self) {
        self.shared.release(&self.entry);
    }
}

impl<K: CacheKey, P: CacheParams> std::fmt::Debug for EntryHandle<K, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EntryHandle").field(&*self.entry).finish()
    }
}

/// Exclusive right to fill a freshly created entry
///
/// Other lookups of the same key block until [`finish`](Self::finish) or
/// until the guard is dropped, which aborts the build and lets the next
/// waiter try.
pub struct BuildGuard<K: CacheKey, P: CacheParams> {
    entry: Arc<CacheEntry<K, P>>,
    shared: Arc<Shared<K, P>>,
    latch: Arc<BuildLatch>,
    started: Instant,
    finished: bool,
}

impl<K: CacheKey, P: CacheParams> BuildGuard<K, P> {
    pub fn entry(&self) -> &CacheEntry<K, P> {
        &self.entry
    }

    pub fn key(&self) -> &K {
        self.entry.key()
    }

    pub fn params(&self) -> &P {
        self.entry.params()
    }

    /// Fill (part of) the payload
    pub fn write<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        self.entry.write(f)
    }

    /// Mark the entry ready and turn the build pin into a regular handle
    pub fn finish(mut self) -> EntryHandle<K, P> {
        self.finished = true;
        self.shared.publish(&self.entry, &self.latch);
        self.shared.metrics.record_build_finished(self.started.elapsed());
        EntryHandle {
            entry: Arc::clone(&self.entry),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Give up on the build
    pub fn abort(self) {}
}

impl<K: CacheKey, P: CacheParams> Drop for BuildGuard<K, P> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("{}: build of entry {} aborted", self.shared.name, self.entry.id());
            self.shared.abort(&self.entry, &self.latch);
        }
    }
}

impl<K: CacheKey, P: CacheParams> std::fmt::Debug for BuildGuard<K, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BuildGuard").field(&*self.entry).finish()
    }
}

/// Outcome of [`Cache::get_or_create`]
#[derive(Debug)]
pub enum Lookup<K: CacheKey, P: CacheParams> {
    /// A ready entry with the same key and params
    Found(EntryHandle<K, P>),
    /// A new empty entry; the caller must fill and finish it
    Created(BuildGuard<K, P>),
}

impl<K: CacheKey, P: CacheParams> Lookup<K, P> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

/// Size-bounded cache of typed payloads
pub struct Cache<K: CacheKey, P: CacheParams> {
    shared: Arc<Shared<K, P>>,
}

impl<K: CacheKey, P: CacheParams> Clone for Cache<K, P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: CacheKey, P: CacheParams> Cache<K, P> {
    /// Create an empty cache, creating its directory if it has one
    pub fn new(config: CacheConfig, file_handles: Arc<FileHandleBudget>) -> Result<Self> {
        if let Some(dir) = &config.directory {
            fs::create_dir_all(dir).map_err(|source| Error::CacheDirectory {
                path: dir.clone(),
                source,
            })?;
        }
        info!(
            "Creating cache {} ({} bytes, {:.0}% in memory)",
            config.name,
            config.maximum_size,
            config.in_memory_fraction * 100.0
        );
        let deleter = Deleter::spawn(&config.name);
        let reclaim_token = file_handles.reclaimer_token();
        let shared = Arc::new(Shared {
            index: Mutex::new(Index::new(
                config.maximum_size,
                config.in_memory_fraction.clamp(0.0, 1.0),
            )),
            name: config.name,
            directory: config.directory,
            file_handles,
            reclaim_token,
            metrics: CacheMetrics::new(),
            deleter,
        });
        let weak = Arc::downgrade(&shared);
        let reclaimer: Weak<dyn HandleReclaimer> = weak;
        shared.file_handles.register_reclaimer(reclaim_token, reclaimer);
        Ok(Self { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn directory(&self) -> Option<&Path> {
        self.shared.directory.as_deref()
    }

    pub fn file_handles(&self) -> &Arc<FileHandleBudget> {
        &self.shared.file_handles
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.shared.metrics
    }

    fn handle(&self, entry: Arc<CacheEntry<K, P>>) -> EntryHandle<K, P> {
        EntryHandle {
            entry,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Pin every ready entry whose key equals `key`
    ///
    /// Never blocks on in-flight builds. Variants with different params are
    /// all returned.
    pub fn get(&self, key: &K) -> Vec<EntryHandle<K, P>> {
        let hash = key.hash64();
        let mut index = self.shared.index.lock();
        let candidates: Vec<EntryId> = index
            .buckets
            .get(&hash)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|id| {
                        index.records.get(id).is_some_and(|r| {
                            r.is_ready() && !r.doomed && r.entry.key() == key
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut handles = Vec::with_capacity(candidates.len());
        let mut promoted_any = false;
        for id in candidates {
            match self.shared.acquire(&mut index, id) {
                Ok((entry, promoted)) => {
                    promoted_any |= promoted;
                    handles.push(self.handle(entry));
                }
                Err(e) if payload_lost(&e) => {
                    warn!("{}: dropping unreadable entry {}: {}", self.shared.name, id, e);
                    self.shared.delete(&mut index, id);
                }
                Err(e) => {
                    warn!("{}: entry {} stays on disk: {}", self.shared.name, id, e);
                    self.shared.metrics.record_allocation_failure();
                }
            }
        }

        if handles.is_empty() {
            self.shared.metrics.record_miss();
        } else {
            self.shared.metrics.record_hit();
        }
        if promoted_any {
            self.shared.trim(&mut index);
        }
        self.shared.unlock(index);
        handles
    }

    /// Return the entry for `(key, params)`, or reserve it for the caller to
    /// build
    ///
    /// At most one build per key is in flight: concurrent callers block until
    /// it finishes or aborts, then retry.
    pub fn get_or_create(&self, key: K, params: P) -> Result<Lookup<K, P>> {
        let hash = key.hash64();
        loop {
            let mut index = self.shared.index.lock();
            match index.probe(hash, &key, &params) {
                Probe::Hit(id) => match self.shared.acquire(&mut index, id) {
                    Ok((entry, promoted)) => {
                        if promoted {
                            self.shared.trim(&mut index);
                        }
                        self.shared.unlock(index);
                        self.shared.metrics.record_hit();
                        return Ok(Lookup::Found(self.handle(entry)));
                    }
                    Err(e) if payload_lost(&e) => {
                        warn!("{}: dropping unreadable entry {}: {}", self.shared.name, id, e);
                        self.shared.delete(&mut index, id);
                        self.shared.unlock(index);
                        continue;
                    }
                    Err(e) => {
                        warn!("{}: entry {} stays on disk: {}", self.shared.name, id, e);
                        self.shared.unlock(index);
                        self.shared.metrics.record_allocation_failure();
                        return Err(e);
                    }
                },
                Probe::Wait(latch) => {
                    drop(index);
                    self.shared.metrics.record_build_wait();
                    trace!("{}: waiting on in-flight build", self.shared.name);
                    latch.wait();
                    continue;
                }
                Probe::Miss => {}
            }

            self.shared.metrics.record_miss();
            let reserved = self.shared.reserve(&mut index, key, params, hash);
            self.shared.unlock(index);
            let (entry, latch) = reserved.map_err(|e| {
                self.shared.metrics.record_allocation_failure();
                e
            })?;
            self.shared.metrics.record_build_started();

            let storage = match self.shared.allocate(&entry) {
                Ok(storage) => Ok(storage),
                Err(first) => {
                    debug!(
                        "{}: allocation of {} bytes failed ({}), evicting and retrying",
                        self.shared.name,
                        entry.size(),
                        first
                    );
                    if self.shared.evict_for_retry(entry.storage_mode()) {
                        self.shared.allocate(&entry)
                    } else {
                        Err(first)
                    }
                }
            };

            let guard = BuildGuard {
                entry: Arc::clone(&entry),
                shared: Arc::clone(&self.shared),
                latch,
                started: Instant::now(),
                finished: false,
            };
            return match storage {
                Ok(storage) => {
                    entry.install(storage);
                    Ok(Lookup::Created(guard))
                }
                Err(e) => {
                    warn!(
                        "{}: failed to allocate {} bytes: {}",
                        self.shared.name,
                        entry.size(),
                        e
                    );
                    self.shared.metrics.record_allocation_failure();
                    drop(guard);
                    Err(e)
                }
            };
        }
    }

    /// Remove the entry behind `handle` once nobody else holds it
    pub fn remove_entry(&self, handle: EntryHandle<K, P>) {
        if !Arc::ptr_eq(&handle.shared, &self.shared) {
            warn!("{}: handle belongs to another cache", self.shared.name);
            return;
        }
        {
            let mut index = self.shared.index.lock();
            if let Some(record) = index.records.get_mut(&handle.id()) {
                record.doomed = true;
            }
        }
        drop(handle);
    }

    /// Remove every entry stored under `hash`
    pub fn remove_entries_with_hash(&self, hash: u64, mode: RemoveMode) -> usize {
        let mut index = self.shared.index.lock();
        let ids = index.buckets.get(&hash).cloned().unwrap_or_default();
        for id in &ids {
            self.shared.discard(&mut index, *id, mode);
        }
        self.shared.unlock(index);
        ids.len()
    }

    fn remove_where(&self, mode: RemoveMode, pred: impl Fn(&CacheEntry<K, P>) -> bool) -> usize {
        let mut index = self.shared.index.lock();
        let ids = index.ids_where(|record| pred(&record.entry));
        for id in &ids {
            self.shared.discard(&mut index, *id, mode);
        }
        self.shared.unlock(index);
        ids.len()
    }

    /// Remove every entry, detaching pinned ones
    pub fn clear(&self) {
        let removed = self.remove_where(RemoveMode::Force, |_| true);
        info!("{}: cleared {} entries", self.shared.name, removed);
    }

    /// Demote or delete every unpinned memory-resident entry
    pub fn clear_in_memory_portion(&self) {
        let mut index = self.shared.index.lock();
        let mut evicted = 0usize;
        while self.shared.evict_one_from_memory(&mut index) {
            evicted += 1;
        }
        self.shared.trim(&mut index);
        self.shared.unlock(index);
        debug!("{}: cleared {} in-memory entries", self.shared.name, evicted);
    }

    /// Evict until the cache is back within its budgets
    pub fn clear_exceeding_entries(&self) {
        let mut index = self.shared.index.lock();
        self.shared.trim(&mut index);
        self.shared.unlock(index);
    }

    /// Evict the least recently used memory-resident entry
    ///
    /// Returns false when nothing unpinned is left in memory.
    pub fn evict_lru_in_memory_entry(&self) -> bool {
        let mut index = self.shared.index.lock();
        let evicted = self.shared.evict_one_from_memory(&mut index);
        if evicted {
            self.shared.trim(&mut index);
        }
        self.shared.unlock(index);
        evicted
    }

    /// Remove a holder's entries built for another tree version
    pub fn remove_all_entries_with_different_tree_version(
        &self,
        holder: &dyn CacheEntryHolder,
        tree_version: u64,
    ) -> usize {
        let holder_id = holder.cache_id();
        self.remove_where(RemoveMode::Force, |entry| {
            entry.key().holder_id() == holder_id && entry.key().tree_version() != tree_version
        })
    }

    /// Remove every entry owned by a holder
    pub fn remove_all_entries_for_holder(&self, holder: &dyn CacheEntryHolder) -> usize {
        let holder_id = holder.cache_id();
        self.remove_where(RemoveMode::Force, |entry| entry.key().holder_id() == holder_id)
    }

    /// Bytes a holder occupies, split by residence
    pub fn memory_stats_for_holder(&self, holder: &dyn CacheEntryHolder) -> HolderMemoryStats {
        let holder_id = holder.cache_id();
        let index = self.shared.index.lock();
        let mut stats = HolderMemoryStats::default();
        for record in index.records.values() {
            if record.entry.key().holder_id() != holder_id {
                continue;
            }
            match record.residence {
                Residence::Memory => stats.ram += record.entry.size(),
                Residence::Disk => stats.disk += record.entry.size(),
            }
        }
        stats
    }

    /// Change the total budget, evicting immediately
    pub fn set_maximum_cache_size(&self, size: usize) {
        let mut index = self.shared.index.lock();
        index.maximum_size = size;
        self.shared.trim(&mut index);
        self.shared.unlock(index);
    }

    /// Change the memory-resident share, evicting immediately
    pub fn set_maximum_in_memory_fraction(&self, fraction: f64) {
        let mut index = self.shared.index.lock();
        index.in_memory_fraction = fraction.clamp(0.0, 1.0);
        self.shared.trim(&mut index);
        self.shared.unlock(index);
    }

    pub fn maximum_cache_size(&self) -> usize {
        self.shared.index.lock().maximum_size
    }

    pub fn maximum_memory_size(&self) -> usize {
        self.shared.index.lock().maximum_memory_size()
    }

    pub fn in_memory_fraction(&self) -> f64 {
        self.shared.index.lock().in_memory_fraction
    }

    /// Bytes currently memory-resident
    pub fn memory_cache_size(&self) -> usize {
        self.shared.index.lock().memory_size
    }

    /// Bytes currently only on disk
    pub fn disk_cache_size(&self) -> usize {
        self.shared.index.lock().disk_size
    }

    pub fn total_size(&self) -> usize {
        self.shared.index.lock().total_size()
    }

    pub fn len(&self) -> usize {
        self.shared.index.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.index.lock().records.is_empty()
    }

    /// Block until evicted entries have been released
    pub fn wait_for_deleter_thread(&self) {
        self.shared.deleter.wait_idle();
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.shared.index.lock();
        CacheStats {
            name: self.shared.name.clone(),
            entries: index.records.len(),
            memory_size: index.memory_size,
            disk_size: index.disk_size,
            maximum_size: index.maximum_size,
            maximum_memory_size: index.maximum_memory_size(),
            metrics: self.shared.metrics.snapshot(),
        }
    }

    /// Ready file-backed entries, in no particular order
    pub(crate) fn persistable_entries(&self) -> Vec<Arc<CacheEntry<K, P>>> {
        let index = self.shared.index.lock();
        index
            .records
            .values()
            .filter(|r| {
                r.is_ready() && !r.doomed && r.entry.storage_mode() == StorageMode::Disk
            })
            .map(|r| Arc::clone(&r.entry))
            .collect()
    }

    /// Re-insert a persisted file-backed entry as disk-resident
    ///
    /// Returns false if the payload file is missing or short, or an equal
    /// entry already exists.
    pub(crate) fn restore_entry(&self, key: K, params: P, file_slot: u64) -> bool {
        let Some(dir) = &self.shared.directory else {
            return false;
        };
        if params.storage_mode() != StorageMode::Disk {
            return false;
        }
        let hash = key.hash64();
        let path = payload_path(dir, hash, file_slot);
        let size = params.size_in_bytes();
        match fs::metadata(&path) {
            Ok(meta) if meta.len() >= size as u64 => {}
            Ok(meta) => {
                debug!(
                    "{}: skipping {} ({} bytes, expected {})",
                    self.shared.name,
                    path.display(),
                    meta.len(),
                    size
                );
                return false;
            }
            Err(_) => {
                debug!("{}: skipping missing {}", self.shared.name, path.display());
                return false;
            }
        }

        let mut index = self.shared.index.lock();
        if let Probe::Hit(_) | Probe::Wait(_) = index.probe(hash, &key, &params) {
            return false;
        }
        let id = index.allocate_id();
        index.next_slot = index.next_slot.max(file_slot + 1);
        let entry = Arc::new(CacheEntry::new(id, key, params, hash, file_slot, Some(path)));
        entry.mark_ready();
        index.insert(Record {
            entry,
            pins: 0,
            residence: Residence::Disk,
            lru_tick: None,
            phase: Phase::Ready,
            doomed: false,
        });
        true
    }
}

impl<K: CacheKey, P: CacheParams> std::fmt::Debug for Cache<K, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.shared.name)
            .field("directory", &self.shared.directory)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::cache::holder::NodeHolder;
    use crate::cache::key::ImageKey;
    use crate::cache::params::{BitDepth, ImageParams, RectI};

    /// Params whose payload is exactly `bytes` long
    fn ram(bytes: i32) -> ImageParams {
        ImageParams::in_ram(RectI::new(0, 0, bytes, 1), 1, BitDepth::Byte)
    }

    fn disk(bytes: i32) -> ImageParams {
        ImageParams::on_disk(RectI::new(0, 0, bytes, 1), 1, BitDepth::Byte)
    }

    fn ram_cache(size: usize) -> Cache<ImageKey, ImageParams> {
        Cache::new(
            CacheConfig::in_memory("test", size),
            Arc::new(FileHandleBudget::new(64)),
        )
        .unwrap()
    }

    fn build(
        cache: &Cache<ImageKey, ImageParams>,
        key: ImageKey,
        params: ImageParams,
        fill: u8,
    ) -> EntryHandle<ImageKey, ImageParams> {
        match cache.get_or_create(key, params).unwrap() {
            Lookup::Created(mut guard) => {
                guard.write(|buf| buf.fill(fill));
                guard.finish()
            }
            Lookup::Found(handle) => handle,
        }
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = ram_cache(1024);
        let key = ImageKey::still("blur", 1);

        let built = build(&cache, key.clone(), ram(16), 7);
        drop(built);

        let lookup = cache.get_or_create(key.clone(), ram(16)).unwrap();
        assert!(lookup.is_found());
        let handles = cache.get(&key);
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].to_bytes().as_ref(), &[7u8; 16]);
        assert_eq!(cache.metrics().hits(), 2);
    }

    #[test]
    fn test_same_key_different_params_coexist() {
        let cache = ram_cache(1024);
        let key = ImageKey::still("blur", 1);

        let full = build(&cache, key.clone(), ram(16), 1);
        let half = build(&cache, key.clone(), ram(16).with_mipmap_level(1), 2);
        assert!(!EntryHandle::ptr_eq(&full, &half));
        drop((full, half));

        assert_eq!(cache.get(&key).len(), 2);
    }

    #[test]
    fn test_pinned_entries_are_not_evicted() {
        let cache = ram_cache(100);
        let a = build(&cache, ImageKey::still("n", 1), ram(40), 0);
        let b = build(&cache, ImageKey::still("n", 2), ram(40), 0);
        let c = build(&cache, ImageKey::still("n", 3), ram(40), 0);

        let err = cache.get_or_create(ImageKey::still("n", 4), ram(40)).unwrap_err();
        assert_matches!(err, Error::AllocationFailed { .. });
        assert_eq!(cache.memory_cache_size(), 120);
        drop((a, b, c));
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = ram_cache(100);
        for hash in 1..=3 {
            drop(build(&cache, ImageKey::still("n", hash), ram(40), 0));
        }
        // touch 1 so 2 becomes the oldest
        drop(cache.get(&ImageKey::still("n", 1)));
        drop(build(&cache, ImageKey::still("n", 4), ram(40), 0));

        assert!(cache.get(&ImageKey::still("n", 2)).is_empty());
        assert_eq!(cache.get(&ImageKey::still("n", 1)).len(), 1);
        assert_eq!(cache.memory_cache_size(), 120);
    }

    #[test]
    fn test_entry_too_large() {
        let cache = ram_cache(10);
        let err = cache.get_or_create(ImageKey::still("n", 1), ram(11)).unwrap_err();
        assert_matches!(err, Error::EntryTooLarge { size: 11, .. });
        assert!(cache.is_empty());
    }

    #[test]
    fn test_aborted_build_releases_reservation() {
        let cache = ram_cache(100);
        let key = ImageKey::still("n", 1);
        match cache.get_or_create(key.clone(), ram(40)).unwrap() {
            Lookup::Created(guard) => guard.abort(),
            Lookup::Found(_) => panic!("expected a miss"),
        }
        assert_eq!(cache.memory_cache_size(), 0);
        assert!(cache.is_empty());
        assert!(!cache.get_or_create(key, ram(40)).unwrap().is_found());
    }

    #[test]
    fn test_concurrent_misses_build_once() {
        let cache = ram_cache(1024);
        let key = ImageKey::still("n", 9);

        let guard = match cache.get_or_create(key.clone(), ram(8)).unwrap() {
            Lookup::Created(guard) => guard,
            Lookup::Found(_) => panic!("expected a miss"),
        };

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let key = key.clone();
                thread::spawn(move || match cache.get_or_create(key, ram(8)).unwrap() {
                    Lookup::Found(handle) => handle.to_bytes(),
                    Lookup::Created(_) => panic!("second build started"),
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        let mut guard = guard;
        guard.write(|buf| buf.fill(3));
        let handle = guard.finish();

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap().as_ref(), &[3u8; 8]);
        }
        drop(handle);
        assert_eq!(cache.metrics().snapshot().builds_started, 1);
    }

    #[test]
    fn test_remove_entry_waits_for_other_pins() {
        let cache = ram_cache(1024);
        let key = ImageKey::still("n", 1);
        let first = build(&cache, key.clone(), ram(8), 0);
        let second = first.clone();

        cache.remove_entry(first);
        assert!(cache.get(&key).is_empty());
        assert_eq!(cache.len(), 1);

        drop(second);
        assert!(cache.is_empty());
        assert_eq!(cache.memory_cache_size(), 0);
    }

    #[test]
    fn test_clear_detaches_pinned_entries() {
        let cache = ram_cache(1024);
        let handle = build(&cache, ImageKey::still("n", 1), ram(8), 5);
        drop(build(&cache, ImageKey::still("n", 2), ram(8), 0));

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.memory_cache_size(), 0);
        // pinned bytes stay readable
        assert_eq!(handle.to_bytes().as_ref(), &[5u8; 8]);
    }

    #[test]
    fn test_remove_entries_with_hash_when_unused() {
        let cache = ram_cache(1024);
        let key = ImageKey::still("n", 1);
        let pinned = build(&cache, key.clone(), ram(8), 0);
        drop(build(&cache, key.clone(), ram(8).with_mipmap_level(1), 0));

        assert_eq!(cache.remove_entries_with_hash(key.hash64(), RemoveMode::WhenUnused), 2);
        assert_eq!(cache.len(), 1);
        drop(pinned);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_holder_invalidation() {
        let cache = ram_cache(1024);
        let holder = NodeHolder::new("blur");
        drop(build(&cache, ImageKey::still("blur", 1), ram(8), 0));
        drop(build(&cache, ImageKey::still("blur", 2), ram(8), 0));
        drop(build(&cache, ImageKey::still("sharpen", 1), ram(8), 0));

        assert_eq!(cache.memory_stats_for_holder(&holder).ram, 16);
        assert_eq!(cache.remove_all_entries_with_different_tree_version(&holder, 2), 1);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.remove_all_entries_for_holder(&holder), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_stats_for_holder(&holder), HolderMemoryStats::default());
    }

    #[test]
    fn test_shrinking_budget_evicts() {
        let cache = ram_cache(1000);
        for hash in 1..=5 {
            drop(build(&cache, ImageKey::still("n", hash), ram(100), 0));
        }
        cache.set_maximum_cache_size(250);
        assert!(cache.memory_cache_size() <= 250);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_disk_entries_demote_and_promote() {
        let dir = tempfile::tempdir().unwrap();
        let budget = Arc::new(FileHandleBudget::new(64));
        let cache: Cache<ImageKey, ImageParams> = Cache::new(
            CacheConfig::on_disk("disk", 1000, 0.0, dir.path()),
            budget.clone(),
        )
        .unwrap();

        let key = ImageKey::still("n", 1);
        let handle = build(&cache, key.clone(), disk(64), 9);
        assert_eq!(cache.memory_cache_size(), 64);
        assert_eq!(budget.opened(), 1);
        drop(handle);

        // releasing alone does not demote; the next trim does
        cache.clear_exceeding_entries();
        assert_eq!(cache.memory_cache_size(), 0);
        assert_eq!(cache.disk_cache_size(), 64);
        assert_eq!(budget.opened(), 0);

        let handles = cache.get(&key);
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].to_bytes().as_ref(), &[9u8; 64]);
        assert_eq!(cache.memory_cache_size(), 64);
        assert_eq!(cache.metrics().snapshot().promotions, 1);
    }

    #[test]
    fn test_clear_in_memory_portion_keeps_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache: Cache<ImageKey, ImageParams> = Cache::new(
            CacheConfig::on_disk("mixed", 1000, 1.0, dir.path()),
            Arc::new(FileHandleBudget::new(64)),
        )
        .unwrap();

        drop(build(&cache, ImageKey::still("n", 1), disk(32), 0));
        drop(build(&cache, ImageKey::still("n", 2), ram(32), 0));
        let pinned = build(&cache, ImageKey::still("n", 3), ram(32), 0);

        cache.clear_in_memory_portion();
        assert_eq!(cache.memory_cache_size(), 32);
        assert_eq!(cache.disk_cache_size(), 32);
        assert_eq!(cache.len(), 2);
        drop(pinned);
    }

    #[test]
    fn test_evicted_disk_entry_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache: Cache<ImageKey, ImageParams> = Cache::new(
            CacheConfig::on_disk("disk", 100, 0.0, dir.path()),
            Arc::new(FileHandleBudget::new(64)),
        )
        .unwrap();

        let handle = build(&cache, ImageKey::still("n", 1), disk(60), 0);
        let path = handle.payload_path().unwrap().to_path_buf();
        drop(handle);
        drop(build(&cache, ImageKey::still("n", 2), disk(60), 0));
        drop(build(&cache, ImageKey::still("n", 3), disk(60), 0));
        cache.wait_for_deleter_thread();

        assert!(!path.exists());
        assert!(cache.total_size() <= 120);
    }

    #[test]
    fn test_file_handle_ceiling_demotes_mapped_entries() {
        let dir = tempfile::tempdir().unwrap();
        let budget = Arc::new(FileHandleBudget::new(1));
        let cache: Cache<ImageKey, ImageParams> = Cache::new(
            CacheConfig::on_disk("disk", 1000, 1.0, dir.path()),
            budget.clone(),
        )
        .unwrap();

        drop(build(&cache, ImageKey::still("n", 1), disk(8), 0));
        let second = build(&cache, ImageKey::still("n", 2), disk(8), 0);
        assert_eq!(budget.opened(), 1);
        assert_eq!(cache.disk_cache_size(), 8);

        let err = cache.get_or_create(ImageKey::still("n", 3), disk(8)).unwrap_err();
        assert_matches!(err, Error::FileHandlesExhausted { .. });
        drop(second);
    }

    #[test]
    fn test_remapping_at_handle_ceiling_keeps_entry() {
        let dir = tempfile::tempdir().unwrap();
        let budget = Arc::new(FileHandleBudget::new(1));
        let cache: Cache<ImageKey, ImageParams> = Cache::new(
            CacheConfig::on_disk("disk", 1000, 0.0, dir.path()),
            budget.clone(),
        )
        .unwrap();

        let first = ImageKey::still("n", 1);
        let handle = build(&cache, first.clone(), disk(8), 5);
        let path = handle.payload_path().unwrap().to_path_buf();
        drop(handle);
        cache.clear_exceeding_entries();
        assert_eq!(cache.disk_cache_size(), 8);

        // the only descriptor is held by a pinned entry
        let second = build(&cache, ImageKey::still("n", 2), disk(8), 6);
        assert!(budget.is_capped());

        assert!(cache.get(&first).is_empty());
        let err = cache.get_or_create(first.clone(), disk(8)).unwrap_err();
        assert_matches!(err, Error::FileHandlesExhausted { .. });
        cache.wait_for_deleter_thread();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.disk_cache_size(), 8);
        assert!(path.exists());

        drop(second);
        let handles = cache.get(&first);
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].to_bytes().as_ref(), &[5u8; 8]);
        assert_eq!(budget.opened(), 1);
        assert_eq!(cache.metrics().snapshot().promotions, 1);
    }

    #[test]
    fn test_missing_payload_file_is_dropped_on_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache: Cache<ImageKey, ImageParams> = Cache::new(
            CacheConfig::on_disk("disk", 1000, 0.0, dir.path()),
            Arc::new(FileHandleBudget::new(4)),
        )
        .unwrap();

        let key = ImageKey::still("n", 1);
        let handle = build(&cache, key.clone(), disk(8), 5);
        let path = handle.payload_path().unwrap().to_path_buf();
        drop(handle);
        cache.clear_exceeding_entries();
        fs::remove_file(&path).unwrap();

        assert!(cache.get(&key).is_empty());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.disk_cache_size(), 0);
        assert!(!cache.get_or_create(key, disk(8)).unwrap().is_found());
    }

    #[test]
    fn test_handle_ceiling_reclaims_from_sibling_cache() {
        let dir = tempfile::tempdir().unwrap();
        let budget = Arc::new(FileHandleBudget::new(1));
        let viewer: Cache<ImageKey, ImageParams> = Cache::new(
            CacheConfig::on_disk("viewer", 1000, 1.0, dir.path().join("viewer")),
            budget.clone(),
        )
        .unwrap();
        let disk_cache: Cache<ImageKey, ImageParams> = Cache::new(
            CacheConfig::on_disk("disk", 1000, 1.0, dir.path().join("disk")),
            budget.clone(),
        )
        .unwrap();

        let frame = ImageKey::still("viewer", 1);
        drop(build(&viewer, frame.clone(), disk(8), 4));
        assert!(budget.is_capped());

        // an idle mapping in one cache does not block the other
        let tile = build(&disk_cache, ImageKey::still("n", 2), disk(8), 7);
        assert_eq!(budget.opened(), 1);
        assert_eq!(viewer.memory_cache_size(), 0);
        assert_eq!(viewer.disk_cache_size(), 8);
        assert_eq!(viewer.metrics().snapshot().demotions, 1);
        drop(tile);

        let handles = viewer.get(&frame);
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].to_bytes().as_ref(), &[4u8; 8]);
        assert_eq!(disk_cache.memory_cache_size(), 0);
        assert_eq!(disk_cache.disk_cache_size(), 8);
    }

    #[test]
    fn test_pinned_sibling_mappings_are_not_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let budget = Arc::new(FileHandleBudget::new(1));
        let viewer: Cache<ImageKey, ImageParams> = Cache::new(
            CacheConfig::on_disk("viewer", 1000, 1.0, dir.path().join("viewer")),
            budget.clone(),
        )
        .unwrap();
        let disk_cache: Cache<ImageKey, ImageParams> = Cache::new(
            CacheConfig::on_disk("disk", 1000, 1.0, dir.path().join("disk")),
            budget.clone(),
        )
        .unwrap();

        let frame = build(&viewer, ImageKey::still("viewer", 1), disk(8), 4);
        let err = disk_cache
            .get_or_create(ImageKey::still("n", 2), disk(8))
            .unwrap_err();
        assert_matches!(err, Error::FileHandlesExhausted { opened: 1, max: 1 });
        assert!(frame.is_resident());
        assert_eq!(viewer.memory_cache_size(), 8);
    }

    #[test]
    fn test_demoted_mapping_is_closed_after_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let budget = Arc::new(FileHandleBudget::new(4));
        let cache: Cache<ImageKey, ImageParams> = Cache::new(
            CacheConfig::on_disk("disk", 1000, 1.0, dir.path()),
            budget.clone(),
        )
        .unwrap();
        let key = ImageKey::still("n", 1);
        drop(build(&cache, key.clone(), disk(8), 3));

        let shared = &cache.shared;
        let mut index = shared.index.lock();
        assert!(shared.demote_one_mapped(&mut index));
        // slot is back before the mapping is closed
        assert_eq!(budget.opened(), 0);
        assert_eq!(index.unmapped.len(), 1);
        shared.unlock(index);
        assert!(shared.index.lock().unmapped.is_empty());

        let handles = cache.get(&key);
        assert_eq!(handles[0].to_bytes().as_ref(), &[3u8; 8]);
    }

    #[test]
    fn test_disk_entries_need_directory() {
        let cache = ram_cache(1000);
        let err = cache.get_or_create(ImageKey::still("n", 1), disk(8)).unwrap_err();
        assert_matches!(err, Error::Config(_));
    }

    mod accounting {
        use proptest::prelude::*;

        use super::*;

        #[derive(Debug, Clone)]
        enum Op {
            Build { hash: u64, size: i32, on_disk: bool, hold: bool },
            Get(u64),
            Release,
            Remove(u64),
            Evict,
            ClearMemory,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                4 => (0u64..12, 1i32..=100, any::<bool>(), any::<bool>()).prop_map(
                    |(hash, size, on_disk, hold)| Op::Build { hash, size, on_disk, hold }
                ),
                2 => (0u64..12).prop_map(Op::Get),
                1 => Just(Op::Release),
                1 => (0u64..12).prop_map(Op::Remove),
                1 => Just(Op::Evict),
                1 => Just(Op::ClearMemory),
            ]
        }

        fn check(cache: &Cache<ImageKey, ImageParams>) -> std::result::Result<(), TestCaseError> {
            let index = cache.shared.index.lock();
            let mut memory = 0;
            let mut disk = 0;
            let mut linked = 0;
            for record in index.records.values() {
                match record.residence {
                    Residence::Memory => memory += record.entry.size(),
                    Residence::Disk => disk += record.entry.size(),
                }
                let evictable = record.pins == 0 && record.is_ready();
                prop_assert_eq!(record.lru_tick.is_some(), evictable);
                if record.lru_tick.is_some() {
                    linked += 1;
                }
            }
            prop_assert_eq!(index.memory_size, memory);
            prop_assert_eq!(index.disk_size, disk);
            prop_assert_eq!(index.memory_lru.len() + index.disk_lru.len(), linked);
            Ok(())
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(48))]

            #[test]
            fn prop_accounting_matches_footprints(ops in prop::collection::vec(op(), 1..40)) {
                let dir = tempfile::tempdir().unwrap();
                let cache: Cache<ImageKey, ImageParams> = Cache::new(
                    CacheConfig::on_disk("prop", 300, 0.5, dir.path()),
                    Arc::new(FileHandleBudget::new(64)),
                )
                .unwrap();
                let mut held = Vec::new();

                for op in ops {
                    match op {
                        Op::Build { hash, size, on_disk, hold } => {
                            let params = if on_disk { disk(size) } else { ram(size) };
                            match cache.get_or_create(ImageKey::still("p", hash), params) {
                                Ok(Lookup::Created(guard)) => {
                                    let handle = guard.finish();
                                    if hold {
                                        held.push(handle);
                                    }
                                }
                                Ok(Lookup::Found(handle)) => {
                                    if hold {
                                        held.push(handle);
                                    }
                                }
                                Err(_) => {}
                            }
                        }
                        Op::Get(hash) => {
                            held.extend(cache.get(&ImageKey::still("p", hash)));
                        }
                        Op::Release => held.clear(),
                        Op::Remove(hash) => {
                            cache.remove_entries_with_hash(
                                ImageKey::still("p", hash).hash64(),
                                RemoveMode::WhenUnused,
                            );
                        }
                        Op::Evict => {
                            cache.evict_lru_in_memory_entry();
                        }
                        Op::ClearMemory => cache.clear_in_memory_portion(),
                    }
                    check(&cache)?;
                }

                held.clear();
                check(&cache)?;
                cache.clear();
                prop_assert_eq!(cache.total_size(), 0);
                prop_assert!(cache.is_empty());
            }
        }
    }
}
