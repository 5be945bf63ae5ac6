//! Cache Entry Types
//!
//! A [`CacheEntry`] is the shared record behind every handle: immutable
//! identity (key, params, hash, file slot) plus a payload guarded by its own
//! read/write lock. The index mutex is always taken before an entry lock,
//! never the other way around.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use super::key::CacheKey;
use super::lru::EntryId;
use super::params::{CacheParams, StorageMode};
use super::storage::Storage;
use crate::error::Result;

/// One cached payload
pub struct CacheEntry<K: CacheKey, P: CacheParams> {
    id: EntryId,
    key: K,
    params: P,
    hash: u64,
    file_slot: u64,
    payload_path: Option<PathBuf>,
    storage: RwLock<Option<Storage>>,
    ready: AtomicBool,
    discard: AtomicBool,
}

impl<K: CacheKey, P: CacheParams> CacheEntry<K, P> {
    pub(crate) fn new(
        id: EntryId,
        key: K,
        params: P,
        hash: u64,
        file_slot: u64,
        payload_path: Option<PathBuf>,
    ) -> Self {
        Self {
            id,
            key,
            params,
            hash,
            file_slot,
            payload_path,
            storage: RwLock::new(None),
            ready: AtomicBool::new(false),
            discard: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn params(&self) -> &P {
        &self.params
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn size(&self) -> usize {
        self.params.size_in_bytes()
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.params.storage_mode()
    }

    pub fn file_slot(&self) -> u64 {
        self.file_slot
    }

    /// Backing file, for disk-backed entries
    pub fn payload_path(&self) -> Option<&Path> {
        self.payload_path.as_deref()
    }

    /// Whether the builder has published the payload
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Whether the payload is currently addressable
    pub fn is_resident(&self) -> bool {
        self.storage.read().is_some()
    }

    /// Run `f` over the payload bytes
    ///
    /// Returns `None` if the payload is not resident, which only happens for
    /// entries that were demoted while unpinned.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let guard = self.storage.read();
        guard.as_ref().map(|storage| f(storage.as_slice()))
    }

    /// Run `f` over the mutable payload bytes
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let mut guard = self.storage.write();
        guard.as_mut().map(|storage| f(storage.as_mut_slice()))
    }

    /// Flush mapped pages to the backing file
    pub fn flush(&self) -> Result<()> {
        match self.storage.read().as_ref() {
            Some(storage) => storage.flush(),
            None => Ok(()),
        }
    }

    pub(crate) fn install(&self, storage: Storage) {
        *self.storage.write() = Some(storage);
    }

    /// Detach the payload, keeping the file
    ///
    /// The caller flushes and drops the returned storage once it no longer
    /// holds the index lock.
    pub(crate) fn take_storage(&self) -> Option<Storage> {
        self.storage.write().take()
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Delete the backing file once the last reference goes away
    pub(crate) fn mark_discarded(&self) {
        self.discard.store(true, Ordering::Release);
    }
}

impl<K: CacheKey, P: CacheParams> Drop for CacheEntry<K, P> {
    fn drop(&mut self) {
        // the mapping must be gone before its file is unlinked
        self.storage.get_mut().take();

        if !self.discard.load(Ordering::Acquire) {
            return;
        }
        if let Some(path) = &self.payload_path {
            match fs::remove_file(path) {
                Ok(()) => debug!("Removed cache file {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove cache file {}: {}", path.display(), e),
            }
        }
    }
}

impl<K: CacheKey, P: CacheParams> std::fmt::Debug for CacheEntry<K, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("params", &self.params)
            .field("hash", &format_args!("{:016x}", self.hash))
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchState {
    Building,
    Completed,
    Failed,
}

/// Wakes threads waiting on an in-flight build
#[derive(Debug)]
pub(crate) struct BuildLatch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl BuildLatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::Building),
            cond: Condvar::new(),
        }
    }

    /// Block until the build settles; true if it completed
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while *state == LatchState::Building {
            self.cond.wait(&mut state);
        }
        *state == LatchState::Completed
    }

    pub fn complete(&self) {
        self.settle(LatchState::Completed);
    }

    pub fn fail(&self) {
        self.settle(LatchState::Failed);
    }

    fn settle(&self, outcome: LatchState) {
        let mut state = self.state.lock();
        if *state == LatchState::Building {
            *state = outcome;
            self.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::cache::key::ImageKey;
    use crate::cache::params::{BitDepth, ImageParams, RectI};
    use crate::cache::storage::{payload_path, FileHandleBudget};

    fn params() -> ImageParams {
        ImageParams::in_ram(RectI::new(0, 0, 2, 2), 1, BitDepth::Byte)
    }

    #[test]
    fn test_read_write_resident_payload() {
        let entry = CacheEntry::new(EntryId(1), ImageKey::still("n", 1), params(), 1, 0, None);
        assert!(!entry.is_resident());
        assert_eq!(entry.read(|b| b.len()), None);

        entry.install(Storage::allocate_ram(4).unwrap());
        entry.write(|b| b.copy_from_slice(&[1, 2, 3, 4]));
        assert_eq!(entry.read(|b| b.to_vec()), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn test_discarded_entry_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let budget = Arc::new(FileHandleBudget::new(4));
        let path = payload_path(dir.path(), 7, 0);
        let params = ImageParams::on_disk(RectI::new(0, 0, 2, 2), 1, BitDepth::Byte);

        let entry = CacheEntry::new(
            EntryId(1),
            ImageKey::still("n", 7),
            params,
            7,
            0,
            Some(path.clone()),
        );
        entry.install(Storage::create_mapped(&path, 4, &budget).unwrap());
        entry.mark_discarded();
        drop(entry);

        assert!(!path.exists());
        assert_eq!(budget.opened(), 0);
    }

    #[test]
    fn test_kept_entry_leaves_file() {
        let dir = tempfile::tempdir().unwrap();
        let budget = Arc::new(FileHandleBudget::new(4));
        let path = payload_path(dir.path(), 8, 0);
        let params = ImageParams::on_disk(RectI::new(0, 0, 2, 2), 1, BitDepth::Byte);

        let entry = CacheEntry::new(EntryId(1), ImageKey::still("n", 8), params, 8, 0, Some(path.clone()));
        entry.install(Storage::create_mapped(&path, 4, &budget).unwrap());
        let storage = entry.take_storage().unwrap();
        assert!(!entry.is_resident());
        assert_eq!(budget.opened(), 1);
        storage.flush().unwrap();
        drop(storage);
        assert_eq!(budget.opened(), 0);
        drop(entry);

        assert!(path.exists());
    }

    #[test]
    fn test_latch_wakes_all_waiters() {
        let latch = Arc::new(BuildLatch::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.wait())
            })
            .collect();

        latch.complete();
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }

    #[test]
    fn test_latch_settles_once() {
        let latch = BuildLatch::new();
        latch.fail();
        latch.complete();
        assert!(!latch.wait());
    }
}
