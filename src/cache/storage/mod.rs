//! Entry Storage Backends
//!
//! Turns entry params into addressable bytes:
//!
//! - [`RamBuffer`]: heap allocation, charged against a cache's memory budget
//! - [`MappedFile`]: memory-mapped file under the cache directory, charged against
//!   the memory budget while mapped, the disk budget while unmapped, and one slot
//!   of the shared [`FileHandleBudget`] while open
//!
//! Both report construction failures (OOM, disk full, permissions, descriptor
//! ceiling) as errors so the cache can evict and retry instead of crashing.

mod file_budget;
mod mmap;
mod ram;

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub(crate) use file_budget::HandleReclaimer;
pub use file_budget::{FileHandleBudget, DEFAULT_MAX_CACHE_FILES};
pub use mmap::MappedFile;
pub use ram::RamBuffer;

use crate::error::Result;

/// Allocated payload bytes of an entry
#[derive(Debug)]
pub enum Storage {
    Ram(RamBuffer),
    Mapped(MappedFile),
}

impl Storage {
    /// Allocate a heap buffer
    pub fn allocate_ram(size: usize) -> Result<Self> {
        RamBuffer::allocate(size).map(Storage::Ram)
    }

    /// Create and map a fresh payload file
    pub fn create_mapped(path: &Path, size: usize, budget: &Arc<FileHandleBudget>) -> Result<Self> {
        let slot = budget.acquire()?;
        MappedFile::create(path, size, slot).map(Storage::Mapped)
    }

    /// Map an existing payload file
    pub fn open_mapped(path: &Path, size: usize, budget: &Arc<FileHandleBudget>) -> Result<Self> {
        let slot = budget.acquire()?;
        MappedFile::open(path, size, slot).map(Storage::Mapped)
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Ram(buf) => buf.as_slice(),
            Storage::Mapped(map) => map.as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Storage::Ram(buf) => buf.as_mut_slice(),
            Storage::Mapped(map) => map.as_mut_slice(),
        }
    }

    /// Give a mapped payload's descriptor slot back to the budget early
    pub(crate) fn release_handle_slot(&mut self) {
        if let Storage::Mapped(map) = self {
            map.release_handle_slot();
        }
    }

    /// Flush mapped pages; no-op for heap buffers
    pub fn flush(&self) -> Result<()> {
        match self {
            Storage::Ram(_) => Ok(()),
            Storage::Mapped(map) => map.flush(),
        }
    }
}

/// Deterministic payload file location for an entry
///
/// `<dir>/<hh>/<hash:016x>.<slot>`, where `hh` is the top byte of the hash and
/// `slot` is never reused within a cache, so entries sharing a hash never
/// share a file.
pub fn payload_path(dir: &Path, hash: u64, slot: u64) -> PathBuf {
    dir.join(format!("{:02x}", hash >> 56))
        .join(format!("{:016x}.{}", hash, slot))
}
