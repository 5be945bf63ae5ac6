//! Memory-mapped payload storage
//!
//! A mapped entry owns its backing file, the read/write mapping and one slot of
//! the process-wide [`FileHandleBudget`](super::FileHandleBudget). Dropping the
//! mapping closes the file and returns the slot; the file itself stays on disk
//! until the owning entry is discarded.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use super::file_budget::FileHandleSlot;
use crate::error::{Error, Result};

/// Read/write mapping of one payload file
#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    len: usize,
    map: MmapMut,
    _file: File,
    slot: Option<FileHandleSlot>,
}

impl MappedFile {
    /// Create (or truncate) the payload file and map it
    pub(crate) fn create(path: &Path, len: usize, slot: FileHandleSlot) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| Error::CacheDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        // zero-length mappings are rejected by some platforms
        file.set_len(len.max(1) as u64)?;
        Self::map(path, file, len, slot)
    }

    /// Re-map an existing payload file
    pub(crate) fn open(path: &Path, len: usize, slot: FileHandleSlot) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk < len as u64 {
            return Err(Error::Persistence {
                path: path.to_path_buf(),
                reason: format!("file holds {} bytes, expected {}", on_disk, len),
            });
        }
        Self::map(path, file, len, slot)
    }

    fn map(path: &Path, file: File, len: usize, slot: FileHandleSlot) -> Result<Self> {
        // SAFETY: the file lives in the cache's private directory and is only
        // mutated through this mapping while the owning entry holds it.
        let map = unsafe { MmapOptions::new().len(len.max(1)).map_mut(&file) }.map_err(
            |source| Error::MappingFailed {
                path: path.to_path_buf(),
                source,
            },
        )?;
        Ok(Self {
            path: path.to_path_buf(),
            len,
            map,
            _file: file,
            slot: Some(slot),
        })
    }

    /// Write dirty pages back to the file
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Return the budget slot ahead of closing the file
    ///
    /// Lets a demotion hand its slot to the next opener while the flush and
    /// unmap of this mapping happen outside the index lock.
    pub(crate) fn release_handle_slot(&mut self) {
        self.slot.take();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::storage::FileHandleBudget;

    #[test]
    fn test_create_write_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ab").join("00000000000000ab.0");
        let budget = Arc::new(FileHandleBudget::new(4));

        let mut mapped = MappedFile::create(&path, 16, budget.acquire().unwrap()).unwrap();
        assert_eq!(budget.opened(), 1);
        mapped.as_mut_slice().copy_from_slice(&[7u8; 16]);
        mapped.flush().unwrap();
        drop(mapped);
        assert_eq!(budget.opened(), 0);
        assert!(path.exists());

        let reopened = MappedFile::open(&path, 16, budget.acquire().unwrap()).unwrap();
        assert_eq!(reopened.as_slice(), &[7u8; 16]);
    }

    #[test]
    fn test_reopen_rejects_short_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short");
        std::fs::write(&path, [0u8; 4]).unwrap();
        let budget = Arc::new(FileHandleBudget::new(4));

        let err = MappedFile::open(&path, 16, budget.acquire().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Persistence { .. }));
        // slot returned on failure
        assert_eq!(budget.opened(), 0);
    }

    #[test]
    fn test_released_slot_keeps_mapping_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("early");
        let budget = Arc::new(FileHandleBudget::new(1));

        let mut mapped = MappedFile::create(&path, 4, budget.acquire().unwrap()).unwrap();
        mapped.as_mut_slice().copy_from_slice(&[3u8; 4]);
        mapped.release_handle_slot();
        assert_eq!(budget.opened(), 0);
        assert_eq!(mapped.as_slice(), &[3u8; 4]);

        mapped.flush().unwrap();
        drop(mapped);
        assert_eq!(budget.opened(), 0);
        assert_eq!(std::fs::read(&path).unwrap(), vec![3u8; 4]);
    }

    #[test]
    fn test_zero_length_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        let budget = Arc::new(FileHandleBudget::new(1));

        let mapped = MappedFile::create(&path, 0, budget.acquire().unwrap()).unwrap();
        assert!(mapped.as_slice().is_empty());
    }
}
