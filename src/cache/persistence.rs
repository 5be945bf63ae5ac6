//! Cache persistence
//!
//! Each file-backed cache writes `index.json` into its own directory: the key,
//! params and file slot of every ready entry. Payload bytes are already in
//! their files, so restore only re-registers them as disk-resident.
//!
//! The cache root also carries `cache_version.json`; a mismatch with
//! [`CACHE_FORMAT_VERSION`] means the layout changed and the whole tree is
//! wiped.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::key::CacheKey;
use super::params::CacheParams;
use super::store::Cache;
use super::{CACHE_FORMAT_VERSION, CACHE_SUBDIR_COUNT};
use crate::error::{Error, Result};

pub const INDEX_FILE_NAME: &str = "index.json";
pub const VERSION_FILE_NAME: &str = "cache_version.json";

#[derive(Debug, Serialize, Deserialize)]
struct PersistedIndex<K, P> {
    format_version: u32,
    cache_name: String,
    saved_at: DateTime<Utc>,
    entries: Vec<PersistedEntry<K, P>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry<K, P> {
    key: K,
    params: P,
    hash: u64,
    file_slot: u64,
}

/// Version stamp of the cache root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheVersionRecord {
    pub version: u32,
    pub written_at: DateTime<Utc>,
}

pub fn index_path(dir: &Path) -> PathBuf {
    dir.join(INDEX_FILE_NAME)
}

/// Write `bytes` to `path` through a temporary sibling and a rename
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Save the index of a file-backed cache; returns the number of entries written
pub fn save_index<K: CacheKey, P: CacheParams>(cache: &Cache<K, P>) -> Result<usize> {
    let Some(dir) = cache.directory() else {
        return Ok(0);
    };

    let mut entries = Vec::new();
    for entry in cache.persistable_entries() {
        if let Err(e) = entry.flush() {
            warn!("{}: not persisting entry {}: {}", cache.name(), entry.id(), e);
            continue;
        }
        entries.push(PersistedEntry {
            key: entry.key().clone(),
            params: entry.params().clone(),
            hash: entry.hash(),
            file_slot: entry.file_slot(),
        });
    }

    let count = entries.len();
    let index = PersistedIndex {
        format_version: CACHE_FORMAT_VERSION,
        cache_name: cache.name().to_string(),
        saved_at: Utc::now(),
        entries,
    };
    let bytes = serde_json::to_vec(&index)?;
    write_atomically(&index_path(dir), &bytes)?;

    info!("{}: saved {} entries", cache.name(), count);
    Ok(count)
}

/// Re-register the entries of a saved index; returns the number restored
///
/// A missing index restores nothing. Entries whose payload file is gone or
/// truncated are skipped.
pub fn restore_index<K: CacheKey, P: CacheParams>(cache: &Cache<K, P>) -> Result<usize> {
    let Some(dir) = cache.directory() else {
        return Ok(0);
    };
    let path = index_path(dir);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{}: no saved index", cache.name());
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    let index: PersistedIndex<K, P> =
        serde_json::from_slice(&bytes).map_err(|e| Error::Persistence {
            path: path.clone(),
            reason: e.to_string(),
        })?;
    if index.format_version != CACHE_FORMAT_VERSION {
        return Err(Error::Persistence {
            path,
            reason: format!(
                "index format {} does not match {}",
                index.format_version, CACHE_FORMAT_VERSION
            ),
        });
    }

    let total = index.entries.len();
    let mut restored = 0;
    for entry in index.entries {
        if entry.key.hash64() != entry.hash {
            debug!("{}: skipping entry with stale hash {:016x}", cache.name(), entry.hash);
            continue;
        }
        if cache.restore_entry(entry.key, entry.params, entry.file_slot) {
            restored += 1;
        }
    }
    cache.clear_exceeding_entries();

    info!(
        "{}: restored {}/{} entries saved at {}",
        cache.name(),
        restored,
        total,
        index.saved_at
    );
    Ok(restored)
}

/// Version recorded under the cache root, if any
pub fn read_cache_version(root: &Path) -> Option<u32> {
    let bytes = fs::read(root.join(VERSION_FILE_NAME)).ok()?;
    match serde_json::from_slice::<CacheVersionRecord>(&bytes) {
        Ok(record) => Some(record.version),
        Err(e) => {
            warn!("Unreadable cache version record: {}", e);
            None
        }
    }
}

pub fn write_cache_version(root: &Path) -> Result<()> {
    let record = CacheVersionRecord {
        version: CACHE_FORMAT_VERSION,
        written_at: Utc::now(),
    };
    write_atomically(&root.join(VERSION_FILE_NAME), &serde_json::to_vec_pretty(&record)?)
}

/// Delete everything under `root`, then recreate the per-cache directories
/// with their `00`..`ff` shards and stamp the current version
pub fn wipe_and_create_disk_cache_structure(root: &Path, cache_names: &[&str]) -> Result<()> {
    match fs::remove_dir_all(root) {
        Ok(()) => info!("Wiped cache directory {}", root.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(source) => {
            return Err(Error::CacheDirectory {
                path: root.to_path_buf(),
                source,
            })
        }
    }

    for name in cache_names {
        let dir = root.join(name);
        for shard in 0..CACHE_SUBDIR_COUNT {
            let shard_dir = dir.join(format!("{:02x}", shard));
            fs::create_dir_all(&shard_dir).map_err(|source| Error::CacheDirectory {
                path: shard_dir,
                source,
            })?;
        }
    }
    fs::create_dir_all(root).map_err(|source| Error::CacheDirectory {
        path: root.to_path_buf(),
        source,
    })?;
    write_cache_version(root)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use super::*;
    use crate::cache::key::ImageKey;
    use crate::cache::params::{BitDepth, ImageParams, RectI};
    use crate::cache::storage::FileHandleBudget;
    use crate::cache::store::{CacheConfig, Lookup};

    fn disk(bytes: i32) -> ImageParams {
        ImageParams::on_disk(RectI::new(0, 0, bytes, 1), 1, BitDepth::Byte)
    }

    fn open(dir: &Path) -> Cache<ImageKey, ImageParams> {
        Cache::new(
            CacheConfig::on_disk("DiskCache", 1 << 20, 0.0, dir),
            Arc::new(FileHandleBudget::new(64)),
        )
        .unwrap()
    }

    fn fill(cache: &Cache<ImageKey, ImageParams>, hash: u64, byte: u8) {
        match cache.get_or_create(ImageKey::still("n", hash), disk(32)).unwrap() {
            Lookup::Created(mut guard) => {
                guard.write(|buf| buf.fill(byte));
                drop(guard.finish());
            }
            Lookup::Found(_) => panic!("expected a miss"),
        }
    }

    #[test]
    fn test_save_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = open(dir.path());
            fill(&cache, 1, 0xaa);
            fill(&cache, 2, 0xbb);
            assert_eq!(save_index(&cache).unwrap(), 2);
        }

        let cache = open(dir.path());
        assert_eq!(restore_index(&cache).unwrap(), 2);
        assert_eq!(cache.disk_cache_size(), 64);
        assert_eq!(cache.memory_cache_size(), 0);

        let handles = cache.get(&ImageKey::still("n", 2));
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].to_bytes().as_ref(), &[0xbb; 32]);
    }

    #[test]
    fn test_restore_skips_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = open(dir.path());
            fill(&cache, 1, 1);
            fill(&cache, 2, 2);
            save_index(&cache).unwrap();
            let handle = cache.get(&ImageKey::still("n", 1)).pop().unwrap();
            fs::remove_file(handle.payload_path().unwrap()).unwrap();
        }

        let cache = open(dir.path());
        assert_eq!(restore_index(&cache).unwrap(), 1);
        assert!(cache.get(&ImageKey::still("n", 1)).is_empty());
    }

    #[test]
    fn test_restore_without_index() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path());
        assert_eq!(restore_index(&cache).unwrap(), 0);
    }

    #[test]
    fn test_restore_rejects_other_format() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path());
        let stale = serde_json::json!({
            "format_version": CACHE_FORMAT_VERSION + 1,
            "cache_name": "DiskCache",
            "saved_at": Utc::now(),
            "entries": [],
        });
        fs::write(index_path(dir.path()), stale.to_string()).unwrap();

        assert_matches!(restore_index(&cache), Err(Error::Persistence { .. }));
    }

    #[test]
    fn test_restore_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path());
        fs::write(index_path(dir.path()), b"not json").unwrap();

        assert_matches!(restore_index(&cache), Err(Error::Persistence { .. }));
    }

    #[test]
    fn test_wipe_creates_shards_and_version() {
        let root = tempfile::tempdir().unwrap();
        let stray = root.path().join("stray.bin");
        fs::write(&stray, b"x").unwrap();

        wipe_and_create_disk_cache_structure(root.path(), &["DiskCache", "ViewerCache"]).unwrap();

        assert!(!stray.exists());
        assert!(root.path().join("DiskCache").join("00").is_dir());
        assert!(root.path().join("ViewerCache").join("ff").is_dir());
        assert_eq!(read_cache_version(root.path()), Some(CACHE_FORMAT_VERSION));
    }

    #[test]
    fn test_unreadable_version_record() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join(VERSION_FILE_NAME), b"{").unwrap();
        assert_eq!(read_cache_version(root.path()), None);
    }
}
