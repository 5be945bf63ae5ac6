//! Cache Manager
//!
//! Owns the three caches of the render engine and everything they share:
//!
//! - **Node cache**: computed image tiles, heap-resident
//! - **Disk cache**: image tiles of disk-cache nodes, memory-mapped
//! - **Viewer cache**: rendered frames; a playback share of RAM stays mapped
//!
//! The manager is an explicit context object: construct it once, hand out
//! `Arc<CacheManager>`, and call [`shutdown`](CacheManager::shutdown) before
//! exit.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::holder::{CacheEntryHolder, HolderKind};
use super::key::{FrameKey, ImageKey};
use super::metrics::CacheStats;
use super::params::{FrameParams, ImageParams};
use super::persistence;
use super::pressure::{PressureMonitor, SysinfoMemory, SystemMemory};
use super::storage::FileHandleBudget;
use super::store::{Cache, CacheConfig, EntryHandle, HolderMemoryStats, Lookup, RemoveMode};
use super::{CACHE_FORMAT_VERSION, CACHE_LIMIT_PERCENT};
use crate::error::Result;
use crate::settings::CacheSettings;

pub const NODE_CACHE_NAME: &str = "NodeCache";
pub const DISK_CACHE_NAME: &str = "DiskCache";
pub const VIEWER_CACHE_NAME: &str = "ViewerCache";

pub type ImageHandle = EntryHandle<ImageKey, ImageParams>;
pub type FrameHandle = EntryHandle<FrameKey, FrameParams>;

/// Per-cache budgets derived from settings and physical RAM
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheBudgets {
    pub node_size: usize,
    pub disk_size: usize,
    pub viewer_size: usize,
    pub viewer_in_memory_fraction: f64,
}

impl CacheBudgets {
    pub fn compute(settings: &CacheSettings, total_ram: u64) -> Self {
        let max_ram = (settings.ram_maximum_fraction * total_ram as f64) as u64;
        let playback = (max_ram as f64 * settings.playback_ram_fraction) as u64;
        let viewer_size = settings.maximum_viewer_disk_cache_size + playback;
        let viewer_in_memory_fraction = if viewer_size == 0 {
            0.0
        } else {
            playback as f64 / viewer_size as f64
        };
        Self {
            node_size: max_ram.saturating_sub(playback) as usize,
            disk_size: settings.maximum_disk_cache_node_size as usize,
            viewer_size: viewer_size as usize,
            viewer_in_memory_fraction,
        }
    }
}

/// Snapshot of every cache plus the shared file budget
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub caches: Vec<CacheStats>,
    pub open_cache_files: usize,
    pub max_open_cache_files: usize,
    pub total_memory_size: usize,
}

/// Owner of the node, disk and viewer caches
pub struct CacheManager {
    settings: Mutex<CacheSettings>,
    root: PathBuf,
    memory: Arc<dyn SystemMemory>,
    file_handles: Arc<FileHandleBudget>,
    node_cache: Cache<ImageKey, ImageParams>,
    disk_cache: Cache<ImageKey, ImageParams>,
    viewer_cache: Cache<FrameKey, FrameParams>,
    node_cache_almost_full: AtomicBool,
}

impl CacheManager {
    /// Create the manager using live system memory figures
    pub fn new(settings: CacheSettings) -> Result<Self> {
        Self::with_system_memory(settings, Arc::new(SysinfoMemory::new()))
    }

    pub fn with_system_memory(
        settings: CacheSettings,
        memory: Arc<dyn SystemMemory>,
    ) -> Result<Self> {
        settings.validate()?;
        let root = settings.cache_root();
        let file_handles = Arc::new(match settings.max_open_cache_files {
            Some(max) => FileHandleBudget::new(max),
            None => FileHandleBudget::from_system_limit(),
        });
        let budgets = CacheBudgets::compute(&settings, memory.total_ram());

        info!("Initializing caches under {}", root.display());
        debug!("Cache budgets: {:?}", budgets);

        let node_cache = Cache::new(
            CacheConfig::on_disk(NODE_CACHE_NAME, budgets.node_size, 1.0, root.join(NODE_CACHE_NAME)),
            Arc::clone(&file_handles),
        )?;
        let disk_cache = Cache::new(
            CacheConfig::on_disk(DISK_CACHE_NAME, budgets.disk_size, 0.0, root.join(DISK_CACHE_NAME)),
            Arc::clone(&file_handles),
        )?;
        let viewer_cache = Cache::new(
            CacheConfig::on_disk(
                VIEWER_CACHE_NAME,
                budgets.viewer_size,
                budgets.viewer_in_memory_fraction,
                root.join(VIEWER_CACHE_NAME),
            ),
            Arc::clone(&file_handles),
        )?;

        Ok(Self {
            settings: Mutex::new(settings),
            root,
            memory,
            file_handles,
            node_cache,
            disk_cache,
            viewer_cache,
            node_cache_almost_full: AtomicBool::new(false),
        })
    }

    pub fn cache_root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> CacheSettings {
        self.settings.lock().clone()
    }

    pub fn node_cache(&self) -> &Cache<ImageKey, ImageParams> {
        &self.node_cache
    }

    pub fn disk_cache(&self) -> &Cache<ImageKey, ImageParams> {
        &self.disk_cache
    }

    pub fn viewer_cache(&self) -> &Cache<FrameKey, FrameParams> {
        &self.viewer_cache
    }

    pub fn budgets(&self) -> CacheBudgets {
        CacheBudgets::compute(&self.settings.lock(), self.memory.total_ram())
    }

    // =========================================================================
    // Settings
    // =========================================================================

    fn update_settings(&self, update: impl FnOnce(&mut CacheSettings)) -> Result<()> {
        let budgets = {
            let mut settings = self.settings.lock();
            let mut next = settings.clone();
            update(&mut next);
            next.validate()?;
            *settings = next;
            CacheBudgets::compute(&settings, self.memory.total_ram())
        };
        self.apply_budgets(budgets);
        Ok(())
    }

    fn apply_budgets(&self, budgets: CacheBudgets) {
        debug!("Applying cache budgets: {:?}", budgets);
        self.node_cache.set_maximum_cache_size(budgets.node_size);
        self.disk_cache.set_maximum_cache_size(budgets.disk_size);
        self.viewer_cache
            .set_maximum_in_memory_fraction(budgets.viewer_in_memory_fraction);
        self.viewer_cache.set_maximum_cache_size(budgets.viewer_size);
    }

    pub fn set_ram_maximum_fraction(&self, fraction: f64) -> Result<()> {
        self.update_settings(|s| s.ram_maximum_fraction = fraction)
    }

    pub fn set_playback_ram_fraction(&self, fraction: f64) -> Result<()> {
        self.update_settings(|s| s.playback_ram_fraction = fraction)
    }

    pub fn set_unreachable_ram_fraction(&self, fraction: f64) -> Result<()> {
        self.update_settings(|s| s.unreachable_ram_fraction = fraction)
    }

    pub fn set_maximum_viewer_disk_space(&self, bytes: u64) -> Result<()> {
        self.update_settings(|s| s.maximum_viewer_disk_cache_size = bytes)
    }

    pub fn set_maximum_disk_cache_space(&self, bytes: u64) -> Result<()> {
        self.update_settings(|s| s.maximum_disk_cache_node_size = bytes)
    }

    // =========================================================================
    // Access
    // =========================================================================

    pub fn get_image(&self, key: &ImageKey) -> Vec<ImageHandle> {
        self.node_cache.get(key)
    }

    pub fn get_image_or_create(
        &self,
        key: ImageKey,
        params: ImageParams,
    ) -> Result<Lookup<ImageKey, ImageParams>> {
        let lookup = self.node_cache.get_or_create(key, params)?;
        if !lookup.is_found() {
            self.is_node_cache_almost_full();
        }
        Ok(lookup)
    }

    pub fn get_image_from_disk_cache(&self, key: &ImageKey) -> Vec<ImageHandle> {
        self.disk_cache.get(key)
    }

    pub fn get_image_or_create_from_disk_cache(
        &self,
        key: ImageKey,
        params: ImageParams,
    ) -> Result<Lookup<ImageKey, ImageParams>> {
        self.disk_cache.get_or_create(key, params)
    }

    /// Frame for `key`; frames are unique per key
    pub fn get_texture(&self, key: &FrameKey) -> Option<FrameHandle> {
        let mut handles = self.viewer_cache.get(key);
        if handles.len() > 1 {
            warn!(
                "Viewer cache holds {} frames for one key of {}",
                handles.len(),
                key.holder_id
            );
        }
        if handles.is_empty() {
            None
        } else {
            Some(handles.swap_remove(0))
        }
    }

    pub fn get_texture_or_create(
        &self,
        key: FrameKey,
        params: FrameParams,
    ) -> Result<Lookup<FrameKey, FrameParams>> {
        self.viewer_cache.get_or_create(key, params)
    }

    pub fn remove_from_node_cache(&self, handle: ImageHandle) {
        self.node_cache.remove_entry(handle);
    }

    pub fn remove_from_node_cache_with_hash(&self, hash: u64) -> usize {
        self.node_cache.remove_entries_with_hash(hash, RemoveMode::WhenUnused)
    }

    pub fn remove_from_disk_cache(&self, handle: ImageHandle) {
        self.disk_cache.remove_entry(handle);
    }

    pub fn remove_from_viewer_cache(&self, handle: FrameHandle) {
        self.viewer_cache.remove_entry(handle);
    }

    // =========================================================================
    // Holders
    // =========================================================================

    /// Bytes a holder occupies across the caches its entries are routed to
    pub fn memory_stats_for_holder(&self, holder: &dyn CacheEntryHolder) -> HolderMemoryStats {
        let mut stats = self.node_cache.memory_stats_for_holder(holder);
        stats += self.disk_cache.memory_stats_for_holder(holder);
        if holder.kind() == HolderKind::Viewer {
            stats += self.viewer_cache.memory_stats_for_holder(holder);
        }
        stats
    }

    /// Drop a holder's node and disk tiles built for another tree version
    pub fn remove_all_images_with_different_tree_version(
        &self,
        holder: &dyn CacheEntryHolder,
        tree_version: u64,
    ) -> usize {
        self.node_cache
            .remove_all_entries_with_different_tree_version(holder, tree_version)
            + self
                .disk_cache
                .remove_all_entries_with_different_tree_version(holder, tree_version)
    }

    /// Drop a viewer holder's frames built for another tree version
    pub fn remove_all_textures_with_different_tree_version(
        &self,
        holder: &dyn CacheEntryHolder,
        tree_version: u64,
    ) -> usize {
        self.viewer_cache
            .remove_all_entries_with_different_tree_version(holder, tree_version)
    }

    /// Drop everything a holder produced, e.g. when its node is deleted
    pub fn remove_all_cache_entries_for_holder(&self, holder: &dyn CacheEntryHolder) -> usize {
        let mut removed = self.node_cache.remove_all_entries_for_holder(holder)
            + self.disk_cache.remove_all_entries_for_holder(holder);
        if holder.kind() == HolderKind::Viewer {
            removed += self.viewer_cache.remove_all_entries_for_holder(holder);
        }
        removed
    }

    // =========================================================================
    // Clearing
    // =========================================================================

    pub fn clear_playback_cache(&self) {
        self.viewer_cache.clear_in_memory_portion();
    }

    pub fn clear_disk_cache(&self) {
        self.viewer_cache.clear();
        self.disk_cache.clear();
    }

    pub fn clear_node_cache(&self) {
        self.node_cache.clear();
    }

    pub fn clear_all_caches(&self) {
        self.clear_disk_cache();
        self.clear_node_cache();
    }

    pub fn clear_exceeding_entries_from_node_cache(&self) {
        self.node_cache.clear_exceeding_entries();
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Persist every cache index; failures are logged, never returned
    pub fn save_caches(&self) {
        if let Err(e) = persistence::save_index(&self.node_cache) {
            warn!("Failed to save {}: {}", NODE_CACHE_NAME, e);
        }
        if let Err(e) = persistence::save_index(&self.disk_cache) {
            warn!("Failed to save {}: {}", DISK_CACHE_NAME, e);
        }
        if let Err(e) = persistence::save_index(&self.viewer_cache) {
            warn!("Failed to save {}: {}", VIEWER_CACHE_NAME, e);
        }
        if let Err(e) = persistence::write_cache_version(&self.root) {
            warn!("Failed to record cache version: {}", e);
        }
    }

    /// Restore saved indices, or wipe the tree when its version is stale
    ///
    /// Returns the number of restored entries. A cache whose index cannot be
    /// read starts empty.
    pub fn restore_caches(&self) -> usize {
        let recorded = persistence::read_cache_version(&self.root);
        if recorded != Some(CACHE_FORMAT_VERSION) {
            info!(
                "Cache version {:?} does not match {}, wiping {}",
                recorded,
                CACHE_FORMAT_VERSION,
                self.root.display()
            );
            if let Err(e) = self.wipe_and_create_disk_cache_structure() {
                warn!("Failed to recreate cache directory: {}", e);
            }
            return 0;
        }

        let mut restored = 0;
        match persistence::restore_index(&self.node_cache) {
            Ok(n) => restored += n,
            Err(e) => {
                warn!("Failed to restore {}: {}", NODE_CACHE_NAME, e);
                self.node_cache.clear();
            }
        }
        match persistence::restore_index(&self.disk_cache) {
            Ok(n) => restored += n,
            Err(e) => {
                warn!("Failed to restore {}: {}", DISK_CACHE_NAME, e);
                self.disk_cache.clear();
            }
        }
        match persistence::restore_index(&self.viewer_cache) {
            Ok(n) => restored += n,
            Err(e) => {
                warn!("Failed to restore {}: {}", VIEWER_CACHE_NAME, e);
                self.viewer_cache.clear();
            }
        }
        restored
    }

    /// Empty every cache and recreate the on-disk layout from scratch
    pub fn wipe_and_create_disk_cache_structure(&self) -> Result<()> {
        self.clear_all_caches();
        self.wait_for_deleter_threads();
        persistence::wipe_and_create_disk_cache_structure(
            &self.root,
            &[NODE_CACHE_NAME, DISK_CACHE_NAME, VIEWER_CACHE_NAME],
        )
    }

    pub fn wait_for_deleter_threads(&self) {
        self.node_cache.wait_for_deleter_thread();
        self.disk_cache.wait_for_deleter_thread();
        self.viewer_cache.wait_for_deleter_thread();
    }

    /// Wait for pending deletions; the caches are released when the manager
    /// is dropped
    pub fn shutdown(&self) {
        info!("Shutting down caches");
        self.wait_for_deleter_threads();
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Node cache at or above its soft limit; warns once per crossing
    pub fn is_node_cache_almost_full(&self) -> bool {
        let max = self.node_cache.maximum_cache_size();
        let full = max == 0
            || self.node_cache.memory_cache_size() as f64 / max as f64 >= CACHE_LIMIT_PERCENT;
        let was_full = self.node_cache_almost_full.swap(full, Ordering::Relaxed);
        if full && !was_full {
            warn!(
                "Node cache is almost full ({} of {} bytes); rendering may slow down",
                self.node_cache.memory_cache_size(),
                max
            );
        }
        full
    }

    /// Memory-resident bytes of all three caches
    pub fn caches_total_memory_size(&self) -> usize {
        self.node_cache.memory_cache_size()
            + self.disk_cache.memory_cache_size()
            + self.viewer_cache.memory_cache_size()
    }

    pub fn is_n_cache_files_opened_capped(&self) -> bool {
        self.file_handles.is_capped()
    }

    pub fn n_cache_files_opened(&self) -> usize {
        self.file_handles.opened()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            caches: vec![
                self.node_cache.stats(),
                self.disk_cache.stats(),
                self.viewer_cache.stats(),
            ],
            open_cache_files: self.file_handles.opened(),
            max_open_cache_files: self.file_handles.max(),
            total_memory_size: self.caches_total_memory_size(),
        }
    }

    // =========================================================================
    // Memory pressure
    // =========================================================================

    /// Evict from the node and viewer caches until enough RAM is free
    ///
    /// The viewer cache gives way first when the node cache holds nothing or
    /// when the viewer's share relative to the node cache exceeds the playback
    /// fraction. Returns the number of evictions.
    pub fn check_cache_free_memory_is_good_enough(&self) -> usize {
        let (unreachable, playback_fraction) = {
            let settings = self.settings.lock();
            (settings.unreachable_ram_fraction, settings.playback_ram_fraction)
        };
        let keep_free = (self.memory.total_ram() as f64 * unreachable) as u64;

        let mut evicted = 0;
        while self.memory.free_ram() <= keep_free {
            let node_memory = self.node_cache.memory_cache_size();
            let viewer_memory = self.viewer_cache.memory_cache_size();
            let viewer_first = node_memory == 0
                || viewer_memory as f64 / node_memory as f64 > playback_fraction;

            let freed = if viewer_first {
                self.viewer_cache.evict_lru_in_memory_entry()
                    || self.node_cache.evict_lru_in_memory_entry()
            } else {
                self.node_cache.evict_lru_in_memory_entry()
                    || self.viewer_cache.evict_lru_in_memory_entry()
            };
            if !freed {
                debug!("Low on memory but nothing left to evict");
                break;
            }
            evicted += 1;
        }
        if evicted > 0 {
            self.wait_for_deleter_threads();
            debug!("Memory pressure: evicted {} entries", evicted);
        }
        evicted
    }

    /// Run the memory check periodically until the monitor or the manager is
    /// dropped
    pub fn start_pressure_monitor(self: &Arc<Self>) -> PressureMonitor {
        let interval = Duration::from_millis(self.settings.lock().pressure_check_interval_ms);
        let manager = Arc::downgrade(self);
        PressureMonitor::spawn(interval, move || match manager.upgrade() {
            Some(manager) => {
                manager.check_cache_free_memory_is_good_enough();
                true
            }
            None => false,
        })
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("root", &self.root)
            .field("node_cache", &self.node_cache)
            .field("disk_cache", &self.disk_cache)
            .field("viewer_cache", &self.viewer_cache)
            .finish()
    }
}
