//! Tiered Image and Frame Cache
//!
//! Keeps the expensive products of a compositing graph around: image tiles
//! computed by nodes and frames rendered for the viewer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                             Cache Manager                                │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Node Cache             │ Disk Cache             │ Viewer Cache          │
//! │  ┌──────────────────┐   │ ┌──────────────────┐   │ ┌──────────────────┐  │
//! │  │ heap buffers     │   │ │ mapped files     │   │ │ mapped files     │  │
//! │  │ image tiles      │   │ │ image tiles      │   │ │ rendered frames  │  │
//! │  └──────────────────┘   │ └──────────────────┘   │ └──────────────────┘  │
//! │           │             │          │             │          │            │
//! │           └─────────────┴──────────┴─────────────┴──────────┘            │
//! │                                    │                                     │
//! │               LRU eviction, memory→disk demotion, one build per key      │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each [`Cache`] keeps a memory-resident portion and a disk-resident portion
//! under one budget. File-backed entries leave memory by being unmapped and
//! come back by being mapped again; heap entries leave memory by being
//! deleted.
//!
//! A lookup that misses reserves the key: concurrent lookups of the same key
//! wait for the builder instead of computing the same entry twice.

mod deleter;
pub mod entry;
pub mod hash;
pub mod holder;
pub mod key;
pub mod lru;
pub mod manager;
pub mod metrics;
pub mod params;
pub mod persistence;
pub mod pressure;
pub mod storage;
pub mod store;

pub use entry::CacheEntry;
pub use hash::Hash64;
pub use holder::{CacheEntryHolder, HolderKind, NodeHolder};
pub use key::{CacheKey, DisplayChannels, FrameKey, ImageKey, ViewerLut};
pub use lru::EntryId;
pub use manager::{CacheBudgets, CacheManager, FrameHandle, ImageHandle, ManagerStats};
pub use metrics::{CacheMetrics, CacheStats, MetricsSnapshot};
pub use params::{BitDepth, CacheParams, FrameParams, ImageParams, RectI, StorageMode};
pub use pressure::{PressureMonitor, StaticMemory, SysinfoMemory, SystemMemory};
pub use storage::{FileHandleBudget, Storage};
pub use store::{
    BuildGuard, Cache, CacheConfig, EntryHandle, HolderMemoryStats, Lookup, RemoveMode,
};

/// On-disk layout version; a cache root stamped with another version is wiped
pub const CACHE_FORMAT_VERSION: u32 = 3;

/// Fill ratio at which the node cache reports itself almost full
pub const CACHE_LIMIT_PERCENT: f64 = 0.9;

/// Number of `00`..`ff` shard directories per file-backed cache
pub const CACHE_SUBDIR_COUNT: usize = 256;
