//! tilecache - Tiered Image and Frame Cache
//!
//! Multi-tier cache for the outputs of a compositing engine: image tiles kept
//! on the heap, image tiles and viewer frames kept in memory-mapped files, all
//! under RAM and disk budgets with LRU eviction.
//!
//! # Features
//!
//! - Node, disk and viewer caches sharing one file handle budget
//! - RAM and memory-mapped storage with transparent demotion and promotion
//! - At most one concurrent build per key
//! - Index persistence with restore on startup
//! - Background memory pressure monitor
//!
//! # Modules
//!
//! - [`cache`] - Caches, entries, storage and the cache manager
//! - [`error`] - Error types
//! - [`settings`] - User-facing cache settings

pub mod cache;
pub mod error;
pub mod settings;

// Re-export commonly used types
pub use cache::{
    Cache, CacheConfig, CacheEntryHolder, CacheManager, EntryHandle, FrameKey, FrameParams,
    ImageKey, ImageParams, Lookup,
};
pub use error::{Error, Result};
pub use settings::CacheSettings;
