//! Cache Entry Holders
//!
//! A holder is whatever produces cache entries (usually a graph node). Entries
//! never point back at their holder and holders never own entries: the only link
//! is the cache-ID prefix stamped into every key the holder builds. That keeps
//! holder lifetime independent of entry lifetime, so a deleted node leaves its
//! entries valid but orphaned until they are evicted.

use std::sync::atomic::{AtomicU64, Ordering};

/// Which cache tier a holder's entries are routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HolderKind {
    /// Produces image tiles (node and disk caches)
    Generic,
    /// Produces viewer frames (viewer cache, in addition to image tiles)
    Viewer,
}

/// Identity provider for the owner of cache entries.
pub trait CacheEntryHolder: Send + Sync {
    /// Stable cache-ID prefix, used to build every key this holder produces
    fn cache_id(&self) -> &str;

    /// Changes whenever the holder's upstream graph changes
    fn tree_version(&self) -> u64;

    /// Cache routing tag
    fn kind(&self) -> HolderKind {
        HolderKind::Generic
    }
}

/// Ready-made holder with an atomically bumped tree version
#[derive(Debug)]
pub struct NodeHolder {
    cache_id: String,
    kind: HolderKind,
    tree_version: AtomicU64,
}

impl NodeHolder {
    pub fn new(cache_id: impl Into<String>) -> Self {
        Self::with_kind(cache_id, HolderKind::Generic)
    }

    pub fn viewer(cache_id: impl Into<String>) -> Self {
        Self::with_kind(cache_id, HolderKind::Viewer)
    }

    pub fn with_kind(cache_id: impl Into<String>, kind: HolderKind) -> Self {
        Self {
            cache_id: cache_id.into(),
            kind,
            tree_version: AtomicU64::new(0),
        }
    }

    /// Record an upstream graph change and return the new version
    pub fn bump_tree_version(&self) -> u64 {
        self.tree_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn set_tree_version(&self, version: u64) {
        self.tree_version.store(version, Ordering::Release);
    }
}

impl CacheEntryHolder for NodeHolder {
    fn cache_id(&self) -> &str {
        &self.cache_id
    }

    fn tree_version(&self) -> u64 {
        self.tree_version.load(Ordering::Acquire)
    }

    fn kind(&self) -> HolderKind {
        self.kind
    }
}
