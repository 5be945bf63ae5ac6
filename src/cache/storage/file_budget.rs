//! Process-wide open cache file budget
//!
//! Every memory-mapped entry keeps one file descriptor open. The budget is shared
//! by all caches of the process and guarded by its own mutex, independent of any
//! cache's structural lock.
//!
//! Caches register themselves as reclaimers so that a cache hitting the ceiling
//! can close idle mappings held by its siblings. Sibling index locks are only
//! ever try-locked, so two caches reclaiming from each other cannot deadlock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::Storage;
use crate::error::{Error, Result};

/// Fallback ceiling when the OS limit cannot be queried
pub const DEFAULT_MAX_CACHE_FILES: usize = 2048;

/// Share of the descriptor limit the caches may use
const DESCRIPTOR_SHARE: f64 = 0.9;

/// Upper bound applied to "unlimited" descriptor limits
const MAX_REASONABLE_DESCRIPTORS: usize = 1 << 20;

/// A cache able to give up idle mappings on behalf of another cache
pub(crate) trait HandleReclaimer: Send + Sync {
    /// Demote one unpinned mapped entry without blocking
    ///
    /// Returns the detached mappings with their slots already released; the
    /// caller flushes and drops them. Empty when nothing could be demoted or
    /// the cache is busy.
    fn release_mapped(&self) -> Vec<Storage>;
}

/// Counter of open cache files against a hard ceiling
pub struct FileHandleBudget {
    opened: Mutex<usize>,
    max: usize,
    next_token: AtomicU64,
    reclaimers: Mutex<Vec<(u64, Weak<dyn HandleReclaimer>)>>,
}

impl FileHandleBudget {
    /// Budget with an explicit ceiling
    pub fn new(max: usize) -> Self {
        Self {
            opened: Mutex::new(0),
            max: max.max(1),
            next_token: AtomicU64::new(0),
            reclaimers: Mutex::new(Vec::new()),
        }
    }

    /// Budget derived from the process descriptor limit
    ///
    /// On Unix the soft `RLIMIT_NOFILE` is first raised to the hard limit, then
    /// 90% of it is reserved for cache files.
    pub fn from_system_limit() -> Self {
        let max = match raise_open_file_limit() {
            Some(limit) => ((limit as f64) * DESCRIPTOR_SHARE) as usize,
            None => DEFAULT_MAX_CACHE_FILES,
        };
        debug!("Open cache file ceiling set to {}", max);
        Self::new(max)
    }

    /// True once the ceiling is reached; the disk allocator consults this
    /// before opening a new file
    pub fn is_capped(&self) -> bool {
        *self.opened.lock() >= self.max
    }

    /// Number of cache files currently open
    pub fn opened(&self) -> usize {
        *self.opened.lock()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Reserve one descriptor slot, released when the slot is dropped
    pub(crate) fn acquire(self: &Arc<Self>) -> Result<FileHandleSlot> {
        let mut opened = self.opened.lock();
        if *opened >= self.max {
            warn!(
                "Cache has reached the open file limit: {}/{}",
                *opened, self.max
            );
            return Err(Error::FileHandlesExhausted {
                opened: *opened,
                max: self.max,
            });
        }
        *opened += 1;
        Ok(FileHandleSlot {
            budget: Arc::clone(self),
        })
    }

    fn release(&self) {
        let mut opened = self.opened.lock();
        *opened = opened.saturating_sub(1);
    }

    /// Token identifying a reclaimer, handed out before it registers
    pub(crate) fn reclaimer_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_reclaimer(&self, token: u64, reclaimer: Weak<dyn HandleReclaimer>) {
        let mut reclaimers = self.reclaimers.lock();
        reclaimers.retain(|(_, r)| r.strong_count() > 0);
        reclaimers.push((token, reclaimer));
    }

    /// Ask every other registered cache, in registration order, to demote one
    /// idle mapping
    pub(crate) fn reclaim_elsewhere(&self, token: u64) -> Vec<Storage> {
        let others: Vec<Arc<dyn HandleReclaimer>> = {
            let mut reclaimers = self.reclaimers.lock();
            reclaimers.retain(|(_, r)| r.strong_count() > 0);
            reclaimers
                .iter()
                .filter(|(t, _)| *t != token)
                .filter_map(|(_, r)| r.upgrade())
                .collect()
        };
        for other in others {
            let released = other.release_mapped();
            if !released.is_empty() {
                debug!("Reclaimed {} cache file handle(s) from a sibling cache", released.len());
                return released;
            }
        }
        Vec::new()
    }
}

impl std::fmt::Debug for FileHandleBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandleBudget")
            .field("opened", &self.opened())
            .field("max", &self.max)
            .field("reclaimers", &self.reclaimers.lock().len())
            .finish()
    }
}

impl Default for FileHandleBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CACHE_FILES)
    }
}

/// One reserved descriptor slot
#[derive(Debug)]
pub(crate) struct FileHandleSlot {
    budget: Arc<FileHandleBudget>,
}

impl Drop for FileHandleSlot {
    fn drop(&mut self) {
        self.budget.release();
    }
}

#[cfg(unix)]
fn raise_open_file_limit() -> Option<usize> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid, writable rlimit for the duration of the call.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return None;
    }
    if limit.rlim_max > limit.rlim_cur {
        let raised = libc::rlimit {
            rlim_cur: limit.rlim_max,
            rlim_max: limit.rlim_max,
        };
        // SAFETY: `raised` is a valid rlimit; failure leaves the limit untouched.
        if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raised) } == 0 {
            limit = raised;
        }
    }
    Some((limit.rlim_cur as u64).min(MAX_REASONABLE_DESCRIPTORS as u64) as usize)
}

#[cfg(not(unix))]
fn raise_open_file_limit() -> Option<usize> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let budget = Arc::new(FileHandleBudget::new(2));
        let a = budget.acquire().unwrap();
        assert_eq!(budget.opened(), 1);
        let b = budget.acquire().unwrap();
        assert!(budget.is_capped());

        drop(a);
        assert_eq!(budget.opened(), 1);
        assert!(!budget.is_capped());
        drop(b);
        assert_eq!(budget.opened(), 0);
    }

    #[test]
    fn test_acquire_fails_when_capped() {
        let budget = Arc::new(FileHandleBudget::new(1));
        let _slot = budget.acquire().unwrap();
        let err = budget.acquire().unwrap_err();
        assert!(matches!(
            err,
            Error::FileHandlesExhausted { opened: 1, max: 1 }
        ));
    }

    struct Spare {
        budget: Arc<FileHandleBudget>,
        slots: Mutex<Vec<FileHandleSlot>>,
    }

    impl HandleReclaimer for Spare {
        fn release_mapped(&self) -> Vec<Storage> {
            match self.slots.lock().pop() {
                Some(slot) => {
                    drop(slot);
                    vec![Storage::allocate_ram(1).unwrap()]
                }
                None => Vec::new(),
            }
        }
    }

    #[test]
    fn test_reclaim_skips_requester_and_dead_caches() {
        let budget = Arc::new(FileHandleBudget::new(1));
        let spare = Arc::new(Spare {
            budget: Arc::clone(&budget),
            slots: Mutex::new(vec![budget.acquire().unwrap()]),
        });
        let own = budget.reclaimer_token();
        let sibling = budget.reclaimer_token();
        let weak = Arc::downgrade(&spare);
        let sibling_weak: Weak<dyn HandleReclaimer> = weak;
        budget.register_reclaimer(sibling, sibling_weak);
        assert!(spare.budget.is_capped());

        // the requester never reclaims from itself
        assert!(budget.reclaim_elsewhere(sibling).is_empty());
        assert!(budget.is_capped());

        assert_eq!(budget.reclaim_elsewhere(own).len(), 1);
        assert!(!budget.is_capped());
        assert!(budget.reclaim_elsewhere(own).is_empty());

        drop(spare);
        assert!(budget.reclaim_elsewhere(own).is_empty());
        assert_eq!(budget.reclaimers.lock().len(), 0);
    }

    #[test]
    fn test_system_limit_is_positive() {
        let budget = FileHandleBudget::from_system_limit();
        assert!(budget.max() >= 1);
        assert_eq!(budget.opened(), 0);
    }
}
