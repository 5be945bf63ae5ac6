//! Error types for the tile cache

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tile cache
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Allocation Errors
    // =========================================================================
    /// Storage could not be allocated even after evicting every unpinned entry
    #[error("Allocation of {size} bytes failed: {reason}")]
    AllocationFailed { size: usize, reason: String },

    /// Entry can never fit in the cache budget
    #[error("Entry of {size} bytes exceeds cache capacity of {capacity} bytes")]
    EntryTooLarge { size: usize, capacity: usize },

    /// The process-wide open cache file ceiling was reached
    #[error("Open cache file ceiling reached: {opened}/{max}")]
    FileHandlesExhausted { opened: usize, max: usize },

    /// Memory-mapping a payload file failed
    #[error("Failed to map cache file {path}: {source}")]
    MappingFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The builder of an entry gave up before marking it ready
    #[error("Entry build was aborted before completion")]
    BuildAborted,

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Index (de)serialization error
    #[error("Index serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persisted index is unusable
    #[error("Persistence error for {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    /// Cache directory could not be created or removed
    #[error("Cache directory error at {path}: {source}")]
    CacheDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Settings file parse error
    #[error("Failed to parse settings: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the caller can fall back to an uncached computation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::AllocationFailed { .. }
                | Error::EntryTooLarge { .. }
                | Error::FileHandlesExhausted { .. }
                | Error::MappingFailed { .. }
                | Error::BuildAborted
                | Error::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_errors_are_recoverable() {
        let err = Error::AllocationFailed {
            size: 40,
            reason: "budget exhausted".to_string(),
        };
        assert!(err.is_recoverable());
        assert!(Error::BuildAborted.is_recoverable());
        assert!(Error::FileHandlesExhausted { opened: 10, max: 10 }.is_recoverable());
    }

    #[test]
    fn test_config_errors_are_not_recoverable() {
        assert!(!Error::Config("bad fraction".to_string()).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::EntryTooLarge {
            size: 200,
            capacity: 100,
        };
        assert_eq!(
            err.to_string(),
            "Entry of 200 bytes exceeds cache capacity of 100 bytes"
        );
    }
}
