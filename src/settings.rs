//! Cache settings
//!
//! Budgets are expressed the way users set them: RAM as a fraction of the
//! machine's physical memory, disk as absolute byte counts. The manager turns
//! them into per-cache budgets.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const GIB: u64 = 1024 * 1024 * 1024;

/// User-facing cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Share of physical RAM all caches together may keep resident
    pub ram_maximum_fraction: f64,

    /// Share of that RAM reserved for viewer playback frames
    pub playback_ram_fraction: f64,

    /// Disk budget of the viewer cache, in bytes
    pub maximum_viewer_disk_cache_size: u64,

    /// Disk budget of the disk cache node, in bytes
    pub maximum_disk_cache_node_size: u64,

    /// Free-RAM share below which the pressure check starts evicting
    pub unreachable_ram_fraction: f64,

    /// Ceiling on simultaneously mapped cache files; derived from the process
    /// descriptor limit when unset
    pub max_open_cache_files: Option<usize>,

    /// Cache root; the platform cache directory when unset
    pub cache_location: Option<PathBuf>,

    /// Period of the background memory check, in milliseconds
    pub pressure_check_interval_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ram_maximum_fraction: 0.5,
            playback_ram_fraction: 0.25,
            maximum_viewer_disk_cache_size: 5 * GIB,
            maximum_disk_cache_node_size: 10 * GIB,
            unreachable_ram_fraction: 0.05,
            max_open_cache_files: None,
            cache_location: None,
            pressure_check_interval_ms: 1000,
        }
    }
}

impl CacheSettings {
    /// Load settings from a YAML file, filling gaps with defaults
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let settings: Self = serde_yaml::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("ram_maximum_fraction", self.ram_maximum_fraction),
            ("playback_ram_fraction", self.playback_ram_fraction),
            ("unreachable_ram_fraction", self.unreachable_ram_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.max_open_cache_files == Some(0) {
            return Err(Error::Config(
                "max_open_cache_files must be positive".to_string(),
            ));
        }
        if self.pressure_check_interval_ms == 0 {
            return Err(Error::Config(
                "pressure_check_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Cache root to use
    pub fn cache_root(&self) -> PathBuf {
        self.cache_location.clone().unwrap_or_else(default_cache_root)
    }
}

/// `<platform cache dir>/tilecache`, or a temp-dir fallback
pub fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("tilecache")
}
