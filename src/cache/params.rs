//! Entry Params
//!
//! Params describe the shape of a payload before it exists, so storage can be
//! allocated up front. They never change after the entry is constructed.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Where an entry's payload lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageMode {
    /// Heap buffer, lost on shutdown
    Ram,
    /// Memory-mapped file under the cache directory, survives restarts
    Disk,
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageMode::Ram => write!(f, "RAM"),
            StorageMode::Disk => write!(f, "Disk"),
        }
    }
}

/// Behaviour every params type stored in a [`Cache`](super::Cache) must provide.
pub trait CacheParams:
    Clone + PartialEq + std::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Payload footprint in bytes
    fn size_in_bytes(&self) -> usize;

    /// Storage backend the payload must be allocated in
    fn storage_mode(&self) -> StorageMode;
}

/// Per-channel bit depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitDepth {
    Byte,
    Short,
    Half,
    Float,
}

impl BitDepth {
    /// Bytes needed to store one channel value
    pub fn bytes_per_channel(self) -> usize {
        match self {
            BitDepth::Byte => 1,
            BitDepth::Short | BitDepth::Half => 2,
            BitDepth::Float => 4,
        }
    }
}

/// Integer pixel rectangle, `x2`/`y2` exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RectI {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl RectI {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Width, zero for inverted rectangles
    pub fn width(&self) -> usize {
        (self.x2 as i64 - self.x1 as i64).max(0) as usize
    }

    /// Height, zero for inverted rectangles
    pub fn height(&self) -> usize {
        (self.y2 as i64 - self.y1 as i64).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Shape of a cached image tile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageParams {
    /// Pixel bounds of the tile at its mipmap level
    pub bounds: RectI,
    /// Number of channels per pixel
    pub components: u8,
    pub bit_depth: BitDepth,
    /// 0 is full resolution, each level halves both dimensions
    pub mipmap_level: u32,
    pub pixel_aspect: f64,
    pub storage: StorageMode,
}

impl ImageParams {
    /// RAM-backed image params
    pub fn in_ram(bounds: RectI, components: u8, bit_depth: BitDepth) -> Self {
        Self {
            bounds,
            components,
            bit_depth,
            mipmap_level: 0,
            pixel_aspect: 1.0,
            storage: StorageMode::Ram,
        }
    }

    /// Disk-backed (memory-mapped) image params
    pub fn on_disk(bounds: RectI, components: u8, bit_depth: BitDepth) -> Self {
        Self {
            storage: StorageMode::Disk,
            ..Self::in_ram(bounds, components, bit_depth)
        }
    }

    pub fn with_mipmap_level(mut self, level: u32) -> Self {
        self.mipmap_level = level;
        self
    }
}

impl CacheParams for ImageParams {
    fn size_in_bytes(&self) -> usize {
        self.bounds.width()
            * self.bounds.height()
            * self.components as usize
            * self.bit_depth.bytes_per_channel()
    }

    fn storage_mode(&self) -> StorageMode {
        self.storage
    }
}

/// Shape of a rendered viewer frame (RGBA texture)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameParams {
    pub width: u32,
    pub height: u32,
    pub bit_depth: BitDepth,
}

impl FrameParams {
    pub fn new(width: u32, height: u32, bit_depth: BitDepth) -> Self {
        Self {
            width,
            height,
            bit_depth,
        }
    }
}

impl CacheParams for FrameParams {
    fn size_in_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 4 * self.bit_depth.bytes_per_channel()
    }

    // Frames are always file-backed so the viewer cache can persist them.
    fn storage_mode(&self) -> StorageMode {
        StorageMode::Disk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_dimensions() {
        let rect = RectI::new(-10, 0, 10, 5);
        assert_eq!(rect.width(), 20);
        assert_eq!(rect.height(), 5);
        assert!(!rect.is_empty());

        let inverted = RectI::new(10, 0, 0, 5);
        assert_eq!(inverted.width(), 0);
        assert!(inverted.is_empty());
    }

    #[test]
    fn test_image_footprint() {
        let params = ImageParams::in_ram(RectI::new(0, 0, 64, 32), 4, BitDepth::Float);
        assert_eq!(params.size_in_bytes(), 64 * 32 * 4 * 4);
        assert_eq!(params.storage_mode(), StorageMode::Ram);

        let disk = ImageParams::on_disk(RectI::new(0, 0, 8, 8), 3, BitDepth::Byte);
        assert_eq!(disk.size_in_bytes(), 192);
        assert_eq!(disk.storage_mode(), StorageMode::Disk);
    }

    #[test]
    fn test_frame_footprint() {
        let params = FrameParams::new(1920, 1080, BitDepth::Byte);
        assert_eq!(params.size_in_bytes(), 1920 * 1080 * 4);
        assert_eq!(params.storage_mode(), StorageMode::Disk);
    }

    #[test]
    fn test_params_roundtrip_json() {
        let params = ImageParams::on_disk(RectI::new(0, 0, 16, 16), 4, BitDepth::Half)
            .with_mipmap_level(2);
        let json = serde_json::to_string(&params).unwrap();
        let back: ImageParams = serde_json::from_str(&json).unwrap();
        assert_eq!(params, back);
    }
}
