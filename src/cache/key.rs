//! Cache Keys
//!
//! A key combines the producing node's state hash (tree version), the holder's
//! cache-ID and holder-specific discriminators. Two keys with the same 64-bit hash
//! are not necessarily equal; the cache resolves collisions with a full equality
//! check inside the hash bucket.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::hash::Hash64;
use super::params::BitDepth;

/// Behaviour every key type stored in a [`Cache`](super::Cache) must provide.
pub trait CacheKey:
    Clone + Eq + std::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Deterministic 64-bit hash; equal keys must hash equal
    fn hash64(&self) -> u64;

    /// Cache-ID of the holder that produced the entry
    fn holder_id(&self) -> &str;

    /// Tree version of the holder at the time the entry was produced
    fn tree_version(&self) -> u64;
}

// =============================================================================
// ImageKey
// =============================================================================

/// Key of an image tile in the node or disk cache
///
/// Different mipmap levels of the same image share one key; the level lives in
/// the params, so a lookup may return several entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageKey {
    holder_id: String,
    node_hash: u64,
    frame_varying: bool,
    time: f64,
    view: i32,
    pixel_aspect: f64,
    draft_mode: bool,
}

impl ImageKey {
    pub fn new(
        holder_id: impl Into<String>,
        node_hash: u64,
        frame_varying: bool,
        time: f64,
        view: i32,
        pixel_aspect: f64,
        draft_mode: bool,
    ) -> Self {
        Self {
            holder_id: holder_id.into(),
            node_hash,
            frame_varying,
            time,
            view,
            pixel_aspect,
            draft_mode,
        }
    }

    /// Key for a still (non-animated) image at view 0, square pixels
    pub fn still(holder_id: impl Into<String>, node_hash: u64) -> Self {
        Self::new(holder_id, node_hash, false, 0.0, 0, 1.0, false)
    }

    pub fn node_hash(&self) -> u64 {
        self.node_hash
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn view(&self) -> i32 {
        self.view
    }
}

impl PartialEq for ImageKey {
    fn eq(&self, other: &Self) -> bool {
        // time only discriminates when the producer varies over time
        let same_time = !self.frame_varying || self.time.to_bits() == other.time.to_bits();
        self.frame_varying == other.frame_varying
            && self.node_hash == other.node_hash
            && same_time
            && self.view == other.view
            && self.pixel_aspect.to_bits() == other.pixel_aspect.to_bits()
            && self.draft_mode == other.draft_mode
            && self.holder_id == other.holder_id
    }
}

impl Eq for ImageKey {}

impl CacheKey for ImageKey {
    fn hash64(&self) -> u64 {
        let mut hash = Hash64::new();
        hash.append_u64(self.node_hash);
        if self.frame_varying {
            hash.append_f64(self.time);
        }
        hash.append_i64(self.view as i64)
            .append_f64(self.pixel_aspect)
            .append_bool(self.draft_mode);
        hash.finish()
    }

    fn holder_id(&self) -> &str {
        &self.holder_id
    }

    fn tree_version(&self) -> u64 {
        self.node_hash
    }
}

// =============================================================================
// FrameKey
// =============================================================================

/// Display transform applied when the frame was rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewerLut {
    Linear,
    Srgb,
    Rec709,
}

/// Channels shown by the viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisplayChannels {
    Rgb,
    Red,
    Green,
    Blue,
    Alpha,
    Luminance,
}

/// Key of a rendered viewer frame (one texture tile of it)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameKey {
    pub holder_id: String,
    pub tree_version: u64,
    pub time: i32,
    pub view: i32,
    pub texture_index: u32,
    pub mipmap_level: u32,
    pub bit_depth: BitDepth,
    pub gain: f64,
    pub gamma: f64,
    pub lut: ViewerLut,
    pub channels: DisplayChannels,
    pub draft_mode: bool,
}

impl FrameKey {
    /// Frame at full resolution with a neutral display transform
    pub fn new(holder_id: impl Into<String>, tree_version: u64, time: i32) -> Self {
        Self {
            holder_id: holder_id.into(),
            tree_version,
            time,
            view: 0,
            texture_index: 0,
            mipmap_level: 0,
            bit_depth: BitDepth::Byte,
            gain: 1.0,
            gamma: 1.0,
            lut: ViewerLut::Srgb,
            channels: DisplayChannels::Rgb,
            draft_mode: false,
        }
    }
}

impl PartialEq for FrameKey {
    fn eq(&self, other: &Self) -> bool {
        self.tree_version == other.tree_version
            && self.time == other.time
            && self.view == other.view
            && self.texture_index == other.texture_index
            && self.mipmap_level == other.mipmap_level
            && self.bit_depth == other.bit_depth
            && self.gain.to_bits() == other.gain.to_bits()
            && self.gamma.to_bits() == other.gamma.to_bits()
            && self.lut == other.lut
            && self.channels == other.channels
            && self.draft_mode == other.draft_mode
            && self.holder_id == other.holder_id
    }
}

impl Eq for FrameKey {}

impl CacheKey for FrameKey {
    fn hash64(&self) -> u64 {
        Hash64::new()
            .append_u64(self.tree_version)
            .append_i64(self.time as i64)
            .append_i64(self.view as i64)
            .append_u64(self.texture_index as u64)
            .append_u64(self.mipmap_level as u64)
            .append_u64(self.bit_depth as u64)
            .append_f64(self.gain)
            .append_f64(self.gamma)
            .append_u64(self.lut as u64)
            .append_u64(self.channels as u64)
            .append_bool(self.draft_mode)
            .finish()
    }

    fn holder_id(&self) -> &str {
        &self.holder_id
    }

    fn tree_version(&self) -> u64 {
        self.tree_version
    }
}
