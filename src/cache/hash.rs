//! 64-bit key hashing
//!
//! Keys feed their discriminating fields into a [`Hash64`] accumulator. The
//! mixing step is FxHash-style (rotate, xor, multiply): fast, non-cryptographic
//! and stable across runs, which matters because hashes name payload files on disk.

const SEED: u64 = 0x517cc1b727220a95;

/// Word-oriented hash accumulator
#[derive(Debug, Clone, Copy)]
pub struct Hash64 {
    state: u64,
}

impl Hash64 {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self { state: SEED }
    }

    #[inline]
    fn mix(&mut self, word: u64) {
        self.state = (self.state.rotate_left(5) ^ word).wrapping_mul(SEED);
    }

    /// Append an unsigned word
    #[inline]
    pub fn append_u64(&mut self, value: u64) -> &mut Self {
        self.mix(value);
        self
    }

    /// Append a signed word
    #[inline]
    pub fn append_i64(&mut self, value: i64) -> &mut Self {
        self.mix(value as u64);
        self
    }

    /// Append a float by bit pattern (`-0.0` and `0.0` hash differently)
    #[inline]
    pub fn append_f64(&mut self, value: f64) -> &mut Self {
        self.mix(value.to_bits());
        self
    }

    #[inline]
    pub fn append_bool(&mut self, value: bool) -> &mut Self {
        self.mix(value as u64);
        self
    }

    /// Append raw bytes, one word per byte
    pub fn append_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        for &byte in bytes {
            self.mix(byte as u64);
        }
        // length terminator so "ab" + "c" != "a" + "bc"
        self.mix(bytes.len() as u64);
        self
    }

    /// Finalize the hash
    #[inline]
    pub fn finish(&self) -> u64 {
        self.state
    }
}

impl Default for Hash64 {
    fn default() -> Self {
        Self::new()
    }
}
