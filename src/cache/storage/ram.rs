//! Heap-backed payload storage

use crate::error::{Error, Result};

/// Zero-initialised heap buffer
#[derive(Debug)]
pub struct RamBuffer {
    data: Vec<u8>,
}

impl RamBuffer {
    /// Allocate `size` bytes, reporting OOM as an allocation failure
    pub fn allocate(size: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|e| Error::AllocationFailed {
                size,
                reason: e.to_string(),
            })?;
        data.resize(size, 0);
        Ok(Self { data })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
