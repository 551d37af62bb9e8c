use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::error::{Error, Result};

/// Fixed-capacity byte region issued by a [`BufferPool`](super::BufferPool).
///
/// A `Buffer` is not `Clone`: it always has exactly one owner, and it only goes
/// back to the pool by being moved into `deallocate`.
pub struct Buffer {
    data: Vec<u8>,
    capacity: usize,
    pool_id: u64,
}

impl Buffer {
    pub(super) fn new(mut data: Vec<u8>, capacity: usize, pool_id: u64) -> Self {
        data.clear();
        Self {
            data,
            capacity,
            pool_id,
        }
    }

    pub(super) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub(super) fn into_storage(self) -> Vec<u8> {
        self.data
    }

    /// Replace the contents with `bytes`.
    pub fn fill(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.capacity {
            return Err(Error::BufferOverflow {
                len: bytes.len(),
                capacity: self.capacity,
            });
        }
        self.data.clear();
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Zero-filled window of `len` bytes for a storage read to land in.
    pub(crate) fn read_window(&mut self, len: usize) -> &mut [u8] {
        let len = len.min(self.capacity);
        self.data.clear();
        self.data.resize(len, 0);
        &mut self.data[..]
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.data.len())
            .field("capacity", &self.capacity)
            .field("pool_id", &self.pool_id)
            .finish()
    }
}
