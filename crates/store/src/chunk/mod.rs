//! Chunk management for the store engine.
//!
//! This module handles:
//! - The fixed-size chunk, the unit of I/O and caching
//! - The shared chunk cache (clock eviction)
//! - The write-coalescing flush path

mod cache;
mod writer;

use std::sync::atomic::{AtomicBool, Ordering};

pub use cache::{CacheStats, ChunkCache, DEFAULT_CACHE_CHUNKS};
use parking_lot::RwLock;
pub use writer::{ChunkWriter, DEFAULT_WRITE_BUFFER_SIZE, FlushStatus, SleepFn};

/// Size of a chunk in bytes.
pub const CHUNK_SIZE: usize = 4096;

/// Identifies one open database within a shared [`ChunkCache`].
pub type DatabaseId = u64;

/// One cached chunk of a database file.
///
/// Contents are guarded by a lock so readers on other threads observe whole
/// writes. The dirty flag is set by every write and cleared only once the chunk
/// has reached the backing file.
#[derive(Debug)]
pub struct Chunk {
    number: u64,
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
}

impl Chunk {
    /// Wraps chunk contents read from disk. The chunk starts clean.
    ///
    /// Buffers shorter than [`CHUNK_SIZE`] are zero-padded.
    pub fn from_bytes(number: u64, mut data: Vec<u8>) -> Self {
        data.resize(CHUNK_SIZE, 0);
        Self { number, data: RwLock::new(data.into_boxed_slice()), dirty: AtomicBool::new(false) }
    }

    /// Creates a zeroed chunk that has never been written to disk. The chunk starts dirty.
    pub fn zeroed(number: u64) -> Self {
        let chunk = Self::from_bytes(number, Vec::new());
        chunk.mark_dirty();
        chunk
    }

    /// Returns the chunk number.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Returns `true` if the chunk holds writes not yet flushed.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Marks the chunk as holding unflushed writes.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Marks the chunk as matching the backing file.
    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Copies bytes starting at `offset` within the chunk into `buf`.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the chunk.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let data = self.data.read();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copies `bytes` into the chunk at `offset` and marks it dirty.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the chunk.
    pub fn write(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.write();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.mark_dirty();
    }

    /// Zeroes `len` bytes starting at `offset` and marks the chunk dirty.
    pub fn clear(&self, offset: usize, len: usize) {
        let mut data = self.data.write();
        data[offset..offset + len].fill(0);
        self.mark_dirty();
    }

    /// Returns a copy of the chunk contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_read_write() {
        let chunk = Chunk::from_bytes(3, vec![1, 2, 3]);
        assert_eq!(chunk.number(), 3);
        assert!(!chunk.is_dirty());

        let mut buf = [0u8; 4];
        chunk.read(0, &mut buf);
        assert_eq!(buf, [1, 2, 3, 0]);

        chunk.write(CHUNK_SIZE - 2, &[9, 9]);
        assert!(chunk.is_dirty());
        let mut tail = [0u8; 2];
        chunk.read(CHUNK_SIZE - 2, &mut tail);
        assert_eq!(tail, [9, 9]);

        chunk.mark_clean();
        chunk.clear(0, 2);
        assert!(chunk.is_dirty());
        chunk.read(0, &mut buf);
        assert_eq!(buf, [0, 0, 3, 0]);
    }

    #[test]
    fn test_zeroed_chunk_is_dirty() {
        let chunk = Chunk::zeroed(9);
        assert!(chunk.is_dirty());
        assert!(chunk.to_vec().iter().all(|&b| b == 0));
        assert_eq!(chunk.to_vec().len(), CHUNK_SIZE);
    }
}
