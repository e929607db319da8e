//! In-memory storage backend for testing.

use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::{Mutex, RwLock};

use super::StorageBackend;
use crate::error::{Error, Result};

/// In-memory storage backend for testing.
///
/// All data is stored in memory and lost when the backend is dropped.
/// Besides unit tests and benchmarking, it records every physical write so tests
/// can observe how flushes are coalesced, and it can inject an interrupted write.
#[derive(Default)]
pub struct InMemoryBackend {
    /// Simulated file contents.
    data: RwLock<Vec<u8>>,
    /// Every `write_at` call as `(offset, len)`, in issue order.
    writes: Mutex<Vec<(u64, usize)>>,
    /// Number of further writes that succeed before one reports `Interrupted`.
    interrupt_after: Mutex<Option<u64>>,
    syncs: AtomicU64,
    read_only: bool,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a read-only backend over existing contents.
    pub fn read_only(contents: Vec<u8>) -> Self {
        Self { data: RwLock::new(contents), read_only: true, ..Self::default() }
    }

    /// Returns a copy of the simulated file contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Returns the `(offset, len)` of every physical write so far.
    pub fn writes(&self) -> Vec<(u64, usize)> {
        self.writes.lock().clone()
    }

    /// Forgets the recorded writes.
    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    /// Makes the write after the next `successful` ones fail with `ErrorKind::Interrupted`.
    pub fn interrupt_after(&self, successful: u64) {
        *self.interrupt_after.lock() = Some(successful);
    }

    /// Returns how many times `sync` was called.
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        buf.fill(0);
        let start = offset as usize;
        if start < data.len() {
            let end = (start + buf.len()).min(data.len());
            buf[..end - start].copy_from_slice(&data[start..end]);
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        {
            let mut remaining = self.interrupt_after.lock();
            match *remaining {
                Some(0) => {
                    *remaining = None;
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "injected").into());
                },
                Some(n) => *remaining = Some(n - 1),
                None => {},
            }
        }

        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        self.writes.lock().push((offset, bytes.len()));
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn set_len(&self, new_size: u64) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.data.write().resize(new_size as usize, 0);
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
