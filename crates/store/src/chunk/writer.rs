//! Write-coalescing flush path.
//!
//! Pending writes are queued as `(position, bytes)` pairs. A flush sorts them,
//! merges overlapping and adjacent ranges into as few physical writes as the
//! buffer size allows, and optionally throttles itself through a sleep hook.

use std::{fmt, sync::Arc, time::Duration};

use crate::{backend::StorageBackend, error::Result};

/// Default upper bound on the size of one coalesced physical write.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Sleep hook used to throttle flushes.
pub type SleepFn = Arc<dyn Fn(Duration) + Send + Sync>;

/// Outcome of a flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStatus {
    /// The backend reported an interrupted write; the rest of the flush was abandoned.
    pub interrupted: bool,
    /// Bytes handed to the backend by completed writes.
    pub bytes_written: u64,
    /// Number of completed physical write calls.
    pub physical_writes: usize,
}

impl FlushStatus {
    /// Returns `true` if every queued write reached the backend.
    pub fn is_complete(&self) -> bool {
        !self.interrupted
    }
}

struct PendingWrite {
    position: u64,
    bytes: Vec<u8>,
}

impl PendingWrite {
    fn end(&self) -> u64 {
        self.position + self.bytes.len() as u64
    }
}

/// Buffers pending writes and coalesces them on flush.
pub struct ChunkWriter {
    pending: Vec<PendingWrite>,
    buffer_size: usize,
    /// Throughput target; zero disables throttling.
    bytes_per_ms: f64,
    sleep: SleepFn,
}

impl ChunkWriter {
    /// Creates a writer whose coalesced writes are at most `buffer_size` bytes,
    /// unless overlapping ranges force a larger one.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            pending: Vec::new(),
            buffer_size: buffer_size.max(1),
            bytes_per_ms: 0.0,
            sleep: Arc::new(std::thread::sleep),
        }
    }

    /// Throttles flushes to roughly `bytes_per_ms` by calling `sleep` after each write.
    pub fn with_throttle(mut self, bytes_per_ms: f64, sleep: SleepFn) -> Self {
        self.bytes_per_ms = bytes_per_ms.max(0.0);
        self.sleep = sleep;
        self
    }

    /// Queues a write of `bytes` at `position`.
    ///
    /// Where queued writes overlap, the one queued last wins.
    pub fn write(&mut self, position: u64, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.pending.push(PendingWrite { position, bytes: bytes.to_vec() });
    }

    /// Returns the number of queued writes.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops every queued write.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Writes every queued range to `backend`.
    ///
    /// The queue is empty afterwards whatever the outcome. An interrupted write is
    /// reported through [`FlushStatus::interrupted`] rather than as an error.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` for any backend failure other than an interruption.
    pub fn flush(&mut self, backend: &dyn StorageBackend) -> Result<FlushStatus> {
        let mut status = FlushStatus::default();
        if self.pending.is_empty() {
            return Ok(status);
        }

        let pending = std::mem::take(&mut self.pending);
        for (position, buffer) in self.coalesce(pending) {
            match backend.write_at(position, &buffer) {
                Ok(()) => {},
                Err(e) if e.is_interrupted() => {
                    tracing::warn!(
                        position,
                        completed = status.physical_writes,
                        "Flush interrupted, abandoning remaining writes"
                    );
                    status.interrupted = true;
                    return Ok(status);
                },
                Err(e) => return Err(e),
            }

            status.bytes_written += buffer.len() as u64;
            status.physical_writes += 1;

            if self.bytes_per_ms > 0.0 {
                let nanos = buffer.len() as f64 / self.bytes_per_ms * 1_000_000.0;
                (self.sleep)(Duration::from_nanos(nanos as u64));
            }
        }

        Ok(status)
    }

    /// Groups queued writes into physical writes.
    ///
    /// Overlapping ranges always share a group; merely adjacent ranges share one
    /// while the group stays within the buffer size.
    fn coalesce(&self, pending: Vec<PendingWrite>) -> Vec<(u64, Vec<u8>)> {
        let mut order: Vec<usize> = (0..pending.len()).collect();
        order.sort_by_key(|&i| (pending[i].position, i));

        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut group_start = 0u64;
        let mut group_end = 0u64;
        for i in order {
            let write = &pending[i];
            let joins = match groups.last() {
                None => false,
                Some(_) if write.position < group_end => true,
                Some(_) => {
                    write.position == group_end
                        && write.end() - group_start <= self.buffer_size as u64
                },
            };

            if joins {
                group_end = group_end.max(write.end());
                if let Some(group) = groups.last_mut() {
                    group.push(i);
                }
            } else {
                group_start = write.position;
                group_end = write.end();
                groups.push(vec![i]);
            }
        }

        groups
            .into_iter()
            .map(|mut members| {
                let start = members.iter().map(|&i| pending[i].position).min().unwrap_or(0);
                let end = members.iter().map(|&i| pending[i].end()).max().unwrap_or(start);
                let mut buffer = vec![0u8; (end - start) as usize];
                // Queue order, so later writes overwrite earlier ones.
                members.sort_unstable();
                for i in members {
                    let offset = (pending[i].position - start) as usize;
                    buffer[offset..offset + pending[i].bytes.len()]
                        .copy_from_slice(&pending[i].bytes);
                }
                (start, buffer)
            })
            .collect()
    }
}

impl Default for ChunkWriter {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_BUFFER_SIZE)
    }
}

impl fmt::Debug for ChunkWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkWriter")
            .field("pending", &self.pending.len())
            .field("buffer_size", &self.buffer_size)
            .field("bytes_per_ms", &self.bytes_per_ms)
            .finish()
    }
}
