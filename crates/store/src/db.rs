//! Database handle: one backing file viewed as a flat address space.
//!
//! Reads go through the shared [`ChunkCache`] and need only `&Database`. Every
//! mutation requires a [`WriteLock`], obtained from
//! [`Database::acquire_write_lock`]; the lock is the proof that the caller is the
//! single writer, and it carries the dirty-chunk set and the flush queue.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use nd_store::{ChunkCache, Database, DatabaseConfig, POOL_MISC};
//!
//! let cache = Arc::new(ChunkCache::default());
//! let db = Database::open_in_memory(cache, DatabaseConfig::default())?;
//!
//! let address = {
//!     let mut lock = db.acquire_write_lock()?;
//!     let address = lock.malloc(42, POOL_MISC)?;
//!     lock.put_u32(address, 7)?;
//!     lock.flush()?;
//!     address
//! };
//!
//! assert_eq!(db.get_u32(address)?, 7);
//! # Ok::<(), nd_store::Error>(())
//! ```

use std::{
    fmt,
    ops::Deref,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, MutexGuard};

use crate::{
    backend::{
        CHECKSUM_OFFSET, CHUNK_COUNT_OFFSET, DatabaseHeader, FileBackend, HEADER_CHUNKS,
        HEADER_SIZE, InMemoryBackend, ROOT_SLOT_COUNT, ROOT_SLOTS_OFFSET, StorageBackend,
        VERSION_OFFSET,
    },
    chunk::{
        CHUNK_SIZE, Chunk, ChunkCache, ChunkWriter, DEFAULT_WRITE_BUFFER_SIZE, DatabaseId,
        FlushStatus, SleepFn,
    },
    dirty_bitmap::DirtyBitmap,
    error::{Error, Result},
    malloc::MemoryStats,
    types::Address,
};

/// Database configuration options.
#[derive(Clone, bon::Builder)]
pub struct DatabaseConfig {
    /// Open without write access; [`Database::acquire_write_lock`] fails.
    #[builder(default = false)]
    pub read_only: bool,
    /// Oldest format version this caller can read.
    #[builder(default = 1)]
    pub min_version: u32,
    /// Newest format version this caller can read.
    #[builder(default = 1)]
    pub max_version: u32,
    /// Version stamped into newly created files.
    #[builder(default = 1)]
    pub current_version: u32,
    /// Upper bound on one coalesced physical write.
    #[builder(default = DEFAULT_WRITE_BUFFER_SIZE)]
    pub write_buffer_size: usize,
    /// Flush throughput target in bytes per millisecond; zero disables throttling.
    #[builder(default = 0.0)]
    pub write_bytes_per_ms: f64,
    /// Sleep hook used when throttling.
    #[builder(default = default_sleep())]
    pub sleep: SleepFn,
}

fn default_sleep() -> SleepFn {
    Arc::new(std::thread::sleep)
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("read_only", &self.read_only)
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .field("current_version", &self.current_version)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("write_bytes_per_ms", &self.write_bytes_per_ms)
            .finish_non_exhaustive()
    }
}

/// State owned by the current writer.
pub(crate) struct WriterState {
    pub(crate) writer: ChunkWriter,
    pub(crate) dirty: DirtyBitmap,
}

/// The main database handle.
///
/// Thread-safe with interior mutability: any number of threads may read, while
/// mutation is serialized through [`WriteLock`].
pub struct Database {
    backend: Box<dyn StorageBackend>,
    cache: Arc<ChunkCache>,
    id: DatabaseId,
    config: DatabaseConfig,
    read_only: bool,
    /// Mirrors the header's chunk count for bounds checks.
    chunk_count: AtomicU64,
    state: Mutex<WriterState>,
    pub(crate) stats: Mutex<MemoryStats>,
    closed: AtomicBool,
}

impl Database {
    /// Opens the database file at `path`, creating it if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] if write access was requested for a read-only file.
    /// Returns [`Error::UnsupportedVersion`] if the file version is outside
    /// `[config.min_version, config.max_version]`.
    /// Returns [`Error::InvalidMagic`], [`Error::HeaderChecksumMismatch`] or
    /// [`Error::Corrupted`] if the header does not validate.
    /// Returns [`Error::Io`] if the file cannot be opened or read.
    pub fn open(
        path: impl AsRef<Path>,
        cache: Arc<ChunkCache>,
        config: DatabaseConfig,
    ) -> Result<Self> {
        let backend: Box<dyn StorageBackend> = if config.read_only {
            Box::new(FileBackend::open_read_only(path)?)
        } else {
            Box::new(FileBackend::open(path)?)
        };
        Self::from_backend(backend, cache, config)
    }

    /// Creates a new in-memory database.
    ///
    /// Useful for testing and ephemeral workloads. Data is lost on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if backend initialization fails.
    pub fn open_in_memory(cache: Arc<ChunkCache>, config: DatabaseConfig) -> Result<Self> {
        Self::from_backend(Box::new(InMemoryBackend::new()), cache, config)
    }

    /// Opens a database over an arbitrary backend.
    ///
    /// An empty backend is initialized with a fresh header; the header only reaches
    /// the backend on the first flush.
    ///
    /// # Errors
    ///
    /// See [`Database::open`].
    pub fn from_backend(
        backend: Box<dyn StorageBackend>,
        cache: Arc<ChunkCache>,
        config: DatabaseConfig,
    ) -> Result<Self> {
        let read_only = config.read_only || backend.is_read_only();

        // Validate an existing image before the database takes an id in the cache.
        let existing = if backend.file_size()? == 0 {
            if read_only {
                return Err(Error::corrupted("Empty database file opened read-only"));
            }
            None
        } else {
            let data = backend.read_chunk(0)?;
            let header = DatabaseHeader::from_bytes(&data[..HEADER_SIZE])?;
            if header.version < config.min_version || header.version > config.max_version {
                return Err(Error::UnsupportedVersion {
                    version: header.version,
                    min: config.min_version,
                    max: config.max_version,
                });
            }
            Some((header, data))
        };

        let id = cache.register_database();
        let mut state = WriterState {
            writer: ChunkWriter::new(config.write_buffer_size)
                .with_throttle(config.write_bytes_per_ms, Arc::clone(&config.sleep)),
            dirty: DirtyBitmap::new(),
        };

        let chunk_count = match existing {
            Some((header, data)) => {
                cache.insert(id, Arc::new(Chunk::from_bytes(0, data)));
                tracing::debug!(
                    version = header.version,
                    chunk_count = header.chunk_count,
                    read_only,
                    "Opened database"
                );
                header.chunk_count
            },
            None => {
                let header = DatabaseHeader::new(config.current_version);
                let first = Chunk::zeroed(0);
                first.write(0, &header.to_bytes());
                cache.insert(id, Arc::new(first));
                for number in 1..HEADER_CHUNKS {
                    cache.insert(id, Arc::new(Chunk::zeroed(number)));
                }
                for number in 0..HEADER_CHUNKS {
                    state.dirty.mark(number);
                }

                tracing::debug!(version = config.current_version, "Created database");
                header.chunk_count
            },
        };

        Ok(Self {
            backend,
            cache,
            id,
            config,
            read_only,
            chunk_count: AtomicU64::new(chunk_count),
            state: Mutex::new(state),
            stats: Mutex::new(MemoryStats::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Acquires the exclusive write lock.
    ///
    /// Blocks until any other writer releases the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] if the database was opened read-only.
    pub fn acquire_write_lock(&self) -> Result<WriteLock<'_>> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(WriteLock { db: self, state: self.state.lock() })
    }

    /// Flushes all dirty chunks, acquiring the write lock for the duration.
    ///
    /// A read-only database has nothing to flush.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a write or the final sync fails.
    pub fn flush(&self) -> Result<FlushStatus> {
        if self.read_only {
            return Ok(FlushStatus::default());
        }
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    /// Flushes and releases the database's cached chunks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the final flush fails; the database is closed anyway.
    pub fn close(self) -> Result<()> {
        let result = self.flush().map(|_| ());
        self.closed.store(true, Ordering::Release);
        self.cache.remove_database(self.id);
        result
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Reads a `u8`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn get_u8(&self, address: Address) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.get_bytes(address, &mut buf)?;
        Ok(buf[0])
    }

    /// Reads an `i16`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn get_i16(&self, address: Address) -> Result<i16> {
        let mut buf = [0u8; 2];
        self.get_bytes(address, &mut buf)?;
        Ok(LittleEndian::read_i16(&buf))
    }

    /// Reads a `u16`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn get_u16(&self, address: Address) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.get_bytes(address, &mut buf)?;
        Ok(LittleEndian::read_u16(&buf))
    }

    /// Reads an `i32`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn get_i32(&self, address: Address) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.get_bytes(address, &mut buf)?;
        Ok(LittleEndian::read_i32(&buf))
    }

    /// Reads a `u32`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn get_u32(&self, address: Address) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.get_bytes(address, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    /// Reads an `i64`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn get_i64(&self, address: Address) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.get_bytes(address, &mut buf)?;
        Ok(LittleEndian::read_i64(&buf))
    }

    /// Reads a `u64`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn get_u64(&self, address: Address) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.get_bytes(address, &mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    /// Reads an `f32`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn get_f32(&self, address: Address) -> Result<f32> {
        let mut buf = [0u8; 4];
        self.get_bytes(address, &mut buf)?;
        Ok(LittleEndian::read_f32(&buf))
    }

    /// Reads an `f64`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn get_f64(&self, address: Address) -> Result<f64> {
        let mut buf = [0u8; 8];
        self.get_bytes(address, &mut buf)?;
        Ok(LittleEndian::read_f64(&buf))
    }

    /// Reads a stored address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn get_address(&self, address: Address) -> Result<Address> {
        self.get_u64(address).map(Address::new)
    }

    /// Fills `buf` with the bytes at `address`, crossing chunk boundaries as needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn get_bytes(&self, address: Address, buf: &mut [u8]) -> Result<()> {
        self.check_range(address, buf.len())?;
        self.read_raw(address.raw(), buf)
    }

    /// Returns the address stored in a header root slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if `slot` is out of range.
    pub fn root(&self, slot: usize) -> Result<Address> {
        self.get_address(Self::root_slot(slot)?)
    }

    /// Returns the location of a header root slot, usable as a B-tree root pointer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if `slot` is out of range.
    pub fn root_slot(slot: usize) -> Result<Address> {
        if slot >= ROOT_SLOT_COUNT {
            return Err(Error::InvalidAddress {
                address: Address::new(ROOT_SLOTS_OFFSET + (slot * Address::SIZE) as u64),
            });
        }
        Ok(DatabaseHeader::root_slot_address(slot))
    }

    /// Returns the format version stored in the header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the header chunk cannot be read.
    pub fn version(&self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_raw(VERSION_OFFSET, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    /// Returns the number of chunks in the address space, header chunks included.
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count.load(Ordering::Acquire)
    }

    /// Returns `true` if writes are refused.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the configuration the database was opened with.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Returns the shared chunk cache.
    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    /// Returns this database's id within the chunk cache.
    pub fn id(&self) -> DatabaseId {
        self.id
    }

    /// Returns a snapshot of per-pool allocation accounting since open.
    pub fn memory_stats(&self) -> MemoryStats {
        self.stats.lock().clone()
    }

    // ------------------------------------------------------------------
    // Internals shared with the allocator
    // ------------------------------------------------------------------

    /// Byte offset one past the end of the address space.
    pub(crate) fn end_offset(&self) -> u64 {
        self.chunk_count() * CHUNK_SIZE as u64
    }

    /// Rejects ranges that touch the fixed header fields or run past the end.
    fn check_range(&self, address: Address, len: usize) -> Result<()> {
        let start = address.raw();
        let end = start.checked_add(len as u64);
        match end {
            Some(end) if start >= ROOT_SLOTS_OFFSET && end <= self.end_offset() => Ok(()),
            _ => Err(Error::InvalidAddress { address }),
        }
    }

    pub(crate) fn chunk(&self, number: u64) -> Result<Arc<Chunk>> {
        self.cache.get_or_insert_with(self.id, number, || {
            Ok(Chunk::from_bytes(number, self.backend.read_chunk(number)?))
        })
    }

    pub(crate) fn read_raw(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.end_offset() {
            return Err(Error::InvalidAddress { address: Address::new(offset) });
        }

        let mut position = offset;
        let mut done = 0;
        while done < buf.len() {
            let number = position / CHUNK_SIZE as u64;
            let within = (position % CHUNK_SIZE as u64) as usize;
            let len = (buf.len() - done).min(CHUNK_SIZE - within);
            self.chunk(number)?.read(within, &mut buf[done..done + len]);
            position += len as u64;
            done += len;
        }
        Ok(())
    }

    pub(crate) fn read_u64_raw(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_raw(offset, &mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    pub(crate) fn read_i32_raw(&self, offset: u64) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_raw(offset, &mut buf)?;
        Ok(LittleEndian::read_i32(&buf))
    }

    pub(crate) fn read_i16_raw(&self, offset: u64) -> Result<i16> {
        let mut buf = [0u8; 2];
        self.read_raw(offset, &mut buf)?;
        Ok(LittleEndian::read_i16(&buf))
    }

    /// Applies `apply` to every chunk slice of `[offset, offset + len)`.
    fn modify_raw(
        &self,
        state: &mut WriterState,
        offset: u64,
        len: usize,
        mut apply: impl FnMut(&Chunk, usize, std::ops::Range<usize>),
    ) -> Result<()> {
        if offset + len as u64 > self.end_offset() {
            return Err(Error::InvalidAddress { address: Address::new(offset) });
        }

        let mut position = offset;
        let mut done = 0;
        while done < len {
            let number = position / CHUNK_SIZE as u64;
            let within = (position % CHUNK_SIZE as u64) as usize;
            let part = (len - done).min(CHUNK_SIZE - within);
            let chunk = self.chunk(number)?;
            apply(&chunk, within, done..done + part);
            if state.dirty.mark(number) {
                // Re-pin: the chunk may have been evicted while still clean.
                self.cache.insert(self.id, chunk);
            }
            position += part as u64;
            done += part;
        }
        Ok(())
    }

    pub(crate) fn write_raw(&self, state: &mut WriterState, offset: u64, bytes: &[u8]) -> Result<()> {
        self.modify_raw(state, offset, bytes.len(), |chunk, within, range| {
            chunk.write(within, &bytes[range]);
        })
    }

    pub(crate) fn clear_raw(&self, state: &mut WriterState, offset: u64, len: usize) -> Result<()> {
        self.modify_raw(state, offset, len, |chunk, within, range| {
            chunk.clear(within, range.len());
        })
    }

    pub(crate) fn write_u64_raw(&self, state: &mut WriterState, offset: u64, value: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.write_raw(state, offset, &buf)
    }

    pub(crate) fn write_i32_raw(&self, state: &mut WriterState, offset: u64, value: i32) -> Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, value);
        self.write_raw(state, offset, &buf)
    }

    pub(crate) fn write_i16_raw(&self, state: &mut WriterState, offset: u64, value: i16) -> Result<()> {
        let mut buf = [0u8; 2];
        LittleEndian::write_i16(&mut buf, value);
        self.write_raw(state, offset, &buf)
    }

    /// Appends `count` zeroed chunks to the address space and returns the first one's number.
    pub(crate) fn grow(&self, state: &mut WriterState, count: u64) -> Result<u64> {
        let first = self.chunk_count();
        let new_count = first + count;
        for number in first..new_count {
            self.cache.insert(self.id, Arc::new(Chunk::zeroed(number)));
            state.dirty.mark(number);
        }
        self.chunk_count.store(new_count, Ordering::Release);
        self.write_u64_raw(state, CHUNK_COUNT_OFFSET, new_count)?;

        tracing::debug!(from = first, to = new_count, "Grew chunk area");
        Ok(first)
    }

    fn flush_locked(&self, state: &mut WriterState) -> Result<FlushStatus> {
        if state.dirty.is_empty() {
            return Ok(FlushStatus::default());
        }

        let mut header = [0u8; HEADER_SIZE];
        self.read_raw(0, &mut header)?;
        let checksum = DatabaseHeader::checksum_of(&header);
        self.write_u64_raw(state, CHECKSUM_OFFSET, checksum)?;

        let chunks =
            state.dirty.iter().map(|number| self.chunk(number)).collect::<Result<Vec<_>>>()?;
        for chunk in &chunks {
            state.writer.write(chunk.number() * CHUNK_SIZE as u64, &chunk.to_vec());
        }

        let status = state.writer.flush(&*self.backend)?;
        if status.interrupted {
            return Ok(status);
        }

        for chunk in &chunks {
            chunk.mark_clean();
        }
        state.dirty.clear();
        self.backend.sync()?;

        tracing::debug!(
            chunks = chunks.len(),
            bytes = status.bytes_written,
            writes = status.physical_writes,
            "Flushed database"
        );
        Ok(status)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if !self.read_only {
            if let Err(e) = self.flush() {
                tracing::warn!(error = %e, "Flush failed while dropping database");
            }
        }
        self.cache.remove_database(self.id);
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id)
            .field("chunk_count", &self.chunk_count())
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// Exclusive write access to a [`Database`].
///
/// Dereferences to the database, so every read is available while holding the
/// lock. Dropping the lock does not flush.
pub struct WriteLock<'db> {
    db: &'db Database,
    pub(crate) state: MutexGuard<'db, WriterState>,
}

impl<'db> WriteLock<'db> {
    /// Returns the locked database with the lock's own lifetime.
    pub fn database(&self) -> &'db Database {
        self.db
    }

    /// Writes a `u8`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn put_u8(&mut self, address: Address, value: u8) -> Result<()> {
        self.put_bytes(address, &[value])
    }

    /// Writes an `i16`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn put_i16(&mut self, address: Address, value: i16) -> Result<()> {
        let mut buf = [0u8; 2];
        LittleEndian::write_i16(&mut buf, value);
        self.put_bytes(address, &buf)
    }

    /// Writes a `u16`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn put_u16(&mut self, address: Address, value: u16) -> Result<()> {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.put_bytes(address, &buf)
    }

    /// Writes an `i32`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn put_i32(&mut self, address: Address, value: i32) -> Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, value);
        self.put_bytes(address, &buf)
    }

    /// Writes a `u32`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn put_u32(&mut self, address: Address, value: u32) -> Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.put_bytes(address, &buf)
    }

    /// Writes an `i64`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn put_i64(&mut self, address: Address, value: i64) -> Result<()> {
        let mut buf = [0u8; 8];
        LittleEndian::write_i64(&mut buf, value);
        self.put_bytes(address, &buf)
    }

    /// Writes a `u64`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn put_u64(&mut self, address: Address, value: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.put_bytes(address, &buf)
    }

    /// Writes an `f32`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn put_f32(&mut self, address: Address, value: f32) -> Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_f32(&mut buf, value);
        self.put_bytes(address, &buf)
    }

    /// Writes an `f64`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn put_f64(&mut self, address: Address, value: f64) -> Result<()> {
        let mut buf = [0u8; 8];
        LittleEndian::write_f64(&mut buf, value);
        self.put_bytes(address, &buf)
    }

    /// Writes an address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn put_address(&mut self, address: Address, value: Address) -> Result<()> {
        self.put_u64(address, value.raw())
    }

    /// Writes `bytes` at `address`, crossing chunk boundaries as needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn put_bytes(&mut self, address: Address, bytes: &[u8]) -> Result<()> {
        self.db.check_range(address, bytes.len())?;
        self.db.write_raw(&mut self.state, address.raw(), bytes)
    }

    /// Zeroes `len` bytes at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is outside the address space.
    pub fn clear_range(&mut self, address: Address, len: usize) -> Result<()> {
        self.db.check_range(address, len)?;
        self.db.clear_raw(&mut self.state, address.raw(), len)
    }

    /// Stores an address in a header root slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if `slot` is out of range.
    pub fn set_root(&mut self, slot: usize, value: Address) -> Result<()> {
        let location = Database::root_slot(slot)?;
        self.put_address(location, value)
    }

    /// Stamps a new format version into the header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the header chunk cannot be read.
    pub fn set_version(&mut self, version: u32) -> Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, version);
        self.db.write_raw(&mut self.state, VERSION_OFFSET, &buf)
    }

    /// Flushes all dirty chunks while keeping the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a write or the final sync fails.
    pub fn flush(&mut self) -> Result<FlushStatus> {
        self.db.flush_locked(&mut self.state)
    }

    /// Returns the number of chunks written since the last completed flush.
    pub fn dirty_chunk_count(&self) -> usize {
        self.state.dirty.len()
    }
}

impl Deref for WriteLock<'_> {
    type Target = Database;

    fn deref(&self) -> &Database {
        self.db
    }
}

impl fmt::Debug for WriteLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteLock").field("db", &self.db).finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::types::POOL_MISC;

    fn memory_db() -> Database {
        Database::open_in_memory(Arc::new(ChunkCache::default()), DatabaseConfig::default())
            .unwrap()
    }

    #[test]
    fn test_new_database_layout() {
        let db = memory_db();
        assert_eq!(db.chunk_count(), HEADER_CHUNKS);
        assert_eq!(db.version().unwrap(), 1);
        for slot in 0..ROOT_SLOT_COUNT {
            assert!(db.root(slot).unwrap().is_null());
        }
    }

    #[test]
    fn test_put_get_primitives() {
        let db = memory_db();
        let mut lock = db.acquire_write_lock().unwrap();
        let a = lock.malloc(64, POOL_MISC).unwrap();

        lock.put_u8(a, 0xAB).unwrap();
        lock.put_i16(a.add(2), -1234).unwrap();
        lock.put_u32(a.add(4), 0xDEAD_BEEF).unwrap();
        lock.put_i64(a.add(8), -42).unwrap();
        lock.put_f64(a.add(16), 2.5).unwrap();
        lock.put_f32(a.add(24), -0.75).unwrap();
        lock.put_address(a.add(32), Address::new(0x2010)).unwrap();

        assert_eq!(lock.get_u8(a).unwrap(), 0xAB);
        assert_eq!(lock.get_i16(a.add(2)).unwrap(), -1234);
        assert_eq!(lock.get_u32(a.add(4)).unwrap(), 0xDEAD_BEEF);
        assert_eq!(lock.get_i64(a.add(8)).unwrap(), -42);
        assert_eq!(lock.get_f64(a.add(16)).unwrap(), 2.5);
        assert_eq!(lock.get_f32(a.add(24)).unwrap(), -0.75);
        assert_eq!(lock.get_address(a.add(32)).unwrap(), Address::new(0x2010));
    }

    #[test]
    fn test_cross_chunk_bytes() {
        let db = memory_db();
        let mut lock = db.acquire_write_lock().unwrap();
        let a = lock.malloc(3 * CHUNK_SIZE, POOL_MISC).unwrap();

        let payload: Vec<u8> = (0..CHUNK_SIZE + 100).map(|i| (i % 251) as u8).collect();
        let start = a.add(CHUNK_SIZE as u64 - 50);
        lock.put_bytes(start, &payload).unwrap();

        let mut back = vec![0u8; payload.len()];
        lock.get_bytes(start, &mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_out_of_range_access() {
        let db = memory_db();
        let end = Address::new(db.chunk_count() * CHUNK_SIZE as u64);
        assert!(matches!(db.get_u64(end), Err(Error::InvalidAddress { .. })));
        assert!(matches!(db.get_u8(Address::NULL), Err(Error::InvalidAddress { .. })));

        let mut lock = db.acquire_write_lock().unwrap();
        assert!(matches!(lock.put_u32(end.sub(2), 1), Err(Error::InvalidAddress { .. })));
        assert!(matches!(
            lock.put_u32(Address::new(VERSION_OFFSET), 9),
            Err(Error::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_root_slots() {
        let db = memory_db();
        let mut lock = db.acquire_write_lock().unwrap();
        lock.set_root(3, Address::new(0x2008)).unwrap();
        assert_eq!(lock.root(3).unwrap(), Address::new(0x2008));
        assert!(lock.set_root(ROOT_SLOT_COUNT, Address::NULL).is_err());
    }

    #[test]
    fn test_flush_with_nothing_dirty_is_noop() {
        let backend = Arc::new(InMemoryBackend::new());
        let db = Database::from_backend(
            Box::new(Arc::clone(&backend)),
            Arc::new(ChunkCache::default()),
            DatabaseConfig::default(),
        )
        .unwrap();

        let first = db.flush().unwrap();
        assert!(first.physical_writes > 0);
        backend.clear_writes();

        let second = db.flush().unwrap();
        assert_eq!(second, FlushStatus::default());
        assert!(backend.writes().is_empty());
    }

    #[test]
    fn test_flush_coalesces_adjacent_dirty_chunks() {
        let backend = Arc::new(InMemoryBackend::new());
        let db = Database::from_backend(
            Box::new(Arc::clone(&backend)),
            Arc::new(ChunkCache::default()),
            DatabaseConfig::default(),
        )
        .unwrap();

        db.flush().unwrap();
        backend.clear_writes();

        {
            let mut lock = db.acquire_write_lock().unwrap();
            // Three fresh chunks plus the header chunk.
            lock.malloc(3 * CHUNK_SIZE - 100, POOL_MISC).unwrap();
            assert_eq!(lock.dirty_chunk_count(), 4);
        }
        db.flush().unwrap();

        let writes = backend.writes();
        assert_eq!(writes.len(), 2, "header chunk and the new run: {writes:?}");
        assert_eq!(writes[0], (0, CHUNK_SIZE));
        assert_eq!(writes[1], (2 * CHUNK_SIZE as u64, 3 * CHUNK_SIZE));
    }

    #[test]
    fn test_interrupted_flush_keeps_chunks_dirty() {
        let backend = Arc::new(InMemoryBackend::new());
        let db = Database::from_backend(
            Box::new(Arc::clone(&backend)),
            Arc::new(ChunkCache::default()),
            DatabaseConfig::default(),
        )
        .unwrap();

        backend.interrupt_after(0);
        let status = db.flush().unwrap();
        assert!(status.interrupted);
        assert_eq!(backend.sync_count(), 0);

        let retry = db.flush().unwrap();
        assert!(retry.is_complete());
        assert_eq!(backend.sync_count(), 1);
        assert_eq!(backend.file_size().unwrap(), HEADER_CHUNKS * CHUNK_SIZE as u64);
    }

    #[test]
    fn test_reopen_file_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.nd");
        let cache = Arc::new(ChunkCache::default());

        let address = {
            let db = Database::open(&path, Arc::clone(&cache), DatabaseConfig::default()).unwrap();
            let mut lock = db.acquire_write_lock().unwrap();
            let address = lock.malloc(100, POOL_MISC).unwrap();
            lock.put_u64(address, 0x0123_4567_89AB_CDEF).unwrap();
            lock.set_root(1, address).unwrap();
            drop(lock);
            db.close().unwrap();
            address
        };

        let db = Database::open(&path, cache, DatabaseConfig::default()).unwrap();
        assert_eq!(db.root(1).unwrap(), address);
        assert_eq!(db.get_u64(address).unwrap(), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn test_version_outside_range_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.nd");
        let cache = Arc::new(ChunkCache::default());

        let v3 = DatabaseConfig::builder().current_version(3).min_version(1).max_version(3).build();
        Database::open(&path, Arc::clone(&cache), v3).unwrap().close().unwrap();
        let before = std::fs::read(&path).unwrap();

        let strict = DatabaseConfig::builder().min_version(4).max_version(5).build();
        let err = Database::open(&path, Arc::clone(&cache), strict).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { version: 3, min: 4, max: 5 }));
        assert_eq!(std::fs::read(&path).unwrap(), before, "no write on version mismatch");

        let lenient = DatabaseConfig::builder().min_version(2).max_version(3).build();
        let db = Database::open(&path, cache, lenient).unwrap();
        assert_eq!(db.version().unwrap(), 3);
    }

    #[test]
    fn test_read_only_database_refuses_write_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.nd");
        let cache = Arc::new(ChunkCache::default());
        Database::open(&path, Arc::clone(&cache), DatabaseConfig::default())
            .unwrap()
            .close()
            .unwrap();

        let config = DatabaseConfig::builder().read_only(true).build();
        let db = Database::open(&path, cache, config).unwrap();
        assert!(db.is_read_only());
        assert!(matches!(db.acquire_write_lock(), Err(Error::ReadOnly)));
        assert_eq!(db.flush().unwrap(), FlushStatus::default());
    }

    #[test]
    fn test_corrupted_header_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.nd");
        let cache = Arc::new(ChunkCache::default());
        Database::open(&path, Arc::clone(&cache), DatabaseConfig::default())
            .unwrap()
            .close()
            .unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[CHUNK_COUNT_OFFSET as usize] ^= 0x40;
        std::fs::write(&path, &bytes).unwrap();

        let err = Database::open(&path, Arc::clone(&cache), DatabaseConfig::default()).unwrap_err();
        assert!(matches!(err, Error::HeaderChecksumMismatch));

        bytes[0] = b'X';
        std::fs::write(&path, &bytes).unwrap();
        let err = Database::open(&path, cache, DatabaseConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidMagic));
    }

    #[test]
    fn test_drop_flushes() {
        let backend = Arc::new(InMemoryBackend::new());
        {
            let db = Database::from_backend(
                Box::new(Arc::clone(&backend)),
                Arc::new(ChunkCache::default()),
                DatabaseConfig::default(),
            )
            .unwrap();
            let mut lock = db.acquire_write_lock().unwrap();
            lock.set_root(0, Address::new(0x2008)).unwrap();
        }

        let db = Database::from_backend(
            Box::new(Arc::clone(&backend)),
            Arc::new(ChunkCache::default()),
            DatabaseConfig::default(),
        )
        .unwrap();
        assert_eq!(db.root(0).unwrap(), Address::new(0x2008));
    }

    #[test]
    fn test_rejected_open_leaves_shared_cache_untouched() {
        let source = Arc::new(InMemoryBackend::new());
        Database::from_backend(
            Box::new(Arc::clone(&source)),
            Arc::new(ChunkCache::default()),
            DatabaseConfig::default(),
        )
        .unwrap()
        .close()
        .unwrap();
        let mut bad_magic = source.contents();
        bad_magic[0] = b'X';

        let cache = Arc::new(ChunkCache::default());
        let err = Database::from_backend(
            Box::new(InMemoryBackend::read_only(bad_magic)),
            Arc::clone(&cache),
            DatabaseConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidMagic), "{err}");

        let strict = DatabaseConfig::builder().min_version(4).max_version(5).build();
        let err = Database::from_backend(
            Box::new(InMemoryBackend::read_only(source.contents())),
            Arc::clone(&cache),
            strict,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { .. }), "{err}");

        let read_only = DatabaseConfig::builder().read_only(true).build();
        assert!(
            Database::from_backend(Box::new(InMemoryBackend::new()), Arc::clone(&cache), read_only)
                .is_err()
        );

        assert!(cache.is_empty());
        let db = Database::open_in_memory(Arc::clone(&cache), DatabaseConfig::default()).unwrap();
        assert_eq!(db.id(), 1, "failed opens must not consume database ids");
    }

    #[test]
    fn test_shared_cache_isolates_databases() {
        let cache = Arc::new(ChunkCache::default());
        let a = Database::open_in_memory(Arc::clone(&cache), DatabaseConfig::default()).unwrap();
        let b = Database::open_in_memory(Arc::clone(&cache), DatabaseConfig::default()).unwrap();

        a.acquire_write_lock().unwrap().set_root(0, Address::new(0x3008)).unwrap();
        assert!(b.root(0).unwrap().is_null());
        assert_ne!(a.id(), b.id());

        let a_id = a.id();
        a.close().unwrap();
        assert!(!cache.contains(a_id, 0));
        assert!(cache.contains(b.id(), 0));
    }
}
