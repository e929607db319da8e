//! Chunk cache shared by every open database.
//!
//! The cache stores recently accessed chunks to reduce I/O.
//! Uses clock eviction (approximate LRU) for low overhead. One cache is created
//! by the embedding process and handed to each database it opens; entries are
//! keyed by the database's id so the same physical chunk is buffered once.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;

use super::{Chunk, DatabaseId};
use crate::error::Result;

/// Default cache capacity in chunks (16 MiB of 4 KiB chunks).
pub const DEFAULT_CACHE_CHUNKS: usize = 4096;

type ChunkKey = (DatabaseId, u64);

/// Chunk cache with clock eviction.
///
/// Dirty chunks are never evicted: they stay resident until their database
/// flushes them, growing the cache past its capacity if needed.
pub struct ChunkCache {
    state: RwLock<CacheState>,
    /// Maximum number of chunks to cache.
    capacity: usize,
    next_database_id: AtomicU64,
    /// Total cache hits since creation.
    hits: AtomicU64,
    /// Total cache misses since creation.
    misses: AtomicU64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<ChunkKey, CacheEntry>,
    /// Order of chunks for the clock algorithm.
    order: Vec<ChunkKey>,
    clock_hand: usize,
}

/// Cache entry with access tracking.
struct CacheEntry {
    chunk: Arc<Chunk>,
    /// Whether the chunk was accessed since the last clock sweep (second chance).
    accessed: bool,
}

impl ChunkCache {
    /// Creates a new cache holding up to `capacity` clean chunks.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RwLock::new(CacheState {
                entries: HashMap::with_capacity(capacity),
                order: Vec::with_capacity(capacity),
                clock_hand: 0,
            }),
            capacity: capacity.max(1),
            next_database_id: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Hands out a fresh id for a database that is about to use this cache.
    pub fn register_database(&self) -> DatabaseId {
        self.next_database_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the cached chunk, or `None` if not present.
    pub fn get(&self, database: DatabaseId, number: u64) -> Option<Arc<Chunk>> {
        let mut state = self.state.write();
        if let Some(entry) = state.entries.get_mut(&(database, number)) {
            entry.accessed = true;
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(Arc::clone(&entry.chunk))
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Returns the cached chunk, loading it with `load` on a miss.
    ///
    /// The cache lock is held across `load`, so two threads missing on the same
    /// chunk never buffer it twice.
    ///
    /// # Errors
    ///
    /// Returns whatever `load` returns; nothing is cached in that case.
    pub fn get_or_insert_with(
        &self,
        database: DatabaseId,
        number: u64,
        load: impl FnOnce() -> Result<Chunk>,
    ) -> Result<Arc<Chunk>> {
        let key = (database, number);
        let mut state = self.state.write();
        if let Some(entry) = state.entries.get_mut(&key) {
            entry.accessed = true;
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(&entry.chunk));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let chunk = Arc::new(load()?);
        self.insert_locked(&mut state, key, Arc::clone(&chunk));
        Ok(chunk)
    }

    /// Inserts a chunk, replacing any cached copy.
    ///
    /// May evict an existing clean chunk if the cache is full.
    pub fn insert(&self, database: DatabaseId, chunk: Arc<Chunk>) {
        let key = (database, chunk.number());
        let mut state = self.state.write();
        self.insert_locked(&mut state, key, chunk);
    }

    fn insert_locked(&self, state: &mut CacheState, key: ChunkKey, chunk: Arc<Chunk>) {
        if let Some(entry) = state.entries.get_mut(&key) {
            entry.chunk = chunk;
            entry.accessed = true;
            return;
        }

        if state.entries.len() >= self.capacity && !Self::evict_one(state) {
            tracing::trace!(
                size = state.entries.len(),
                capacity = self.capacity,
                "Chunk cache over capacity, all chunks dirty"
            );
        }

        state.order.push(key);
        state.entries.insert(key, CacheEntry { chunk, accessed: true });
    }

    /// Evicts one chunk using the clock algorithm.
    ///
    /// Never evicts dirty chunks. If all chunks are dirty, returns false and the
    /// cache grows until a database flushes.
    fn evict_one(state: &mut CacheState) -> bool {
        if state.order.is_empty() {
            return true;
        }

        let mut iterations = 0;
        let max_iterations = state.order.len() * 2;

        loop {
            if state.clock_hand >= state.order.len() {
                state.clock_hand = 0;
            }

            let key = state.order[state.clock_hand];
            match state.entries.get_mut(&key) {
                Some(entry) if entry.chunk.is_dirty() => state.clock_hand += 1,
                Some(entry) if entry.accessed => {
                    entry.accessed = false;
                    state.clock_hand += 1;
                },
                Some(_) => {
                    state.entries.remove(&key);
                    let hand = state.clock_hand;
                    state.order.remove(hand);
                    return true;
                },
                None => state.clock_hand += 1,
            }

            iterations += 1;
            if iterations >= max_iterations {
                return false;
            }
        }
    }

    /// Drops every chunk belonging to `database`, dirty or not.
    pub fn remove_database(&self, database: DatabaseId) {
        let mut state = self.state.write();
        state.entries.retain(|key, _| key.0 != database);
        state.order.retain(|key| key.0 != database);
        state.clock_hand = 0;
    }

    /// Returns the number of cached chunks.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Checks if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Checks if a chunk is in the cache.
    pub fn contains(&self, database: DatabaseId, number: u64) -> bool {
        self.state.read().entries.contains_key(&(database, number))
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.read();
        CacheStats {
            size: state.entries.len(),
            capacity: self.capacity,
            dirty_count: state.entries.values().filter(|e| e.chunk.is_dirty()).count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for ChunkCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CHUNKS)
    }
}

impl std::fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCache").field("stats", &self.stats()).finish()
    }
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Current number of cached chunks.
    pub size: usize,
    /// Maximum capacity.
    pub capacity: usize,
    /// Number of dirty chunks.
    pub dirty_count: usize,
    /// Total cache hits since creation.
    pub hits: u64,
    /// Total cache misses since creation.
    pub misses: u64,
}
