//! Block allocator over the database's chunk area.
//!
//! Two tiers share the data area:
//!
//! - **Small blocks** live inside one-chunk regions. Each block starts with a
//!   2-byte signed size (negative = allocated, positive = free); sizes are rounded
//!   up to [`BLOCK_SIZE_DELTA`]. Free small blocks of one size form a LIFO list
//!   whose head sits in the malloc table, one slot per size. Small blocks never
//!   coalesce.
//! - **Large blocks** span whole chunks and carry an 8-byte header and footer with
//!   the signed chunk count. Free large blocks coalesce with their neighbors and
//!   are indexed by a bitwise trie keyed on chunk count (see [`free_tree`]).
//!
//! A large block's payload starts exactly 8 bytes past a chunk boundary, an
//! offset no small block payload can have, which is how `free` tells the tiers
//! apart.

pub(crate) mod free_tree;

use std::collections::BTreeMap;

use crate::{
    backend::{DATA_AREA_OFFSET, HEADER_CHUNKS, MALLOC_TABLE_OFFSET},
    chunk::CHUNK_SIZE,
    db::{Database, WriteLock, WriterState},
    error::{Error, Result},
    types::{Address, PoolId},
};

/// Size of a small block's header.
pub const BLOCK_HEADER_SIZE: u64 = 2;
/// Granularity of small block sizes.
pub const BLOCK_SIZE_DELTA: u64 = 8;
/// Smallest small block, big enough to hold the free-list link.
pub const MIN_BLOCK_SIZE: u64 = 16;
/// Size of a large block's header.
pub const LARGE_BLOCK_HEADER_SIZE: u64 = 8;
/// Size of a large block's footer.
pub const LARGE_BLOCK_FOOTER_SIZE: u64 = 8;
/// Largest small block: the usable interior of a one-chunk large block.
pub const MAX_SMALL_BLOCK_SIZE: u64 =
    CHUNK_SIZE as u64 - LARGE_BLOCK_HEADER_SIZE - LARGE_BLOCK_FOOTER_SIZE;
/// Largest payload served from the small tier.
pub const MAX_SMALL_PAYLOAD: usize = (MAX_SMALL_BLOCK_SIZE - BLOCK_HEADER_SIZE) as usize;
/// Number of malloc table slots.
pub const MALLOC_TABLE_SLOTS: usize = (MAX_SMALL_BLOCK_SIZE / BLOCK_SIZE_DELTA) as usize + 1;

const CHUNK: u64 = CHUNK_SIZE as u64;

/// Allocation accounting for one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Allocations not yet freed.
    pub live_allocations: u64,
    /// Block bytes held by live allocations, headers included.
    pub live_bytes: u64,
    /// Allocations since open.
    pub total_allocations: u64,
    /// Frees since open.
    pub total_frees: u64,
}

/// Allocation accounting for every pool, since the database was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pools: BTreeMap<PoolId, PoolStats>,
}

impl MemoryStats {
    /// Returns the stats of one pool.
    pub fn pool(&self, pool: PoolId) -> PoolStats {
        self.pools.get(&pool).copied().unwrap_or_default()
    }

    /// Iterates pools that saw any activity.
    pub fn pools(&self) -> impl Iterator<Item = (PoolId, &PoolStats)> {
        self.pools.iter().map(|(&pool, stats)| (pool, stats))
    }

    /// Block bytes held by live allocations across all pools.
    pub fn live_bytes(&self) -> u64 {
        self.pools.values().map(|p| p.live_bytes).sum()
    }

    /// Live allocations across all pools.
    pub fn live_allocations(&self) -> u64 {
        self.pools.values().map(|p| p.live_allocations).sum()
    }

    fn record_malloc(&mut self, pool: PoolId, bytes: u64) {
        let stats = self.pools.entry(pool).or_default();
        stats.live_allocations += 1;
        stats.live_bytes += bytes;
        stats.total_allocations += 1;
    }

    fn record_free(&mut self, pool: PoolId, bytes: u64) {
        let stats = self.pools.entry(pool).or_default();
        stats.live_allocations = stats.live_allocations.saturating_sub(1);
        stats.live_bytes = stats.live_bytes.saturating_sub(bytes);
        stats.total_frees += 1;
    }
}

/// Block size serving a small request, or `None` if it needs the large tier.
fn small_block_size(size: usize) -> Option<u64> {
    let needed = (size as u64).saturating_add(BLOCK_HEADER_SIZE).max(MIN_BLOCK_SIZE);
    let rounded = needed.div_ceil(BLOCK_SIZE_DELTA) * BLOCK_SIZE_DELTA;
    (rounded <= MAX_SMALL_BLOCK_SIZE).then_some(rounded)
}

/// Chunk count of a large block with `size` payload bytes.
fn large_chunk_count(size: usize) -> Result<u64> {
    let total = (size as u64)
        .checked_add(LARGE_BLOCK_HEADER_SIZE + LARGE_BLOCK_FOOTER_SIZE)
        .ok_or(Error::AllocationTooLarge { size })?;
    let chunks = total.div_ceil(CHUNK);
    if chunks > i32::MAX as u64 {
        return Err(Error::AllocationTooLarge { size });
    }
    Ok(chunks)
}

fn is_large_payload(address: u64) -> bool {
    (address - LARGE_BLOCK_HEADER_SIZE) % CHUNK == 0
}

fn malloc_table_slot(block_size: u64) -> u64 {
    MALLOC_TABLE_OFFSET + (block_size / BLOCK_SIZE_DELTA) * Address::SIZE as u64
}

/// Allocator view over the locked database.
pub(crate) struct Allocator<'a> {
    pub(crate) db: &'a Database,
    pub(crate) state: &'a mut WriterState,
}

impl Allocator<'_> {
    pub(crate) fn read_u64(&self, offset: u64) -> Result<u64> {
        self.db.read_u64_raw(offset)
    }

    pub(crate) fn write_u64(&mut self, offset: u64, value: u64) -> Result<()> {
        self.db.write_u64_raw(self.state, offset, value)
    }

    // ------------------------------------------------------------------
    // Small tier
    // ------------------------------------------------------------------

    /// Allocates a small block of exactly-rounded `block_size`; returns the block start.
    fn malloc_small(&mut self, block_size: u64) -> Result<u64> {
        let mut candidate = block_size;
        while candidate <= MAX_SMALL_BLOCK_SIZE {
            let head = self.read_u64(malloc_table_slot(candidate))?;
            if head != 0 {
                let next = self.read_u64(head + BLOCK_HEADER_SIZE)?;
                self.write_u64(malloc_table_slot(candidate), next)?;
                return self.carve_small(head, candidate, block_size);
            }
            candidate += BLOCK_SIZE_DELTA;
        }

        let region = self.malloc_large(1)? + LARGE_BLOCK_HEADER_SIZE;
        self.carve_small(region, MAX_SMALL_BLOCK_SIZE, block_size)
    }

    /// Takes `wanted` bytes from the front of a free region, returning the rest to its list.
    fn carve_small(&mut self, block: u64, available: u64, wanted: u64) -> Result<u64> {
        let used = if available - wanted >= MIN_BLOCK_SIZE {
            self.push_small(block + wanted, available - wanted)?;
            wanted
        } else {
            available
        };
        self.db.write_i16_raw(self.state, block, -(used as i16))?;
        Ok(block)
    }

    fn push_small(&mut self, block: u64, block_size: u64) -> Result<()> {
        let slot = malloc_table_slot(block_size);
        let head = self.read_u64(slot)?;
        self.db.write_i16_raw(self.state, block, block_size as i16)?;
        self.write_u64(block + BLOCK_HEADER_SIZE, head)?;
        self.write_u64(slot, block)
    }

    /// Frees a small block; returns its size.
    fn free_small(&mut self, block: u64) -> Result<u64> {
        let header = self.db.read_i16_raw(block)?;
        if header >= 0 {
            return Err(Error::corrupted(format!(
                "Freeing small block {block:#x} that is not allocated (header {header})"
            )));
        }
        let size = u64::from(header.unsigned_abs());
        if size < MIN_BLOCK_SIZE || size > MAX_SMALL_BLOCK_SIZE || size % BLOCK_SIZE_DELTA != 0 {
            return Err(Error::corrupted(format!("Small block {block:#x} has size {size}")));
        }
        self.push_small(block, size)?;
        Ok(size)
    }

    // ------------------------------------------------------------------
    // Large tier
    // ------------------------------------------------------------------

    fn read_tag(&self, offset: u64) -> Result<i32> {
        self.db.read_i32_raw(offset)
    }

    fn write_tags(&mut self, block: u64, chunks: u64, free: bool) -> Result<()> {
        let tag = if free { chunks as i32 } else { -(chunks as i32) };
        self.db.write_i32_raw(self.state, block, tag)?;
        self.db.write_i32_raw(self.state, block + chunks * CHUNK - LARGE_BLOCK_FOOTER_SIZE, tag)
    }

    /// Chunk count of the large block ending right before `block`, or zero at the start.
    fn left_neighbor_chunks(&self, block: u64) -> Result<u64> {
        if block <= DATA_AREA_OFFSET {
            return Ok(0);
        }
        Ok(u64::from(self.read_tag(block - LARGE_BLOCK_FOOTER_SIZE)?.unsigned_abs()))
    }

    /// Chunk count of the large block starting at `block`, or zero past the end.
    fn right_neighbor_chunks(&self, block: u64) -> Result<u64> {
        if block >= self.db.end_offset() {
            return Ok(0);
        }
        Ok(u64::from(self.read_tag(block)?.unsigned_abs()))
    }

    /// Allocates `chunks` whole chunks; returns the block start.
    pub(crate) fn malloc_large(&mut self, chunks: u64) -> Result<u64> {
        if let Some((block, found)) = free_tree::best_fit(self.db, chunks)? {
            self.remove_free_block(block)?;
            let allocated = if found > chunks {
                self.split_free(block, found, chunks)?
            } else {
                block
            };
            self.write_tags(allocated, chunks, false)?;
            return Ok(allocated);
        }

        let end = self.db.end_offset();
        let mut start = end;
        let mut reused = 0;
        if self.db.chunk_count() > HEADER_CHUNKS {
            let trailing = self.read_tag(end - LARGE_BLOCK_FOOTER_SIZE)?;
            if trailing > 0 {
                reused = trailing as u64;
                start = end - reused * CHUNK;
                self.remove_free_block(start)?;
            }
        }

        self.db.grow(self.state, chunks - reused)?;
        self.write_tags(start, chunks, false)?;
        Ok(start)
    }

    /// Splits a free block, keeping the remainder next to the larger neighbor.
    /// Returns the start of the `wanted`-chunk part.
    fn split_free(&mut self, block: u64, found: u64, wanted: u64) -> Result<u64> {
        let remainder = found - wanted;
        let left = self.left_neighbor_chunks(block)?;
        let right = self.right_neighbor_chunks(block + found * CHUNK)?;

        let (allocated, free_start) = if right > left {
            (block, block + wanted * CHUNK)
        } else {
            (block + remainder * CHUNK, block)
        };

        self.write_tags(free_start, remainder, true)?;
        self.insert_free_block(free_start, remainder)?;
        Ok(allocated)
    }

    /// Frees a large block, coalescing with free neighbors; returns its chunk count.
    fn free_large(&mut self, block: u64) -> Result<u64> {
        let tag = self.read_tag(block)?;
        if tag >= 0 {
            return Err(Error::corrupted(format!(
                "Freeing large block {block:#x} that is not allocated (header {tag})"
            )));
        }
        let chunks = u64::from(tag.unsigned_abs());
        let footer = self.read_tag(block + chunks * CHUNK - LARGE_BLOCK_FOOTER_SIZE)?;
        if footer != tag {
            return Err(Error::corrupted(format!(
                "Large block {block:#x} header {tag} disagrees with footer {footer}"
            )));
        }

        let mut start = block;
        let mut total = chunks;

        if block > DATA_AREA_OFFSET {
            let left = self.read_tag(block - LARGE_BLOCK_FOOTER_SIZE)?;
            if left > 0 {
                start = block - left as u64 * CHUNK;
                self.remove_free_block(start)?;
                total += left as u64;
            }
        }

        let next = block + chunks * CHUNK;
        if next < self.db.end_offset() {
            let right = self.read_tag(next)?;
            if right > 0 {
                self.remove_free_block(next)?;
                total += right as u64;
            }
        }

        self.write_tags(start, total, true)?;
        self.insert_free_block(start, total)?;
        Ok(chunks)
    }
}

impl WriteLock<'_> {
    /// Allocates `size` zeroed bytes and returns the payload address.
    ///
    /// The block is accounted to `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationTooLarge`] if the request cannot be represented.
    /// Returns [`Error::Corrupted`] if allocator structures are inconsistent.
    pub fn malloc(&mut self, size: usize, pool: PoolId) -> Result<Address> {
        let db = self.database();
        let mut allocator = Allocator { db, state: &mut *self.state };

        let (payload, payload_len, bytes) = match small_block_size(size) {
            Some(block_size) => {
                let block = allocator.malloc_small(block_size)?;
                let used = u64::from(db.read_i16_raw(block)?.unsigned_abs());
                (block + BLOCK_HEADER_SIZE, used - BLOCK_HEADER_SIZE, used)
            },
            None => {
                let chunks = large_chunk_count(size)?;
                let block = allocator.malloc_large(chunks)?;
                let bytes = chunks * CHUNK;
                (
                    block + LARGE_BLOCK_HEADER_SIZE,
                    bytes - LARGE_BLOCK_HEADER_SIZE - LARGE_BLOCK_FOOTER_SIZE,
                    bytes,
                )
            },
        };

        db.clear_raw(&mut self.state, payload, payload_len as usize)?;
        db.stats.lock().record_malloc(pool, bytes);
        Ok(Address::new(payload))
    }

    /// Returns a block to the allocator. Freeing the null address is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if `address` is outside the data area.
    /// Returns [`Error::Corrupted`] if the block is not currently allocated.
    pub fn free(&mut self, address: Address, pool: PoolId) -> Result<()> {
        if address.is_null() {
            return Ok(());
        }
        let raw = address.raw();
        if raw < DATA_AREA_OFFSET + BLOCK_HEADER_SIZE || raw >= self.end_offset() {
            return Err(Error::InvalidAddress { address });
        }

        let db = self.database();
        let mut allocator = Allocator { db, state: &mut *self.state };
        let bytes = if is_large_payload(raw) {
            allocator.free_large(raw - LARGE_BLOCK_HEADER_SIZE)? * CHUNK
        } else {
            allocator.free_small(raw - BLOCK_HEADER_SIZE)?
        };

        db.stats.lock().record_free(pool, bytes);
        Ok(())
    }
}

impl Database {
    /// Returns the usable payload size of the allocated block at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if `address` is outside the data area.
    /// Returns [`Error::Corrupted`] if no allocated block starts there.
    pub fn block_size(&self, address: Address) -> Result<usize> {
        let raw = address.raw();
        if raw < DATA_AREA_OFFSET + BLOCK_HEADER_SIZE || raw >= self.end_offset() {
            return Err(Error::InvalidAddress { address });
        }

        if is_large_payload(raw) {
            let tag = self.read_i32_raw(raw - LARGE_BLOCK_HEADER_SIZE)?;
            if tag >= 0 {
                return Err(Error::corrupted(format!("No allocated block at {address}")));
            }
            let bytes = u64::from(tag.unsigned_abs()) * CHUNK;
            Ok((bytes - LARGE_BLOCK_HEADER_SIZE - LARGE_BLOCK_FOOTER_SIZE) as usize)
        } else {
            let header = self.read_i16_raw(raw - BLOCK_HEADER_SIZE)?;
            if header >= 0 {
                return Err(Error::corrupted(format!("No allocated block at {address}")));
            }
            Ok((u64::from(header.unsigned_abs()) - BLOCK_HEADER_SIZE) as usize)
        }
    }
}
