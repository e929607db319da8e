//! Allocator integrity checks.
//!
//! Walks the large-block chain, the small-block free lists and the free-block
//! trie and cross-checks them. Intended for tests, fuzzing and offline repair
//! tooling; a healthy database reports no errors.

use std::collections::BTreeMap;

use crate::{
    backend::{DATA_AREA_OFFSET, MALLOC_TABLE_OFFSET},
    chunk::CHUNK_SIZE,
    db::Database,
    error::Result,
    malloc::{
        BLOCK_HEADER_SIZE, BLOCK_SIZE_DELTA, LARGE_BLOCK_FOOTER_SIZE, LARGE_BLOCK_HEADER_SIZE,
        MALLOC_TABLE_SLOTS, MIN_BLOCK_SIZE, free_tree,
    },
    types::Address,
};

const CHUNK: u64 = CHUNK_SIZE as u64;

/// Result of an integrity check.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    /// Large blocks visited while walking the data area.
    pub large_blocks: u64,
    /// Free large blocks found by the walk.
    pub free_large_blocks: u64,
    /// Entries found on the small-block free lists.
    pub free_small_blocks: u64,
    /// Detailed error descriptions.
    pub errors: Vec<IntegrityError>,
}

impl IntegrityReport {
    /// Returns `true` if no inconsistency was found.
    pub fn is_healthy(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, address: u64, description: String) {
        self.errors.push(IntegrityError { address: Address::new(address), description });
    }
}

/// A single inconsistency.
#[derive(Debug, Clone)]
pub struct IntegrityError {
    /// Where the problem was detected.
    pub address: Address,
    /// Human-readable description of the error.
    pub description: String,
}

/// Integrity checker for a database.
pub struct IntegrityChecker<'a> {
    db: &'a Database,
}

impl<'a> IntegrityChecker<'a> {
    /// Creates a checker for the given database.
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Verifies the allocator's on-disk structures.
    ///
    /// Checks:
    /// - Every large block's header agrees with its footer, and the blocks tile
    ///   the data area exactly
    /// - No two free large blocks are adjacent
    /// - The free-block trie holds exactly the free large blocks, with correct sizes
    /// - Every small free-list entry is free, has its bucket's size and fits its chunk
    ///
    /// # Errors
    ///
    /// Returns an error only if the database cannot be read; inconsistencies are
    /// reported in the returned [`IntegrityReport`].
    pub fn verify_allocator(&self) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();
        let walked = self.walk_large_blocks(&mut report)?;
        self.verify_free_tree(&walked, &mut report)?;
        self.verify_free_lists(&walked, &mut report)?;
        Ok(report)
    }

    /// Walks the data area block by block; returns `start -> (chunks, free)`.
    fn walk_large_blocks(&self, report: &mut IntegrityReport) -> Result<BTreeMap<u64, (u64, bool)>> {
        let mut blocks = BTreeMap::new();
        let end = self.db.end_offset();
        let mut block = DATA_AREA_OFFSET;
        let mut previous_free = false;

        while block < end {
            let tag = self.db.read_i32_raw(block)?;
            if tag == 0 {
                report.error(block, "Large block header is zero".to_string());
                break;
            }
            let chunks = u64::from(tag.unsigned_abs());
            let next = block + chunks * CHUNK;
            if next > end {
                report.error(block, format!("Large block of {chunks} chunks runs past the end"));
                break;
            }
            let footer = self.db.read_i32_raw(next - LARGE_BLOCK_FOOTER_SIZE)?;
            if footer != tag {
                report.error(block, format!("Header {tag} disagrees with footer {footer}"));
            }

            let free = tag > 0;
            if free && previous_free {
                report.error(block, "Adjacent free large blocks were not coalesced".to_string());
            }
            previous_free = free;

            report.large_blocks += 1;
            if free {
                report.free_large_blocks += 1;
            }
            blocks.insert(block, (chunks, free));
            block = next;
        }

        Ok(blocks)
    }

    fn verify_free_tree(
        &self,
        walked: &BTreeMap<u64, (u64, bool)>,
        report: &mut IntegrityReport,
    ) -> Result<()> {
        let indexed = match free_tree::collect(self.db) {
            Ok(indexed) => indexed,
            Err(e) if e.is_io() => return Err(e),
            Err(e) => {
                report.error(free_tree::root(self.db)?, format!("Free tree unreadable: {e}"));
                return Ok(());
            },
        };

        let mut in_tree = BTreeMap::new();
        for (block, key) in indexed {
            match walked.get(&block) {
                Some(&(chunks, true)) if chunks == key => {},
                Some(&(chunks, free)) => report.error(
                    block,
                    format!("Free tree has key {key}, block has {chunks} chunks (free: {free})"),
                ),
                None => report.error(block, "Free tree entry is not a block start".to_string()),
            }
            if in_tree.insert(block, key).is_some() {
                report.error(block, "Block appears twice in the free tree".to_string());
            }
        }

        for (&block, &(_, free)) in walked {
            if free && !in_tree.contains_key(&block) {
                report.error(block, "Free large block missing from the free tree".to_string());
            }
        }
        Ok(())
    }

    fn verify_free_lists(
        &self,
        walked: &BTreeMap<u64, (u64, bool)>,
        report: &mut IntegrityReport,
    ) -> Result<()> {
        let limit = self.db.chunk_count() * CHUNK / MIN_BLOCK_SIZE;

        for slot in 1..MALLOC_TABLE_SLOTS as u64 {
            let size = slot * BLOCK_SIZE_DELTA;
            let mut entry = self.db.read_u64_raw(MALLOC_TABLE_OFFSET + slot * 8)?;
            let mut seen = 0u64;

            while entry != 0 {
                seen += 1;
                if seen > limit {
                    report.error(entry, format!("Free list for size {size} loops"));
                    break;
                }
                if entry < DATA_AREA_OFFSET || entry + size > self.db.end_offset() {
                    report.error(entry, format!("Free list for size {size} leaves the data area"));
                    break;
                }
                if size < MIN_BLOCK_SIZE {
                    report.error(entry, format!("Free list for undersized blocks of {size}"));
                    break;
                }

                let header = self.db.read_i16_raw(entry)?;
                if i64::from(header) != size as i64 {
                    report.error(entry, format!("Free small block header {header} in bucket {size}"));
                }

                let region = entry - (entry - DATA_AREA_OFFSET) % CHUNK;
                let within = entry - region;
                if within < LARGE_BLOCK_HEADER_SIZE || within + size > CHUNK - LARGE_BLOCK_FOOTER_SIZE {
                    report.error(entry, format!("Small block of {size} bytes crosses its chunk"));
                }
                match walked.range(..=region).next_back() {
                    Some((_, &(_, false))) => {},
                    _ => report.error(entry, "Small block lies in a free large block".to_string()),
                }

                report.free_small_blocks += 1;
                entry = self.db.read_u64_raw(entry + BLOCK_HEADER_SIZE)?;
            }
        }
        Ok(())
    }
}
