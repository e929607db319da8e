//! Fuzz target for allocator operation sequences.
//!
//! Interprets the input as a stream of malloc/free operations. After every
//! sequence the free-space structures must pass the integrity walk and the pool
//! statistics must balance.

#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use nd_store::{Address, CHUNK_SIZE, ChunkCache, Database, DatabaseConfig, IntegrityChecker, POOL_MISC};

fuzz_target!(|data: &[u8]| {
    let db = Database::open_in_memory(Arc::new(ChunkCache::new(64)), DatabaseConfig::default())
        .expect("open in-memory database");
    let mut live: Vec<Address> = Vec::new();
    {
        let mut w = db.acquire_write_lock().expect("write lock");
        for op in data.chunks(3) {
            match op {
                [0, i, ..] if !live.is_empty() => {
                    let block = live.swap_remove(usize::from(*i) % live.len());
                    w.free(block, POOL_MISC).expect("free");
                }
                [kind, hi, lo] => {
                    let raw = usize::from(u16::from_le_bytes([*lo, *hi]));
                    let size = if kind % 8 == 7 { raw % (3 * CHUNK_SIZE) + 1 } else { raw % 2_048 + 1 };
                    live.push(w.malloc(size, POOL_MISC).expect("malloc"));
                }
                _ => {}
            }
        }
    }

    let report = IntegrityChecker::new(&db).verify_allocator().expect("integrity walk");
    assert!(report.is_healthy(), "{report:?}");
    assert_eq!(db.memory_stats().pool(POOL_MISC).live_allocations, live.len() as u64);
});
