//! Fuzz target for opening arbitrary file images.
//!
//! A read-only open of any byte image must either fail with an error or yield a
//! database the allocator walk can inspect without panicking.

#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use nd_store::{ChunkCache, Database, DatabaseConfig, InMemoryBackend, IntegrityChecker};

fuzz_target!(|data: &[u8]| {
    let backend = Box::new(InMemoryBackend::read_only(data.to_vec()));
    let config = DatabaseConfig::builder().read_only(true).build();
    let Ok(db) = Database::from_backend(backend, Arc::new(ChunkCache::new(16)), config) else {
        return;
    };
    let _ = IntegrityChecker::new(&db).verify_allocator();
    for slot in 0..8 {
        let _ = db.root(slot);
    }
});
