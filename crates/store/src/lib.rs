//! nd-store: an embedded single-file record store.
//!
//! Records live in one flat, paged address space and refer to each other by
//! [`Address`]. On top of a size-bucketed allocator the crate provides B-tree
//! indices, growable address arrays, strings, and a schema layer whose
//! relationship fields keep inverse pointers consistent and cascade deletions
//! through ownership and reference counts.
//!
//! - **Single file**: header, malloc table and data area share one file
//! - **Shared chunk cache**: one [`ChunkCache`] serves every open database
//! - **Coalesced flushes**: adjacent dirty ranges become one physical write
//! - **Explicit locking**: every mutation goes through a [`WriteLock`]
//! - **Deferred deletion**: [`NdWriteLock::process_deletions`] drains cascades
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Nd / Schema                  │
//! │  (typed fields, relationships, deletions)   │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │     BTree / RawGrowableArray / strings       │
//! │      (indices, child lists, text)           │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │            Database (allocator)              │
//! │  (malloc table, free-block trie, root slots) │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │        ChunkCache / ChunkWriter              │
//! │   (shared page cache, write coalescing)     │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │            Storage Backend                   │
//! │      (FileBackend / InMemoryBackend)        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use nd_store::{
//!     Address, ChunkCache, DatabaseConfig, FieldManyToOne, FieldOneToMany, Nd, SchemaBuilder,
//! };
//!
//! let mut b = SchemaBuilder::new();
//! let file = b.create_struct::<Address>("File", None);
//! let types = FieldOneToMany::<Address>::create(&mut b, file, 2);
//! b.done(file);
//! let type_def = b.create_struct::<Address>("Type", None);
//! let owner = FieldManyToOne::<Address>::create_owner(&mut b, type_def, types);
//! let modifiers = b.add_int(type_def);
//! b.done(type_def);
//! let schema = Arc::new(b.build()?);
//!
//! let nd = Nd::open_in_memory(Arc::new(ChunkCache::new(256)), schema, DatabaseConfig::default())?;
//! let mut w = nd.acquire_write_lock()?;
//! let f = w.create(file)?;
//! let t = w.create(type_def)?;
//! owner.put(&mut w, t, Some(f))?;
//! modifiers.put(&mut w, t, 0x9)?;
//! assert_eq!(types.as_list(&w, f)?, vec![t]);
//!
//! // Deleting the file takes its owned types with it.
//! w.delete(f)?;
//! assert_eq!(w.process_deletions()?, 2);
//! # Ok::<(), nd_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
// Test code style - allow field reassignment after default
#![cfg_attr(test, allow(clippy::field_reassign_with_default))]

pub mod backend;
pub mod btree;
pub mod chunk;
pub mod db;
mod dirty_bitmap;
pub mod error;
pub mod field;
pub mod growable;
pub mod integrity;
pub mod malloc;
pub mod nd;
pub mod schema;
pub mod string;
pub mod types;

// Re-export commonly used types
pub use backend::{DatabaseHeader, FileBackend, HEADER_SIZE, InMemoryBackend, MAGIC, StorageBackend};
pub use btree::{BTree, BTreeComparator, BTreeVisitor, DEFAULT_DEGREE};
pub use chunk::{CHUNK_SIZE, CacheStats, ChunkCache, ChunkWriter, FlushStatus};
pub use db::{Database, DatabaseConfig, WriteLock};
pub use error::{Error, Result};
pub use field::{
    FieldByte, FieldChar, FieldDouble, FieldFloat, FieldInt, FieldList, FieldLong, FieldManyToOne,
    FieldOneToMany, FieldOneToOne, FieldPointer, FieldSearchIndex, FieldSearchKey, FieldShort,
    FieldString, SearchCriteria,
};
pub use growable::RawGrowableArray;
pub use integrity::{IntegrityChecker, IntegrityError, IntegrityReport};
pub use malloc::{MemoryStats, PoolStats};
pub use nd::{Nd, NdWriteLock, ROOT_RECORD_SLOT};
pub use schema::{RECORD_HEADER_SIZE, Schema, SchemaBuilder, StructDef, StructId};
pub use types::{
    Address, NdRecord, POOL_BTREE_BLOCK, POOL_FIRST_NODE_TYPE, POOL_GROWABLE_ARRAY, POOL_LIST_BLOCK,
    POOL_MISC, POOL_ROOT_RECORD, POOL_STRING_LONG, POOL_STRING_SHORT, PoolId, pool_name,
};

/// Store format version.
pub const VERSION: u32 = 1;
