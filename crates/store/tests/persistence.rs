//! Durability of the single-file format.
//!
//! Each test writes through one handle, closes it, then reopens the file (possibly
//! after tampering with it) and checks what the second handle sees.

// Test code is allowed to use unwrap for simplicity
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use nd_store::{
    Address, CHUNK_SIZE, ChunkCache, Database, DatabaseConfig, DatabaseHeader, Error, FieldList,
    FieldManyToOne, FieldOneToMany, FieldString, HEADER_SIZE, IntegrityChecker, Nd, POOL_MISC,
    RawGrowableArray, SchemaBuilder, string,
};
use tempfile::tempdir;

fn cache() -> Arc<ChunkCache> {
    Arc::new(ChunkCache::new(128))
}

fn read_header(path: &Path) -> Vec<u8> {
    let mut file = std::fs::File::open(path).unwrap();
    let mut buf = vec![0u8; HEADER_SIZE];
    file.read_exact(&mut buf).unwrap();
    buf
}

fn patch(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

/// Creates a database holding one string referenced from root slot 1.
fn setup(dir: &Path) -> PathBuf {
    let path = dir.join("store.nd");
    let db = Database::open(&path, cache(), DatabaseConfig::default()).unwrap();
    let mut w = db.acquire_write_lock().unwrap();
    let text = string::store(&mut w, "persisted").unwrap();
    w.set_root(1, text).unwrap();
    drop(w);
    db.close().unwrap();
    path
}

#[test]
fn test_reopen_sees_flushed_data() {
    let dir = tempdir().unwrap();
    let path = setup(dir.path());

    let header = DatabaseHeader::from_bytes(&read_header(&path)).unwrap();
    assert_eq!(header.version, 1);
    assert!(!header.roots[1].is_null());

    let db = Database::open(&path, cache(), DatabaseConfig::default()).unwrap();
    let text = db.root(1).unwrap();
    assert_eq!(string::load(&db, text).unwrap(), "persisted");
}

#[test]
fn test_checksum_mismatch_detected() {
    let dir = tempdir().unwrap();
    let path = setup(dir.path());

    // Root slot 2 lies inside the checksummed range.
    patch(&path, 64 + 16, &[0xFF]);
    let err = Database::open(&path, cache(), DatabaseConfig::default()).unwrap_err();
    assert!(matches!(err, Error::HeaderChecksumMismatch), "{err}");
}

#[test]
fn test_bad_magic_detected() {
    let dir = tempdir().unwrap();
    let path = setup(dir.path());

    patch(&path, 0, b"NOTNDDB\0");
    let err = Database::open(&path, cache(), DatabaseConfig::default()).unwrap_err();
    assert!(matches!(err, Error::InvalidMagic), "{err}");
}

#[test]
fn test_version_window_enforced() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("versioned.nd");
    let config = DatabaseConfig::builder().current_version(3).max_version(3).build();
    Database::open(&path, cache(), config).unwrap().close().unwrap();

    let too_old = DatabaseConfig::builder().min_version(1).max_version(2).build();
    let err = Database::open(&path, cache(), too_old).unwrap_err();
    assert!(matches!(err, Error::UnsupportedVersion { version: 3, min: 1, max: 2 }), "{err}");

    let too_new = DatabaseConfig::builder().min_version(4).max_version(6).build();
    assert!(matches!(
        Database::open(&path, cache(), too_new),
        Err(Error::UnsupportedVersion { version: 3, .. })
    ));

    let window = DatabaseConfig::builder().min_version(2).max_version(5).build();
    let db = Database::open(&path, cache(), window).unwrap();
    assert_eq!(db.version().unwrap(), 3);
}

#[test]
fn test_read_only_open() {
    let dir = tempdir().unwrap();
    let path = setup(dir.path());

    let config = DatabaseConfig::builder().read_only(true).build();
    let db = Database::open(&path, cache(), config).unwrap();
    assert!(db.is_read_only());
    assert!(matches!(db.acquire_write_lock(), Err(Error::ReadOnly)));
    assert_eq!(string::load(&db, db.root(1).unwrap()).unwrap(), "persisted");
    db.close().unwrap();

    let missing = dir.path().join("missing.nd");
    let config = DatabaseConfig::builder().read_only(true).build();
    assert!(Database::open(&missing, cache(), config).is_err());
}

#[test]
fn test_freed_space_reused_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reuse.nd");

    let (small, large) = {
        let db = Database::open(&path, cache(), DatabaseConfig::default()).unwrap();
        let mut w = db.acquire_write_lock().unwrap();
        let small = w.malloc(42, POOL_MISC).unwrap();
        let large = w.malloc(3 * CHUNK_SIZE, POOL_MISC).unwrap();
        let _pin = w.malloc(42, POOL_MISC).unwrap();
        w.free(small, POOL_MISC).unwrap();
        w.free(large, POOL_MISC).unwrap();
        drop(w);
        db.close().unwrap();
        (small, large)
    };

    let db = Database::open(&path, cache(), DatabaseConfig::default()).unwrap();
    let chunks = db.chunk_count();
    let mut w = db.acquire_write_lock().unwrap();
    assert_eq!(w.malloc(42, POOL_MISC).unwrap(), small);
    assert_eq!(w.malloc(3 * CHUNK_SIZE, POOL_MISC).unwrap(), large);
    drop(w);
    assert_eq!(db.chunk_count(), chunks);
    assert!(IntegrityChecker::new(&db).verify_allocator().unwrap().is_healthy());
}

#[test]
fn test_growable_array_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("array.nd");
    let array = RawGrowableArray::new(3);

    let (holder, values) = {
        let db = Database::open(&path, cache(), DatabaseConfig::default()).unwrap();
        let mut w = db.acquire_write_lock().unwrap();
        let holder = w.malloc(array.record_size(), POOL_MISC).unwrap();
        let values: Vec<Address> = (1..=600u64).map(|i| Address::new(i * 8)).collect();
        for value in &values {
            array.add(&mut w, holder, *value).unwrap();
        }
        w.set_root(1, holder).unwrap();
        drop(w);
        db.close().unwrap();
        (holder, values)
    };

    let db = Database::open(&path, cache(), DatabaseConfig::default()).unwrap();
    assert_eq!(db.root(1).unwrap(), holder);
    assert_eq!(array.size(&db, holder).unwrap(), 600);
    assert_eq!(array.to_vec(&db, holder).unwrap(), values);
    assert_eq!(array.capacity(&db, holder).unwrap(), array.capacity_for(600));
}

#[test]
fn test_schema_records_round_trip() {
    let mut b = SchemaBuilder::new();
    let note = b.create_struct::<Address>("Note", None);
    b.done(note);
    let folder = b.create_struct::<Address>("Folder", None);
    let title = b.add_string(folder);
    let children = FieldOneToMany::<Address>::create(&mut b, folder, 1);
    let notes = FieldList::<Address>::create(&mut b, folder, note);
    b.done(folder);
    let doc = b.create_struct::<Address>("Doc", None);
    let parent = FieldManyToOne::<Address>::create_owner(&mut b, doc, children);
    let body: FieldString = b.add_string(doc);
    b.done(doc);
    let schema = Arc::new(b.build().unwrap());

    let dir = tempdir().unwrap();
    let path = dir.path().join("schema.nd");
    let long_body = "lorem ipsum ".repeat(2_000);

    let root = {
        let nd = Nd::open(&path, cache(), Arc::clone(&schema), DatabaseConfig::default()).unwrap();
        let mut w = nd.acquire_write_lock().unwrap();
        let root = w.create(folder).unwrap();
        title.put(&mut w, root, "inbox").unwrap();
        for i in 0..5 {
            let d = w.create(doc).unwrap();
            parent.put(&mut w, d, Some(root)).unwrap();
            body.put(&mut w, d, if i == 4 { long_body.as_str() } else { "short" }).unwrap();
        }
        for _ in 0..9 {
            notes.append(&mut w, root).unwrap();
        }
        w.set_root(1, root).unwrap();
        drop(w);
        nd.close().unwrap();
        root
    };

    let nd = Nd::open(&path, cache(), schema, DatabaseConfig::default()).unwrap();
    let db = nd.db();
    assert_eq!(db.root(1).unwrap(), root);
    assert_eq!(title.get(db, root).unwrap(), "inbox");
    let docs = children.as_list(db, root).unwrap();
    assert_eq!(docs.len(), 5);
    for d in &docs {
        assert_eq!(parent.get(db, *d).unwrap(), Some(root));
    }
    assert_eq!(body.get(db, docs[4]).unwrap(), long_body);
    assert_eq!(notes.size(db, root).unwrap(), 9);

    let mut w = nd.acquire_write_lock().unwrap();
    w.delete(root).unwrap();
    assert_eq!(w.process_deletions().unwrap(), 6);
    drop(w);
    assert!(IntegrityChecker::new(nd.db()).verify_allocator().unwrap().is_healthy());
}
