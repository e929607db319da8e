//! The schema-aware database and deferred deletion.
//!
//! [`Nd`] pairs a [`Database`] with a [`Schema`]. Records are created and
//! deleted through an [`NdWriteLock`]. Deleting only schedules a record; the
//! cascade of owned children, back-pointer cleanup and freeing happens in
//! [`NdWriteLock::process_deletions`], which keeps running until nothing is left
//! pending.
//!
//! Header root slot [`ROOT_RECORD_SLOT`] holds the schema's root record, created
//! on first open. The remaining slots are free for callers.

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    ops::{Deref, DerefMut},
    path::Path,
    sync::Arc,
};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    chunk::{ChunkCache, FlushStatus},
    db::{Database, DatabaseConfig, WriteLock},
    error::{Error, Result},
    field,
    schema::{FieldKind, RECORD_HEADER_SIZE, Schema, StructDef, StructId},
    types::{Address, NdRecord, POOL_FIRST_NODE_TYPE, POOL_ROOT_RECORD, PoolId},
};

/// Header root slot holding the root record.
pub const ROOT_RECORD_SLOT: usize = 0;

/// Records scheduled for deletion, in scheduling order, without duplicates.
#[derive(Debug, Default)]
struct DeletionQueue {
    order: VecDeque<Address>,
    members: HashSet<Address>,
}

impl DeletionQueue {
    fn push(&mut self, record: Address) -> bool {
        if !self.members.insert(record) {
            return false;
        }
        self.order.push_back(record);
        true
    }

    fn front(&self) -> Option<Address> {
        self.order.front().copied()
    }

    fn pop(&mut self) {
        if let Some(record) = self.order.pop_front() {
            self.members.remove(&record);
        }
    }

    fn contains(&self, record: Address) -> bool {
        self.members.contains(&record)
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

fn node_pool(node_type: StructId) -> PoolId {
    POOL_FIRST_NODE_TYPE + node_type
}

/// A database whose records follow a [`Schema`].
pub struct Nd {
    db: Database,
    schema: Arc<Schema>,
    pending: Mutex<DeletionQueue>,
}

impl Nd {
    /// Opens or creates the database file at `path`.
    ///
    /// # Errors
    ///
    /// See [`Database::open`]. Also returns [`Error::InvalidNodeType`] if an
    /// existing root record does not match the schema's root struct.
    pub fn open(
        path: impl AsRef<Path>,
        cache: Arc<ChunkCache>,
        schema: Arc<Schema>,
        config: DatabaseConfig,
    ) -> Result<Self> {
        Self::from_database(Database::open(path, cache, config)?, schema)
    }

    /// Creates an in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the root record cannot be created.
    pub fn open_in_memory(cache: Arc<ChunkCache>, schema: Arc<Schema>, config: DatabaseConfig) -> Result<Self> {
        Self::from_database(Database::open_in_memory(cache, config)?, schema)
    }

    /// Attaches a schema to an open database, creating the root record if the
    /// schema declares one and the database has none yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidNodeType`] if an existing root record does not
    /// match the schema, or an allocator error.
    pub fn from_database(db: Database, schema: Arc<Schema>) -> Result<Self> {
        if let Some(root_struct) = schema.root_struct() {
            let root = db.root(ROOT_RECORD_SLOT)?;
            if root.is_null() {
                if !db.is_read_only() {
                    let size = schema.record_size(root_struct).unwrap_or(RECORD_HEADER_SIZE);
                    let mut w = db.acquire_write_lock()?;
                    let record = w.malloc(size, POOL_ROOT_RECORD)?;
                    w.put_u16(record, root_struct)?;
                    w.set_root(ROOT_RECORD_SLOT, record)?;
                    tracing::debug!(record = %record, size, "Created root record");
                }
            } else {
                let node_type = db.get_u16(root)?;
                if node_type != root_struct {
                    return Err(Error::InvalidNodeType { address: root, node_type });
                }
            }
        }

        Ok(Self { db, schema, pending: Mutex::new(DeletionQueue::default()) })
    }

    /// Returns the underlying database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Returns the schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Returns the root record, null if the schema declares none.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the header cannot be read.
    pub fn root_record(&self) -> Result<Address> {
        self.db.root(ROOT_RECORD_SLOT)
    }

    /// Returns the struct of `record`, read from its type tag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidNodeType`] if the tag names no struct of the schema.
    pub fn node_type(&self, record: Address) -> Result<StructId> {
        let node_type = self.db.get_u16(record)?;
        if self.schema.struct_info(node_type).is_none() {
            return Err(Error::InvalidNodeType { address: record, node_type });
        }
        Ok(node_type)
    }

    /// Returns `true` if a reference-counted record has nothing left keeping it alive.
    ///
    /// Records whose struct does not use standard ref counting are never ready.
    ///
    /// # Errors
    ///
    /// Returns an error if the record or one of its relationships cannot be read.
    pub fn is_ready_for_deletion(&self, record: Address) -> Result<bool> {
        let node_type = self.node_type(record)?;
        if !self.schema.is_ref_counted(node_type) {
            return Ok(false);
        }
        for id in self.schema.all_fields(node_type) {
            if self.has_references(id, record)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Returns `true` if this field of `record` holds a reference keeping it alive.
    fn has_references(&self, id: usize, record: Address) -> Result<bool> {
        let info = self.schema.field(id);
        let at = record.add(info.offset);
        match info.kind {
            FieldKind::ManyToOne { owner, .. } => Ok(owner && !self.db.get_address(at)?.is_null()),
            FieldKind::OneToMany { array, inverse } => {
                let owned = inverse.is_some_and(|inverse| {
                    matches!(self.schema.field(inverse).kind, FieldKind::ManyToOne { owner: true, .. })
                });
                Ok(!owned && !array.is_empty(&self.db, at)?)
            },
            FieldKind::OneToOne { owner, .. } => Ok(!owner && !self.db.get_address(at)?.is_null()),
            _ => Ok(false),
        }
    }

    /// Acquires the exclusive write lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] if the database was opened read-only.
    pub fn acquire_write_lock(&self) -> Result<NdWriteLock<'_>> {
        let lock = self.db.acquire_write_lock()?;
        Ok(NdWriteLock { nd: self, lock, pending: self.pending.lock() })
    }

    /// Flushes dirty chunks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a write fails.
    pub fn flush(&self) -> Result<FlushStatus> {
        self.db.flush()
    }

    /// Flushes and closes the database. Records still pending deletion are left
    /// in place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the final flush fails.
    pub fn close(self) -> Result<()> {
        let pending = self.pending.lock().len();
        if pending > 0 {
            tracing::warn!(pending, "Closing with records still pending deletion");
        }
        self.db.close()
    }
}

impl fmt::Debug for Nd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nd")
            .field("db", &self.db)
            .field("structs", &self.schema.struct_count())
            .finish_non_exhaustive()
    }
}

/// Exclusive write access to an [`Nd`].
///
/// Dereferences to the underlying [`WriteLock`], so raw reads, writes and
/// allocations are available too.
pub struct NdWriteLock<'nd> {
    nd: &'nd Nd,
    lock: WriteLock<'nd>,
    pending: MutexGuard<'nd, DeletionQueue>,
}

impl<'nd> NdWriteLock<'nd> {
    /// Returns the locked database.
    pub fn nd(&self) -> &'nd Nd {
        self.nd
    }

    /// Returns the schema.
    pub fn schema(&self) -> &'nd Schema {
        &self.nd.schema
    }

    /// Returns the underlying write lock.
    pub fn db_mut(&mut self) -> &mut WriteLock<'nd> {
        &mut self.lock
    }

    /// Allocates a zeroed record of `def`'s struct and stamps its type tag.
    ///
    /// # Errors
    ///
    /// Returns an allocator error.
    ///
    /// # Panics
    ///
    /// Panics if the struct is abstract, is a list element, or belongs to
    /// another schema. List elements are created by
    /// [`FieldList::append`](crate::FieldList::append).
    pub fn create<T: NdRecord>(&mut self, def: StructDef<T>) -> Result<T> {
        let schema = self.schema();
        let info = schema
            .struct_info(def.id())
            .unwrap_or_else(|| panic!("struct {} is not part of this schema", def.id()));
        assert!(!info.is_abstract, "cannot create a record of abstract struct {}", info.name);
        assert!(!info.list_element, "cannot create a record of list element struct {}", info.name);

        let record = self.lock.malloc(info.size, node_pool(def.id()))?;
        self.lock.put_u16(record, def.id())?;
        Ok(T::from_address(record))
    }

    /// Schedules `record` for deletion by the next [`process_deletions`](Self::process_deletions).
    ///
    /// Scheduling a record twice has no further effect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidNodeType`] if `record` has no valid type tag, and
    /// [`Error::NotDeletable`] if it is the root record or a list element. List
    /// elements go away with their list.
    pub fn delete(&mut self, record: Address) -> Result<()> {
        if self.is_root(record)? {
            return Err(Error::NotDeletable { address: record, reason: "root record".to_string() });
        }
        let node_type = self.nd.node_type(record)?;
        let schema = self.schema();
        if schema.is_list_element(node_type) {
            let name = schema.struct_name(node_type).unwrap_or_default();
            return Err(Error::NotDeletable { address: record, reason: format!("{name} is a list element") });
        }
        if self.pending.push(record) {
            tracing::trace!(record = %record, node_type, "Scheduled deletion");
        }
        Ok(())
    }

    fn is_root(&self, record: Address) -> Result<bool> {
        Ok(!record.is_null() && record == self.nd.root_record()?)
    }

    /// Returns `true` if `record` is scheduled and not yet deleted.
    pub fn is_pending_deletion(&self, record: Address) -> bool {
        self.pending.contains(record)
    }

    /// Returns the number of records scheduled and not yet deleted.
    pub fn pending_deletions(&self) -> usize {
        self.pending.len()
    }

    /// Schedules a reference-counted record that nothing refers to any more.
    /// The root record is never scheduled.
    pub(crate) fn schedule_if_unreferenced(&mut self, record: Address) -> Result<()> {
        if self.is_root(record)? {
            return Ok(());
        }
        if !self.pending.contains(record) && self.nd.is_ready_for_deletion(record)? {
            self.delete(record)?;
        }
        Ok(())
    }

    /// Deletes every scheduled record, and every record those deletions schedule,
    /// until none is left. Returns the number of records deleted.
    ///
    /// A record stays scheduled if its deletion fails, and processing stops at
    /// the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first error from a destructor hook or from field cleanup.
    pub fn process_deletions(&mut self) -> Result<usize> {
        let mut deleted = 0;
        while let Some(record) = self.pending.front() {
            self.delete_now(record)?;
            self.pending.pop();
            deleted += 1;
        }
        if deleted > 0 {
            tracing::debug!(deleted, "Processed deletions");
        }
        Ok(deleted)
    }

    fn delete_now(&mut self, record: Address) -> Result<()> {
        let node_type = self.nd.node_type(record)?;
        self.destroy(record, node_type)?;
        self.lock.free(record, node_pool(node_type))?;
        tracing::trace!(record = %record, node_type, "Deleted record");
        Ok(())
    }

    /// Runs the destructor hooks of `record`, most derived first, then releases
    /// everything its fields hold, inherited fields first.
    pub(crate) fn destroy(&mut self, record: Address, node_type: StructId) -> Result<()> {
        let schema = self.schema();
        for struct_id in schema.chain(node_type).into_iter().rev() {
            let destructor = schema.struct_info(struct_id).and_then(|s| s.destructor.as_ref());
            if let Some(destructor) = destructor {
                destructor(self, record)?;
            }
        }

        for id in schema.all_fields(node_type) {
            let info = schema.field(id);
            match info.kind {
                FieldKind::Scalar => {},
                FieldKind::String => field::destruct_string(self, record.add(info.offset))?,
                FieldKind::ManyToOne { .. } => {
                    field::relink_many_to_one(self, id, record, Address::NULL, true)?;
                },
                FieldKind::OneToMany { .. } => field::destruct_one_to_many(self, id, record)?,
                FieldKind::OneToOne { .. } => field::relink_one_to_one(self, id, record, Address::NULL)?,
                FieldKind::List { .. } => field::destruct_list(self, id, record)?,
                FieldKind::SearchKey { .. } => field::destruct_key(self, id, record)?,
                FieldKind::SearchIndex { .. } => field::destruct_index(self, id, record)?,
            }
        }
        Ok(())
    }
}

impl<'nd> Deref for NdWriteLock<'nd> {
    type Target = WriteLock<'nd>;

    fn deref(&self) -> &WriteLock<'nd> {
        &self.lock
    }
}

impl DerefMut for NdWriteLock<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.lock
    }
}

impl fmt::Debug for NdWriteLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NdWriteLock")
            .field("lock", &self.lock)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::tempdir;

    use super::*;
    use crate::{
        field::{FieldList, FieldManyToOne, FieldOneToMany, FieldOneToOne},
        schema::SchemaBuilder,
    };

    fn cache() -> Arc<ChunkCache> {
        Arc::new(ChunkCache::new(256))
    }

    #[test]
    fn test_root_record_created_once() {
        let mut b = SchemaBuilder::new();
        let root = b.create_struct::<Address>("Root", None);
        let counter = b.add_long(root);
        b.done(root);
        b.set_root_struct(root);
        let schema = Arc::new(b.build().unwrap());

        let dir = tempdir().unwrap();
        let path = dir.path().join("root.nd");
        let first = {
            let nd = Nd::open(&path, cache(), Arc::clone(&schema), DatabaseConfig::default()).unwrap();
            let record = nd.root_record().unwrap();
            assert!(!record.is_null());
            assert_eq!(nd.node_type(record).unwrap(), root.id());
            let mut w = nd.acquire_write_lock().unwrap();
            counter.put(&mut w, record, 77).unwrap();
            drop(w);
            nd.close().unwrap();
            record
        };

        let nd = Nd::open(&path, cache(), schema, DatabaseConfig::default()).unwrap();
        assert_eq!(nd.root_record().unwrap(), first);
        assert_eq!(counter.get(nd.db(), first).unwrap(), 77);
    }

    #[test]
    fn test_root_record_type_mismatch_rejected() {
        let mut b = SchemaBuilder::new();
        let other = b.create_struct::<Address>("Other", None);
        b.done(other);
        let root = b.create_struct::<Address>("Root", None);
        b.done(root);
        b.set_root_struct(root);
        let schema = b.build().unwrap();

        let db = Database::open_in_memory(cache(), DatabaseConfig::default()).unwrap();
        {
            let mut w = db.acquire_write_lock().unwrap();
            let record = w.malloc(8, POOL_ROOT_RECORD).unwrap();
            w.put_u16(record, other.id()).unwrap();
            w.set_root(ROOT_RECORD_SLOT, record).unwrap();
        }
        let err = Nd::from_database(db, Arc::new(schema)).unwrap_err();
        assert!(matches!(err, Error::InvalidNodeType { .. }), "{err}");
    }

    #[test]
    #[should_panic(expected = "abstract")]
    fn test_create_abstract_panics() {
        let mut b = SchemaBuilder::new();
        let base = b.create_abstract_struct::<Address>("Base", None);
        b.done(base);
        let nd = Nd::open_in_memory(cache(), Arc::new(b.build().unwrap()), DatabaseConfig::default())
            .unwrap();
        let mut w = nd.acquire_write_lock().unwrap();
        let _ = w.create(base);
    }

    #[test]
    fn test_root_record_not_deletable() {
        let mut b = SchemaBuilder::new();
        let root = b.create_struct::<Address>("Root", None);
        b.done(root);
        b.set_root_struct(root);
        let nd = Nd::open_in_memory(cache(), Arc::new(b.build().unwrap()), DatabaseConfig::default())
            .unwrap();
        let record = nd.root_record().unwrap();

        let mut w = nd.acquire_write_lock().unwrap();
        let err = w.delete(record).unwrap_err();
        assert!(matches!(err, Error::NotDeletable { address, .. } if address == record), "{err}");
        assert_eq!(w.pending_deletions(), 0);
        assert_eq!(w.process_deletions().unwrap(), 0);
        assert_eq!(nd.node_type(record).unwrap(), root.id());
    }

    #[test]
    fn test_ref_counted_root_survives_last_reference() {
        let mut b = SchemaBuilder::new();
        let root = b.create_struct::<Address>("Root", None);
        let referrers = FieldOneToMany::<Address>::create(&mut b, root, 1);
        b.use_standard_ref_counting(root);
        b.done(root);
        b.set_root_struct(root);
        let source = b.create_struct::<Address>("Source", None);
        let reference = FieldManyToOne::<Address>::create(&mut b, source, referrers);
        b.done(source);

        let nd = Nd::open_in_memory(cache(), Arc::new(b.build().unwrap()), DatabaseConfig::default())
            .unwrap();
        let record = nd.root_record().unwrap();
        let mut w = nd.acquire_write_lock().unwrap();
        let s = w.create(source).unwrap();
        reference.put(&mut w, s, Some(record)).unwrap();
        reference.put(&mut w, s, None).unwrap();

        assert!(nd.is_ready_for_deletion(record).unwrap());
        assert!(!w.is_pending_deletion(record));
        assert_eq!(w.process_deletions().unwrap(), 0);
        assert_eq!(nd.root_record().unwrap(), record);
    }

    #[test]
    fn test_delete_is_deferred_and_deduplicated() {
        let mut b = SchemaBuilder::new();
        let leaf = b.create_struct::<Address>("Leaf", None);
        b.done(leaf);
        let nd = Nd::open_in_memory(cache(), Arc::new(b.build().unwrap()), DatabaseConfig::default())
            .unwrap();
        let mut w = nd.acquire_write_lock().unwrap();
        let record = w.create(leaf).unwrap();
        let pool = POOL_FIRST_NODE_TYPE + leaf.id();
        assert_eq!(w.memory_stats().pool(pool).live_allocations, 1);

        w.delete(record).unwrap();
        w.delete(record).unwrap();
        assert!(w.is_pending_deletion(record));
        assert_eq!(w.pending_deletions(), 1);
        assert_eq!(w.memory_stats().pool(pool).live_allocations, 1);

        assert_eq!(w.process_deletions().unwrap(), 1);
        assert!(!w.is_pending_deletion(record));
        assert_eq!(w.memory_stats().pool(pool).live_allocations, 0);
        assert_eq!(w.process_deletions().unwrap(), 0);
    }

    #[test]
    fn test_delete_rejects_untagged_record() {
        let mut b = SchemaBuilder::new();
        let leaf = b.create_struct::<Address>("Leaf", None);
        b.done(leaf);
        let nd = Nd::open_in_memory(cache(), Arc::new(b.build().unwrap()), DatabaseConfig::default())
            .unwrap();
        let mut w = nd.acquire_write_lock().unwrap();
        let raw = w.malloc(8, crate::types::POOL_MISC).unwrap();
        w.put_u16(raw, 999).unwrap();
        assert!(matches!(w.delete(raw), Err(Error::InvalidNodeType { node_type: 999, .. })));
    }

    #[test]
    fn test_destructors_run_most_derived_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut b = SchemaBuilder::new();
        let base = b.create_abstract_struct::<Address>("Base", None);
        let log = Arc::clone(&order);
        b.set_destructor(base, move |_, _| {
            log.lock().push("base");
            Ok(())
        });
        b.done(base);
        let derived = b.create_struct::<Address>("Derived", Some(base.id()));
        let log = Arc::clone(&order);
        b.set_destructor(derived, move |_, _| {
            log.lock().push("derived");
            Ok(())
        });
        b.done(derived);

        let nd = Nd::open_in_memory(cache(), Arc::new(b.build().unwrap()), DatabaseConfig::default())
            .unwrap();
        let mut w = nd.acquire_write_lock().unwrap();
        let record = w.create(derived).unwrap();
        w.delete(record).unwrap();
        w.process_deletions().unwrap();
        assert_eq!(*order.lock(), vec!["derived", "base"]);
    }

    #[test]
    fn test_failing_destructor_aborts_cascade() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut b = SchemaBuilder::new();
        let fragile = b.create_struct::<Address>("Fragile", None);
        let seen = Arc::clone(&calls);
        b.set_destructor(fragile, move |_, record| {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(Error::corrupted(format!("refusing to delete {record}")))
        });
        b.done(fragile);

        let nd = Nd::open_in_memory(cache(), Arc::new(b.build().unwrap()), DatabaseConfig::default())
            .unwrap();
        let mut w = nd.acquire_write_lock().unwrap();
        let first = w.create(fragile).unwrap();
        let second = w.create(fragile).unwrap();
        w.delete(first).unwrap();
        w.delete(second).unwrap();

        assert!(matches!(w.process_deletions(), Err(Error::Corrupted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(w.is_pending_deletion(first));
        assert!(w.is_pending_deletion(second));
    }

    #[test]
    fn test_destructor_can_schedule_more_work() {
        let mut b = SchemaBuilder::new();
        let node = b.create_struct::<Address>("Node", None);
        let next = b.add_pointer(node);
        b.set_destructor(node, move |w, record| {
            let following = next.get(w, record)?;
            if !following.is_null() {
                w.delete(following)?;
            }
            Ok(())
        });
        b.done(node);

        let nd = Nd::open_in_memory(cache(), Arc::new(b.build().unwrap()), DatabaseConfig::default())
            .unwrap();
        let mut w = nd.acquire_write_lock().unwrap();
        let records: Vec<Address> = (0..5).map(|_| w.create(node).unwrap()).collect();
        for pair in records.windows(2) {
            next.put(&mut w, pair[0], pair[1]).unwrap();
        }
        w.delete(records[0]).unwrap();
        assert_eq!(w.process_deletions().unwrap(), 5);
        assert_eq!(w.memory_stats().pool(POOL_FIRST_NODE_TYPE + node.id()).live_allocations, 0);
    }

    #[test]
    fn test_ref_counted_target_deleted_with_last_reference() {
        let mut b = SchemaBuilder::new();
        let target = b.create_struct::<Address>("Target", None);
        let referrers = FieldOneToMany::<Address>::create(&mut b, target, 1);
        b.use_standard_ref_counting(target);
        b.done(target);
        let source = b.create_struct::<Address>("Source", None);
        let reference = FieldManyToOne::<Address>::create(&mut b, source, referrers);
        b.done(source);

        let nd = Nd::open_in_memory(cache(), Arc::new(b.build().unwrap()), DatabaseConfig::default())
            .unwrap();
        let mut w = nd.acquire_write_lock().unwrap();
        let t = w.create(target).unwrap();
        let a = w.create(source).unwrap();
        let c = w.create(source).unwrap();
        reference.put(&mut w, a, Some(t)).unwrap();
        reference.put(&mut w, c, Some(t)).unwrap();
        assert!(!nd.is_ready_for_deletion(t).unwrap());

        reference.put(&mut w, a, None).unwrap();
        assert!(!w.is_pending_deletion(t));
        reference.put(&mut w, c, None).unwrap();
        assert!(w.is_pending_deletion(t));
        assert_eq!(w.process_deletions().unwrap(), 1);
        assert_eq!(w.memory_stats().pool(POOL_FIRST_NODE_TYPE + target.id()).live_allocations, 0);
    }

    #[test]
    fn test_one_to_one_owner_replacement() {
        let mut b = SchemaBuilder::new();
        let body = b.create_struct::<Address>("Body", None);
        let back = FieldOneToOne::<Address>::create(&mut b, body, None);
        b.done(body);
        let holder = b.create_struct::<Address>("Holder", None);
        let owned = FieldOneToOne::<Address>::create_owner(&mut b, holder, Some(back));
        b.done(holder);

        let nd = Nd::open_in_memory(cache(), Arc::new(b.build().unwrap()), DatabaseConfig::default())
            .unwrap();
        let mut w = nd.acquire_write_lock().unwrap();
        let h = w.create(holder).unwrap();
        let first = w.create(body).unwrap();
        let second = w.create(body).unwrap();

        owned.put(&mut w, h, Some(first)).unwrap();
        assert_eq!(back.get(&w, first).unwrap(), Some(h));

        owned.put(&mut w, h, Some(second)).unwrap();
        assert!(w.is_pending_deletion(first));
        assert_eq!(back.get(&w, first).unwrap(), None);
        assert_eq!(back.get(&w, second).unwrap(), Some(h));
        assert_eq!(owned.get(&w, h).unwrap(), Some(second));

        w.delete(h).unwrap();
        assert_eq!(w.process_deletions().unwrap(), 3);
        assert_eq!(w.memory_stats().pool(POOL_FIRST_NODE_TYPE + body.id()).live_allocations, 0);
    }

    #[test]
    fn test_list_elements_destroyed_with_parent() {
        let mut b = SchemaBuilder::new();
        let item = b.create_struct::<Address>("Item", None);
        let label = b.add_string(item);
        b.done(item);
        let bag = b.create_struct::<Address>("Bag", None);
        let items = FieldList::<Address>::create(&mut b, bag, item);
        b.done(bag);

        let nd = Nd::open_in_memory(cache(), Arc::new(b.build().unwrap()), DatabaseConfig::default())
            .unwrap();
        let mut w = nd.acquire_write_lock().unwrap();
        let owner = w.create(bag).unwrap();
        for i in 0..20 {
            let element = items.append(&mut w, owner).unwrap();
            label.put(&mut w, element, &format!("item {i}")).unwrap();
        }
        assert_eq!(items.size(&w, owner).unwrap(), 20);
        assert_eq!(items.capacity(&w, owner).unwrap(), 4 + 8 + 16);
        let seventh = items.get(&w, owner, 7).unwrap();
        assert_eq!(nd.node_type(seventh).unwrap(), item.id());
        assert_eq!(label.get(&w, seventh).unwrap(), "item 7");

        w.delete(owner).unwrap();
        w.process_deletions().unwrap();
        let stats = w.memory_stats();
        assert_eq!(stats.pool(crate::types::POOL_LIST_BLOCK).live_allocations, 0);
        assert_eq!(stats.pool(crate::types::POOL_STRING_SHORT).live_allocations, 0);
    }

    #[test]
    fn test_list_element_not_deletable_on_its_own() {
        let mut b = SchemaBuilder::new();
        let item = b.create_struct::<Address>("Item", None);
        let label = b.add_string(item);
        b.done(item);
        let bag = b.create_struct::<Address>("Bag", None);
        let items = FieldList::<Address>::create(&mut b, bag, item);
        b.done(bag);

        let nd = Nd::open_in_memory(cache(), Arc::new(b.build().unwrap()), DatabaseConfig::default())
            .unwrap();
        let mut w = nd.acquire_write_lock().unwrap();
        let owner = w.create(bag).unwrap();
        let element = items.append(&mut w, owner).unwrap();
        label.put(&mut w, element, "kept").unwrap();

        let err = w.delete(element).unwrap_err();
        assert!(matches!(err, Error::NotDeletable { .. }), "{err}");
        assert_eq!(w.pending_deletions(), 0);

        // The queue still drains normally afterwards.
        w.delete(owner).unwrap();
        assert_eq!(w.process_deletions().unwrap(), 1);
        assert_eq!(w.pending_deletions(), 0);
        assert_eq!(w.memory_stats().pool(crate::types::POOL_STRING_SHORT).live_allocations, 0);
    }

    #[test]
    #[should_panic(expected = "list element")]
    fn test_create_list_element_panics() {
        let mut b = SchemaBuilder::new();
        let item = b.create_struct::<Address>("Item", None);
        b.done(item);
        let bag = b.create_struct::<Address>("Bag", None);
        let _items = FieldList::<Address>::create(&mut b, bag, item);
        b.done(bag);
        let nd = Nd::open_in_memory(cache(), Arc::new(b.build().unwrap()), DatabaseConfig::default())
            .unwrap();
        let mut w = nd.acquire_write_lock().unwrap();
        let _ = w.create(item);
    }
}
