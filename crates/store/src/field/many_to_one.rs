//! The single-valued side of a parent/children relationship.

use std::{fmt, marker::PhantomData};

use crate::{
    db::Database,
    error::Result,
    field::FieldOneToMany,
    nd::NdWriteLock,
    schema::{FieldId, FieldKind, SchemaBuilder, StructDef, kind_mismatch},
    types::{Address, NdRecord},
};

/// Target pointer followed by this record's index in the target's list.
const RECORD_SIZE: usize = Address::SIZE + 4;
const INDEX_OFFSET: u64 = Address::SIZE as u64;

/// A pointer to a parent whose [`FieldOneToMany`] lists this record.
///
/// The record also remembers its index in that list so it can be unlinked in
/// constant time.
pub struct FieldManyToOne<T> {
    id: FieldId,
    offset: u64,
    _target: PhantomData<fn() -> T>,
}

impl<T> Clone for FieldManyToOne<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FieldManyToOne<T> {}

impl<T> fmt::Debug for FieldManyToOne<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldManyToOne").field("id", &self.id).field("offset", &self.offset).finish()
    }
}

impl<T: NdRecord> FieldManyToOne<T> {
    /// Declares a plain reference to a parent, listed by `inverse`.
    ///
    /// # Panics
    ///
    /// Panics if `def` is done or `inverse` already has a many-to-one side.
    pub fn create<C>(b: &mut SchemaBuilder, def: StructDef<C>, inverse: FieldOneToMany<C>) -> Self {
        Self::declare(b, def, inverse, false)
    }

    /// Declares a reference to the record's owner: clearing it deletes the record.
    ///
    /// # Panics
    ///
    /// Panics if `def` is done or `inverse` already has a many-to-one side.
    pub fn create_owner<C>(b: &mut SchemaBuilder, def: StructDef<C>, inverse: FieldOneToMany<C>) -> Self {
        Self::declare(b, def, inverse, true)
    }

    fn declare<C>(b: &mut SchemaBuilder, def: StructDef<C>, inverse: FieldOneToMany<C>, owner: bool) -> Self {
        let (id, offset) =
            b.add_field(def.id(), RECORD_SIZE, FieldKind::ManyToOne { inverse: inverse.field_id(), owner });
        match &mut b.field_mut(inverse.field_id()).kind {
            FieldKind::OneToMany { inverse: slot, .. } => {
                assert!(slot.is_none(), "one-to-many field {} already has an inverse", inverse.field_id());
                *slot = Some(id);
            },
            _ => panic!("field {} is not a one-to-many field", inverse.field_id()),
        }
        Self { id, offset, _target: PhantomData }
    }

    /// Returns the byte offset of the field within its record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the parent's address, null when unset.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidAddress`] if the field lies outside the database.
    pub fn get_address(&self, db: &Database, record: Address) -> Result<Address> {
        db.get_address(record.add(self.offset))
    }

    /// Returns the parent.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidAddress`] if the field lies outside the database.
    pub fn get(&self, db: &Database, record: Address) -> Result<Option<T>> {
        Ok(self.get_address(db, record)?.non_null().map(T::from_address))
    }

    /// Returns the record's position in its parent's list.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidAddress`] if the field lies outside the database.
    pub fn index(&self, db: &Database, record: Address) -> Result<usize> {
        Ok(db.get_u32(record.add(self.offset + INDEX_OFFSET))? as usize)
    }

    /// Points `record` at `target`, moving it between the parents' lists.
    ///
    /// A reference-counted previous parent left unreferenced is scheduled for
    /// deletion. Clearing an owner field schedules `record` itself.
    ///
    /// # Errors
    ///
    /// Returns an error if either list cannot be updated.
    pub fn put(&self, w: &mut NdWriteLock<'_>, record: Address, target: Option<T>) -> Result<()> {
        relink(w, self.id, record, target.map_or(Address::NULL, |t| t.address()), false)
    }
}

/// Moves `record` from its current parent's list to `target`'s.
///
/// `destructing` is set while `record` itself is being deleted, which suppresses
/// scheduling it again.
pub(crate) fn relink(
    w: &mut NdWriteLock<'_>,
    field: FieldId,
    record: Address,
    target: Address,
    destructing: bool,
) -> Result<()> {
    let schema = w.schema();
    let info = schema.field(field);
    let FieldKind::ManyToOne { inverse, owner } = info.kind else {
        return Err(kind_mismatch(field, "many-to-one"));
    };
    let list_info = schema.field(inverse);
    let FieldKind::OneToMany { array, .. } = list_info.kind else {
        return Err(kind_mismatch(inverse, "one-to-many"));
    };

    let slot = record.add(info.offset);
    let index_slot = slot.add(INDEX_OFFSET);
    let old = w.get_address(slot)?;
    if old == target {
        return Ok(());
    }

    if !old.is_null() {
        let index = w.get_u32(index_slot)?;
        let moved = array.remove(w, old.add(list_info.offset), index as usize)?;
        if !moved.is_null() {
            w.put_u32(moved.add(info.offset + INDEX_OFFSET), index)?;
        }
        w.put_address(slot, Address::NULL)?;
        w.put_u32(index_slot, 0)?;
        w.schedule_if_unreferenced(old)?;
    }

    if target.is_null() {
        if owner && !destructing {
            w.delete(record)?;
        }
        return Ok(());
    }

    let index = array.add(w, target.add(list_info.offset), record)?;
    w.put_address(slot, target)?;
    w.put_u32(index_slot, index as u32)
}
