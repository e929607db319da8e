//! The collection side of a parent/children relationship.

use std::{fmt, marker::PhantomData};

use crate::{
    db::{Database, WriteLock},
    error::Result,
    growable::RawGrowableArray,
    nd::NdWriteLock,
    schema::{FieldId, FieldKind, SchemaBuilder, StructDef, kind_mismatch},
    types::{Address, NdRecord},
};

/// The children pointing at a record through a [`FieldManyToOne`](crate::FieldManyToOne).
///
/// Children are stored in a [`RawGrowableArray`] embedded in the parent. The
/// collection is only ever changed by writing the inverse field; removal swaps
/// the last child into the vacated slot, so order is not stable.
pub struct FieldOneToMany<T> {
    id: FieldId,
    offset: u64,
    array: RawGrowableArray,
    _element: PhantomData<fn() -> T>,
}

impl<T> Clone for FieldOneToMany<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FieldOneToMany<T> {}

impl<T> fmt::Debug for FieldOneToMany<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldOneToMany")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("inline_size", &self.array.inline_size())
            .finish()
    }
}

impl<T> FieldOneToMany<T> {
    pub(crate) fn field_id(&self) -> FieldId {
        self.id
    }
}

impl<T: NdRecord> FieldOneToMany<T> {
    /// Declares a child list keeping up to `inline_size` children inside the record.
    ///
    /// The list must be paired with a [`FieldManyToOne`](crate::FieldManyToOne)
    /// before the schema is built.
    ///
    /// # Panics
    ///
    /// Panics if `def` is done.
    pub fn create<P>(b: &mut SchemaBuilder, def: StructDef<P>, inline_size: usize) -> Self {
        let array = RawGrowableArray::new(inline_size);
        let (id, offset) =
            b.add_field(def.id(), array.record_size(), FieldKind::OneToMany { array, inverse: None });
        Self { id, offset, array, _element: PhantomData }
    }

    /// Returns the byte offset of the field within its record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn list(&self, record: Address) -> Address {
        record.add(self.offset)
    }

    /// Returns the number of children.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be read.
    pub fn size(&self, db: &Database, record: Address) -> Result<usize> {
        self.array.size(db, self.list(record))
    }

    /// Returns `true` if there are no children.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be read.
    pub fn is_empty(&self, db: &Database, record: Address) -> Result<bool> {
        self.array.is_empty(db, self.list(record))
    }

    /// Returns the child at `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be read.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn get(&self, db: &Database, record: Address, index: usize) -> Result<T> {
        Ok(T::from_address(self.array.get(db, self.list(record), index)?))
    }

    /// Returns a snapshot of every child.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be read.
    pub fn as_list(&self, db: &Database, record: Address) -> Result<Vec<T>> {
        Ok(self.array.to_vec(db, self.list(record))?.into_iter().map(T::from_address).collect())
    }

    /// Returns the number of children the list holds without reallocating.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be read.
    pub fn capacity(&self, db: &Database, record: Address) -> Result<usize> {
        self.array.capacity(db, self.list(record))
    }

    /// Preallocates room for `capacity` children.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be read or storage cannot be allocated.
    pub fn ensure_capacity(&self, w: &mut WriteLock<'_>, record: Address, capacity: usize) -> Result<()> {
        self.array.ensure_capacity(w, self.list(record), capacity)
    }
}

/// Detaches every child of a record being deleted.
///
/// Children owned through the inverse field are scheduled for deletion.
pub(crate) fn destruct(w: &mut NdWriteLock<'_>, field: FieldId, record: Address) -> Result<()> {
    let schema = w.schema();
    let info = schema.field(field);
    let FieldKind::OneToMany { array, inverse: Some(inverse) } = info.kind else {
        return Err(kind_mismatch(field, "one-to-many"));
    };
    let inverse_info = schema.field(inverse);
    let FieldKind::ManyToOne { owner, .. } = inverse_info.kind else {
        return Err(kind_mismatch(inverse, "many-to-one"));
    };

    let list = record.add(info.offset);
    for child in array.to_vec(w, list)? {
        w.clear_range(child.add(inverse_info.offset), Address::SIZE + 4)?;
        if owner {
            w.delete(child)?;
        }
    }
    array.destruct(w, list)
}
