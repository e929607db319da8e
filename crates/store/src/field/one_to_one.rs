//! Symmetric single-valued relationships.

use std::{fmt, marker::PhantomData};

use crate::{
    db::Database,
    error::Result,
    nd::NdWriteLock,
    schema::{FieldId, FieldKind, SchemaBuilder, StructDef, kind_mismatch},
    types::{Address, NdRecord},
};

/// One side of a one-to-one relationship.
///
/// Both sides store a plain pointer and are kept in sync: writing either side
/// detaches whatever the two records were previously linked to. An owner side
/// owns its target, which is deleted when the link is cleared or replaced.
pub struct FieldOneToOne<T> {
    id: FieldId,
    offset: u64,
    _target: PhantomData<fn() -> T>,
}

impl<T> Clone for FieldOneToOne<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FieldOneToOne<T> {}

impl<T> fmt::Debug for FieldOneToOne<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldOneToOne").field("id", &self.id).field("offset", &self.offset).finish()
    }
}

impl<T: NdRecord> FieldOneToOne<T> {
    /// Declares a non-owning side. The first side of a pair is declared with no
    /// inverse; the second names the first.
    ///
    /// # Panics
    ///
    /// Panics if `def` is done or `inverse` is already paired.
    pub fn create<S>(b: &mut SchemaBuilder, def: StructDef<S>, inverse: Option<FieldOneToOne<S>>) -> Self {
        Self::declare(b, def, inverse, false)
    }

    /// Declares a side that owns its target.
    ///
    /// # Panics
    ///
    /// Panics if `def` is done or `inverse` is already paired.
    pub fn create_owner<S>(
        b: &mut SchemaBuilder,
        def: StructDef<S>,
        inverse: Option<FieldOneToOne<S>>,
    ) -> Self {
        Self::declare(b, def, inverse, true)
    }

    fn declare<S>(
        b: &mut SchemaBuilder,
        def: StructDef<S>,
        inverse: Option<FieldOneToOne<S>>,
        owner: bool,
    ) -> Self {
        let inverse_id = inverse.map(|f| f.id);
        let (id, offset) =
            b.add_field(def.id(), Address::SIZE, FieldKind::OneToOne { inverse: inverse_id, owner });
        if let Some(inverse_id) = inverse_id {
            match &mut b.field_mut(inverse_id).kind {
                FieldKind::OneToOne { inverse: slot, owner: inverse_owner } => {
                    assert!(slot.is_none(), "one-to-one field {inverse_id} is already paired");
                    assert!(!(owner && *inverse_owner), "both sides of a one-to-one field own each other");
                    *slot = Some(id);
                },
                _ => panic!("field {inverse_id} is not a one-to-one field"),
            }
        }
        Self { id, offset, _target: PhantomData }
    }

    /// Returns the byte offset of the field within its record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the target's address, null when unset.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidAddress`] if the field lies outside the database.
    pub fn get_address(&self, db: &Database, record: Address) -> Result<Address> {
        db.get_address(record.add(self.offset))
    }

    /// Returns the target.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidAddress`] if the field lies outside the database.
    pub fn get(&self, db: &Database, record: Address) -> Result<Option<T>> {
        Ok(self.get_address(db, record)?.non_null().map(T::from_address))
    }

    /// Links `record` and `target`, detaching both from previous partners.
    ///
    /// # Errors
    ///
    /// Returns an error if either side cannot be updated.
    pub fn put(&self, w: &mut NdWriteLock<'_>, record: Address, target: Option<T>) -> Result<()> {
        relink(w, self.id, record, target.map_or(Address::NULL, |t| t.address()))
    }
}

/// Links `record` to `target` through `field` and its inverse.
pub(crate) fn relink(w: &mut NdWriteLock<'_>, field: FieldId, record: Address, target: Address) -> Result<()> {
    let schema = w.schema();
    let info = schema.field(field);
    let FieldKind::OneToOne { inverse: Some(inverse), owner } = info.kind else {
        return Err(kind_mismatch(field, "paired one-to-one"));
    };
    let inverse_info = schema.field(inverse);
    let FieldKind::OneToOne { owner: inverse_owner, .. } = inverse_info.kind else {
        return Err(kind_mismatch(inverse, "one-to-one"));
    };

    let slot = record.add(info.offset);
    let old = w.get_address(slot)?;
    if old == target {
        return Ok(());
    }

    if !old.is_null() {
        w.put_address(old.add(inverse_info.offset), Address::NULL)?;
        w.put_address(slot, Address::NULL)?;
        if owner {
            w.delete(old)?;
        } else {
            w.schedule_if_unreferenced(old)?;
        }
    }

    if target.is_null() {
        return Ok(());
    }

    let target_slot = target.add(inverse_info.offset);
    let partner = w.get_address(target_slot)?;
    if !partner.is_null() {
        w.put_address(partner.add(info.offset), Address::NULL)?;
        w.put_address(target_slot, Address::NULL)?;
        if inverse_owner {
            w.delete(partner)?;
        } else {
            w.schedule_if_unreferenced(partner)?;
        }
    }

    w.put_address(target_slot, record)?;
    w.put_address(slot, target)
}
