//! String fields.

use std::cmp::Ordering;

use crate::{
    db::{Database, WriteLock},
    error::Result,
    string,
    types::Address,
};

/// A string owned by its record.
///
/// The field holds the address of the string's first block; the empty string is
/// stored as the null address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldString {
    offset: u64,
}

impl FieldString {
    pub(crate) const fn at(offset: u64) -> Self {
        Self { offset }
    }

    /// Returns the byte offset of the field within its record.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the address of the stored string, null when empty.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidAddress`] if the field lies outside the database.
    pub fn get_address(&self, db: &Database, record: Address) -> Result<Address> {
        db.get_address(record.add(self.offset))
    }

    /// Reads the string of `record`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string storage cannot be read or is corrupted.
    pub fn get(&self, db: &Database, record: Address) -> Result<String> {
        let address = self.get_address(db, record)?;
        if address.is_null() { Ok(String::new()) } else { string::load(db, address) }
    }

    /// Replaces the string of `record`, freeing the previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be freed or allocated.
    pub fn put(&self, w: &mut WriteLock<'_>, record: Address, text: &str) -> Result<()> {
        destruct(w, record.add(self.offset))?;
        if !text.is_empty() {
            let stored = string::store(w, text)?;
            w.put_address(record.add(self.offset), stored)?;
        }
        Ok(())
    }

    /// Compares this field of two records in search order.
    ///
    /// # Errors
    ///
    /// Returns an error if either string cannot be read.
    pub fn compare(&self, db: &Database, a: Address, b: Address) -> Result<Ordering> {
        Ok(string::compare_search_order(&self.get(db, a)?, &self.get(db, b)?))
    }
}

/// Frees the string stored in the slot at `slot` and nulls the slot.
pub(crate) fn destruct(w: &mut WriteLock<'_>, slot: Address) -> Result<()> {
    let old = w.get_address(slot)?;
    if !old.is_null() {
        string::free(w, old)?;
        w.put_address(slot, Address::NULL)?;
    }
    Ok(())
}
