//! Fixed-size scalar fields.

use crate::{
    db::{Database, WriteLock},
    error::{Error, Result},
    types::Address,
};

macro_rules! scalar_field {
    ($(#[$meta:meta])* $name:ident, $ty:ty, $get:ident, $put:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            offset: u64,
        }

        impl $name {
            pub(crate) const fn at(offset: u64) -> Self {
                Self { offset }
            }

            /// Returns the byte offset of the field within its record.
            pub const fn offset(&self) -> u64 {
                self.offset
            }

            /// Reads the field of `record`.
            ///
            /// # Errors
            ///
            /// Returns [`Error::InvalidAddress`] if the field lies outside the database.
            pub fn get(&self, db: &Database, record: Address) -> Result<$ty> {
                db.$get(record.add(self.offset))
            }

            /// Writes the field of `record`.
            ///
            /// # Errors
            ///
            /// Returns [`Error::InvalidAddress`] if the field lies outside the database.
            pub fn put(&self, w: &mut WriteLock<'_>, record: Address, value: $ty) -> Result<()> {
                w.$put(record.add(self.offset), value)
            }
        }
    };
}

scalar_field!(
    /// An unsigned 8-bit field.
    FieldByte, u8, get_u8, put_u8
);
scalar_field!(
    /// A signed 16-bit field.
    FieldShort, i16, get_i16, put_i16
);
scalar_field!(
    /// A signed 32-bit field.
    FieldInt, i32, get_i32, put_i32
);
scalar_field!(
    /// A signed 64-bit field.
    FieldLong, i64, get_i64, put_i64
);
scalar_field!(
    /// A 32-bit float field.
    FieldFloat, f32, get_f32, put_f32
);
scalar_field!(
    /// A 64-bit float field.
    FieldDouble, f64, get_f64, put_f64
);
scalar_field!(
    /// A raw address with no inverse and no ownership.
    FieldPointer, Address, get_address, put_address
);

/// A Unicode scalar value stored as a `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldChar {
    offset: u64,
}

impl FieldChar {
    pub(crate) const fn at(offset: u64) -> Self {
        Self { offset }
    }

    /// Returns the byte offset of the field within its record.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads the field of `record`. A zeroed record reads as `'\0'`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the stored value is not a Unicode scalar value.
    pub fn get(&self, db: &Database, record: Address) -> Result<char> {
        let raw = db.get_u32(record.add(self.offset))?;
        char::from_u32(raw).ok_or_else(|| Error::corrupted(format!("Invalid char {raw:#x} at {record}")))
    }

    /// Writes the field of `record`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the field lies outside the database.
    pub fn put(&self, w: &mut WriteLock<'_>, record: Address, value: char) -> Result<()> {
        w.put_u32(record.add(self.offset), u32::from(value))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{chunk::ChunkCache, db::DatabaseConfig, schema::SchemaBuilder, types::POOL_MISC};

    #[test]
    fn test_scalar_round_trip() {
        let mut b = SchemaBuilder::new();
        let def = b.create_struct::<Address>("Scalars", None);
        let byte = b.add_byte(def);
        let short = b.add_short(def);
        let int = b.add_int(def);
        let long = b.add_long(def);
        let ch = b.add_char(def);
        let float = b.add_float(def);
        let double = b.add_double(def);
        let pointer = b.add_pointer(def);
        b.done(def);
        let schema = b.build().unwrap();
        let size = schema.record_size(def.id()).unwrap();
        assert_eq!(size, 2 + 1 + 2 + 4 + 8 + 4 + 4 + 8 + 8);

        let db = Database::open_in_memory(Arc::new(ChunkCache::new(64)), DatabaseConfig::default())
            .unwrap();
        let mut w = db.acquire_write_lock().unwrap();
        let record = w.malloc(size, POOL_MISC).unwrap();

        byte.put(&mut w, record, 0xAB).unwrap();
        short.put(&mut w, record, -12).unwrap();
        int.put(&mut w, record, 1 << 20).unwrap();
        long.put(&mut w, record, -(1 << 40)).unwrap();
        ch.put(&mut w, record, 'λ').unwrap();
        float.put(&mut w, record, 1.5).unwrap();
        double.put(&mut w, record, -0.25).unwrap();
        pointer.put(&mut w, record, record).unwrap();

        assert_eq!(byte.get(&w, record).unwrap(), 0xAB);
        assert_eq!(short.get(&w, record).unwrap(), -12);
        assert_eq!(int.get(&w, record).unwrap(), 1 << 20);
        assert_eq!(long.get(&w, record).unwrap(), -(1 << 40));
        assert_eq!(ch.get(&w, record).unwrap(), 'λ');
        assert_eq!(float.get(&w, record).unwrap(), 1.5);
        assert_eq!(double.get(&w, record).unwrap(), -0.25);
        assert_eq!(pointer.get(&w, record).unwrap(), record);
    }

    #[test]
    fn test_invalid_char_rejected() {
        let db = Database::open_in_memory(Arc::new(ChunkCache::new(64)), DatabaseConfig::default())
            .unwrap();
        let mut w = db.acquire_write_lock().unwrap();
        let record = w.malloc(8, POOL_MISC).unwrap();
        w.put_u32(record, 0xD800).unwrap();
        assert!(matches!(FieldChar::at(0).get(&w, record), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_field_outside_database_rejected() {
        let db = Database::open_in_memory(Arc::new(ChunkCache::new(64)), DatabaseConfig::default())
            .unwrap();
        let far = Address::new(1 << 40);
        assert!(matches!(FieldInt::at(0).get(&db, far), Err(Error::InvalidAddress { .. })));
    }
}
