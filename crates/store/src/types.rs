//! Core value types shared by every layer of the store.
//!
//! - [`Address`]: the only pointer representation, a byte offset into the database
//! - [`NdRecord`]: typed views over record addresses
//! - allocation pool identifiers used for memory accounting

use std::fmt;

/// Byte offset into a database's single address space.
///
/// Zero is the null address. Addresses are stable for the lifetime of the record
/// they point to and are the sole way records refer to each other.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address {
    /// The null address.
    pub const NULL: Address = Address(0);

    /// Size of an address when stored in the database.
    pub const SIZE: usize = 8;

    /// Wraps a raw offset.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw offset.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns `true` for the null address.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the address `bytes` past this one.
    pub const fn add(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Returns the address `bytes` before this one.
    pub const fn sub(self, bytes: u64) -> Self {
        Self(self.0 - bytes)
    }

    /// Converts a null address to `None`.
    pub fn non_null(self) -> Option<Self> {
        if self.is_null() { None } else { Some(self) }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<Address> for u64 {
    fn from(address: Address) -> Self {
        address.0
    }
}

/// A typed view over a record address.
///
/// Schema authors implement this for small `Copy` wrappers so relationship fields
/// can hand back typed records instead of raw addresses.
///
/// ```
/// use nd_store::{Address, NdRecord};
///
/// #[derive(Clone, Copy, Debug, PartialEq)]
/// struct Method(Address);
///
/// impl NdRecord for Method {
///     fn from_address(address: Address) -> Self {
///         Method(address)
///     }
///
///     fn address(&self) -> Address {
///         self.0
///     }
/// }
/// ```
pub trait NdRecord: Copy {
    /// Wraps the record at `address`.
    fn from_address(address: Address) -> Self;

    /// Returns the wrapped address.
    fn address(&self) -> Address;
}

impl NdRecord for Address {
    fn from_address(address: Address) -> Self {
        address
    }

    fn address(&self) -> Address {
        *self
    }
}

/// Allocation pool identifier, used only for memory accounting.
pub type PoolId = u16;

/// Allocations with no better classification.
pub const POOL_MISC: PoolId = 0;
/// B-tree nodes.
pub const POOL_BTREE_BLOCK: PoolId = 1;
/// Spilled storage of growable arrays (blocks and metablocks).
pub const POOL_GROWABLE_ARRAY: PoolId = 2;
/// Strings stored in a single block.
pub const POOL_STRING_SHORT: PoolId = 3;
/// Strings stored as a segment chain.
pub const POOL_STRING_LONG: PoolId = 4;
/// Blocks of embedded lists.
pub const POOL_LIST_BLOCK: PoolId = 5;
/// The schema's root record.
pub const POOL_ROOT_RECORD: PoolId = 6;
/// Node records use `POOL_FIRST_NODE_TYPE + node_type`.
pub const POOL_FIRST_NODE_TYPE: PoolId = 0x100;

/// Returns a human-readable name for a pool, for diagnostics.
pub fn pool_name(pool: PoolId) -> String {
    match pool {
        POOL_MISC => "misc".to_string(),
        POOL_BTREE_BLOCK => "btree".to_string(),
        POOL_GROWABLE_ARRAY => "growable array".to_string(),
        POOL_STRING_SHORT => "short string".to_string(),
        POOL_STRING_LONG => "long string".to_string(),
        POOL_LIST_BLOCK => "list block".to_string(),
        POOL_ROOT_RECORD => "root record".to_string(),
        p if p >= POOL_FIRST_NODE_TYPE => format!("node type {}", p - POOL_FIRST_NODE_TYPE),
        p => format!("pool {p}"),
    }
}
