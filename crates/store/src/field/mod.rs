//! Typed field accessors.
//!
//! Every accessor is a small `Copy` handle holding the field's byte offset (and,
//! for relationships, the schema ids it needs). Handles are obtained from
//! [`SchemaBuilder`](crate::SchemaBuilder) or from the relationship constructors
//! and are applied to a record address at run time.
//!
//! Reads take a [`Database`](crate::Database). Scalar and string writes take a
//! [`WriteLock`](crate::WriteLock); writes that maintain inverse pointers or may
//! schedule deletions take an [`NdWriteLock`](crate::NdWriteLock).
//!
//! ## Structure
//!
//! - `scalar.rs`: fixed-size numeric, character and raw pointer fields
//! - `string.rs`: owned string fields
//! - `many_to_one.rs` / `one_to_many.rs`: the two sides of a parent/children edge
//! - `one_to_one.rs`: symmetric single-valued edges
//! - `list.rs`: records embedded in chained blocks owned by the parent
//! - `search.rs`: string keys indexed by a B-tree hanging off the root record

mod list;
mod many_to_one;
mod one_to_many;
mod one_to_one;
mod scalar;
mod search;
mod string;

pub use list::FieldList;
pub use many_to_one::FieldManyToOne;
pub use one_to_many::FieldOneToMany;
pub use one_to_one::FieldOneToOne;
pub use scalar::{
    FieldByte, FieldChar, FieldDouble, FieldFloat, FieldInt, FieldLong, FieldPointer, FieldShort,
};
pub use search::{FieldSearchIndex, FieldSearchKey, SearchCriteria, SearchKeyComparator};
pub use string::FieldString;

pub(crate) use list::destruct as destruct_list;
pub(crate) use many_to_one::relink as relink_many_to_one;
pub(crate) use one_to_many::destruct as destruct_one_to_many;
pub(crate) use one_to_one::relink as relink_one_to_one;
pub(crate) use search::{destruct_index, destruct_key};
pub(crate) use string::destruct as destruct_string;
