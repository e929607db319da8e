//! Record layouts and relationship declarations.
//!
//! A schema is declared once at startup through [`SchemaBuilder`]: structs are
//! created (optionally extending a finished parent), fields are appended in
//! order, then each struct is finished with [`SchemaBuilder::done`] and the whole
//! schema is validated by [`SchemaBuilder::build`]. Field offsets are fixed at
//! declaration time; nothing is discovered at run time.
//!
//! Every record begins with a `u16` type tag holding its struct id, so a record's
//! concrete struct can always be recovered from its address.
//!
//! ```
//! use nd_store::{Address, SchemaBuilder};
//!
//! let mut b = SchemaBuilder::new();
//! let node = b.create_abstract_struct::<Address>("Node", None);
//! b.done(node);
//! let type_def = b.create_struct::<Address>("Type", Some(node.id()));
//! let modifiers = b.add_int(type_def);
//! b.done(type_def);
//! let schema = b.build().unwrap();
//!
//! assert_eq!(modifiers.offset(), 2);
//! assert_eq!(schema.record_size(type_def.id()), Some(6));
//! assert!(schema.is_subtype(type_def.id(), node.id()));
//! ```

use std::{fmt, marker::PhantomData, sync::Arc};

use crate::{
    error::{Error, Result},
    field::{
        FieldByte, FieldChar, FieldDouble, FieldFloat, FieldInt, FieldLong, FieldPointer,
        FieldShort, FieldString,
    },
    growable::RawGrowableArray,
    nd::NdWriteLock,
    types::{Address, NdRecord},
};

/// Struct identifier; doubles as the type tag stored in every record.
pub type StructId = u16;

/// Index of a field in its schema.
pub(crate) type FieldId = usize;

/// Size of the type tag at the start of every record.
pub const RECORD_HEADER_SIZE: usize = 2;

/// Hook run on a record right before its fields are destroyed.
pub type DestructorFn = Arc<dyn Fn(&mut NdWriteLock<'_>, Address) -> Result<()> + Send + Sync>;

/// Typed handle to a struct declared in a [`SchemaBuilder`].
pub struct StructDef<T> {
    id: StructId,
    _record: PhantomData<fn() -> T>,
}

impl<T> StructDef<T> {
    /// Returns the struct id.
    pub fn id(&self) -> StructId {
        self.id
    }
}

impl<T> Clone for StructDef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StructDef<T> {}

impl<T> fmt::Debug for StructDef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StructDef").field(&self.id).finish()
    }
}

/// What a field is and how it relates to other fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldKind {
    Scalar,
    String,
    ManyToOne { inverse: FieldId, owner: bool },
    OneToMany { array: RawGrowableArray, inverse: Option<FieldId> },
    OneToOne { inverse: Option<FieldId>, owner: bool },
    List { element: StructId },
    SearchKey { index: FieldId },
    SearchIndex { key: Option<FieldId> },
}

#[derive(Debug, Clone)]
pub(crate) struct FieldInfo {
    pub(crate) owner: StructId,
    pub(crate) offset: u64,
    pub(crate) kind: FieldKind,
}

#[derive(Clone)]
pub(crate) struct StructInfo {
    pub(crate) name: String,
    pub(crate) parent: Option<StructId>,
    pub(crate) is_abstract: bool,
    pub(crate) fields: Vec<FieldId>,
    pub(crate) size: usize,
    pub(crate) done: bool,
    pub(crate) ref_counted: bool,
    pub(crate) list_element: bool,
    pub(crate) destructor: Option<DestructorFn>,
}

impl fmt::Debug for StructInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructInfo")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("is_abstract", &self.is_abstract)
            .field("fields", &self.fields)
            .field("size", &self.size)
            .field("ref_counted", &self.ref_counted)
            .field("list_element", &self.list_element)
            .field("has_destructor", &self.destructor.is_some())
            .finish()
    }
}

/// Declares structs and fields.
///
/// Contract violations (adding to a finished struct, extending an unfinished
/// parent) panic; inconsistencies only visible once everything is declared are
/// reported by [`build`](Self::build).
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    structs: Vec<StructInfo>,
    fields: Vec<FieldInfo>,
    root_struct: Option<StructId>,
}

impl SchemaBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a struct that records can be created from.
    ///
    /// # Panics
    ///
    /// Panics if `parent` is unknown or not yet finished.
    pub fn create_struct<T: NdRecord>(&mut self, name: &str, parent: Option<StructId>) -> StructDef<T> {
        self.new_struct(name, parent, false)
    }

    /// Declares a struct that only serves as a parent layout.
    ///
    /// # Panics
    ///
    /// Panics if `parent` is unknown or not yet finished.
    pub fn create_abstract_struct<T: NdRecord>(
        &mut self,
        name: &str,
        parent: Option<StructId>,
    ) -> StructDef<T> {
        self.new_struct(name, parent, true)
    }

    fn new_struct<T>(&mut self, name: &str, parent: Option<StructId>, is_abstract: bool) -> StructDef<T> {
        let size = match parent {
            Some(parent) => {
                let info = self.structs.get(parent as usize).unwrap_or_else(|| {
                    panic!("struct {name} extends unknown struct {parent}")
                });
                assert!(info.done, "struct {name} extends {} before it is done", info.name);
                info.size
            },
            None => RECORD_HEADER_SIZE,
        };
        let id = StructId::try_from(self.structs.len()).unwrap_or_else(|_| panic!("too many structs"));

        self.structs.push(StructInfo {
            name: name.to_string(),
            parent,
            is_abstract,
            fields: Vec::new(),
            size,
            done: false,
            ref_counted: false,
            list_element: false,
            destructor: None,
        });
        StructDef { id, _record: PhantomData }
    }

    fn open_struct(&mut self, id: StructId) -> &mut StructInfo {
        let info = &mut self.structs[id as usize];
        assert!(!info.done, "struct {} is already done", info.name);
        info
    }

    /// Appends a field of `size` bytes; returns its id and offset.
    pub(crate) fn add_field(&mut self, owner: StructId, size: usize, kind: FieldKind) -> (FieldId, u64) {
        let id = self.fields.len();
        let info = self.open_struct(owner);
        let offset = info.size as u64;
        info.size += size;
        info.fields.push(id);
        self.fields.push(FieldInfo { owner, offset, kind });
        (id, offset)
    }

    /// Marks a finished struct as embedded in list blocks and returns its size.
    pub(crate) fn use_as_list_element(&mut self, id: StructId) -> usize {
        let info = &mut self.structs[id as usize];
        assert!(info.done, "struct {} is used as a list element before it is done", info.name);
        info.list_element = true;
        info.size
    }

    pub(crate) fn field_mut(&mut self, id: FieldId) -> &mut FieldInfo {
        &mut self.fields[id]
    }

    fn add_scalar<T>(&mut self, def: StructDef<T>, size: usize) -> u64 {
        self.add_field(def.id, size, FieldKind::Scalar).1
    }

    /// Adds an 8-bit unsigned field.
    pub fn add_byte<T>(&mut self, def: StructDef<T>) -> FieldByte {
        FieldByte::at(self.add_scalar(def, 1))
    }

    /// Adds a 16-bit signed field.
    pub fn add_short<T>(&mut self, def: StructDef<T>) -> FieldShort {
        FieldShort::at(self.add_scalar(def, 2))
    }

    /// Adds a 32-bit signed field.
    pub fn add_int<T>(&mut self, def: StructDef<T>) -> FieldInt {
        FieldInt::at(self.add_scalar(def, 4))
    }

    /// Adds a 64-bit signed field.
    pub fn add_long<T>(&mut self, def: StructDef<T>) -> FieldLong {
        FieldLong::at(self.add_scalar(def, 8))
    }

    /// Adds a character field.
    pub fn add_char<T>(&mut self, def: StructDef<T>) -> FieldChar {
        FieldChar::at(self.add_scalar(def, 4))
    }

    /// Adds a 32-bit float field.
    pub fn add_float<T>(&mut self, def: StructDef<T>) -> FieldFloat {
        FieldFloat::at(self.add_scalar(def, 4))
    }

    /// Adds a 64-bit float field.
    pub fn add_double<T>(&mut self, def: StructDef<T>) -> FieldDouble {
        FieldDouble::at(self.add_scalar(def, 8))
    }

    /// Adds a raw address field with no relationship semantics.
    pub fn add_pointer<T>(&mut self, def: StructDef<T>) -> FieldPointer {
        FieldPointer::at(self.add_scalar(def, Address::SIZE))
    }

    /// Adds a string field. The string is freed with the record.
    pub fn add_string<T>(&mut self, def: StructDef<T>) -> FieldString {
        FieldString::at(self.add_field(def.id, Address::SIZE, FieldKind::String).1)
    }

    /// Makes records of this struct and its subtypes deletable once nothing refers
    /// to them any more.
    pub fn use_standard_ref_counting<T>(&mut self, def: StructDef<T>) {
        self.open_struct(def.id).ref_counted = true;
    }

    /// Registers a hook run before a record of this struct is destroyed.
    pub fn set_destructor<T, F>(&mut self, def: StructDef<T>, destructor: F)
    where
        F: Fn(&mut NdWriteLock<'_>, Address) -> Result<()> + Send + Sync + 'static,
    {
        self.open_struct(def.id).destructor = Some(Arc::new(destructor));
    }

    /// Declares the struct of the singleton root record.
    ///
    /// # Panics
    ///
    /// Panics if a root struct was already declared.
    pub fn set_root_struct<T>(&mut self, def: StructDef<T>) {
        assert!(self.root_struct.is_none(), "root struct declared twice");
        self.root_struct = Some(def.id);
    }

    /// Finishes a struct; its size is final afterwards.
    ///
    /// # Panics
    ///
    /// Panics if the struct is already done.
    pub fn done<T>(&mut self, def: StructDef<T>) {
        self.open_struct(def.id).done = true;
    }

    /// Validates the declarations and freezes them into a [`Schema`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSchema`] if a struct was never finished, a
    /// relationship has no inverse, a search index has no key, the root
    /// struct is missing where a search index needs it, or a root record or
    /// list element could be deleted through an owning relationship.
    pub fn build(self) -> Result<Schema> {
        let invalid = |reason: String| Err(Error::InvalidSchema { reason });

        for info in &self.structs {
            if !info.done {
                return invalid(format!("struct {} was never done", info.name));
            }
        }

        let schema = Schema { structs: self.structs, fields: self.fields, root_struct: self.root_struct };
        if let Some(root) = schema.root_struct {
            let name = &schema.structs[root as usize].name;
            if schema.structs[root as usize].is_abstract {
                return invalid(format!("root struct {name} is abstract"));
            }
            if let Some(reason) = schema.owner_edge(root) {
                return invalid(format!("root struct {name} {reason}"));
            }
            if schema.is_list_element(root) {
                return invalid(format!("root struct {name} is a list element"));
            }
        }

        for (id, field) in schema.fields.iter().enumerate() {
            let owner = &schema.structs[field.owner as usize].name;
            match field.kind {
                FieldKind::OneToMany { inverse: None, .. } => {
                    return invalid(format!("one-to-many field {id} of {owner} has no many-to-one inverse"));
                },
                FieldKind::OneToOne { inverse: None, .. } => {
                    return invalid(format!("one-to-one field {id} of {owner} has no inverse"));
                },
                FieldKind::SearchIndex { key: None } => {
                    return invalid(format!("search index {id} of {owner} has no search key"));
                },
                FieldKind::SearchIndex { key: Some(_) } => match schema.root_struct {
                    Some(root) if schema.is_subtype(root, field.owner) => {},
                    _ => {
                        return invalid(format!(
                            "search index {id} is declared on {owner}, which is not the root struct"
                        ));
                    },
                },
                FieldKind::List { element } => {
                    if schema.structs[element as usize].is_abstract {
                        return invalid(format!("list field {id} of {owner} has an abstract element"));
                    }
                    let reason = if schema.is_ref_counted(element) {
                        Some("uses standard ref counting")
                    } else {
                        schema.owner_edge(element)
                    };
                    if let Some(reason) = reason {
                        let name = &schema.structs[element as usize].name;
                        return invalid(format!("list element {name} of {owner} {reason}"));
                    }
                },
                _ => {},
            }
        }

        Ok(schema)
    }
}

/// Error for a field id whose declaration is not of the expected kind.
pub(crate) fn kind_mismatch(field: FieldId, expected: &str) -> Error {
    Error::InvalidSchema { reason: format!("field {field} is not a {expected} field") }
}

/// A frozen, validated set of struct and field declarations.
#[derive(Debug, Clone)]
pub struct Schema {
    structs: Vec<StructInfo>,
    fields: Vec<FieldInfo>,
    root_struct: Option<StructId>,
}

impl Schema {
    /// Returns the number of declared structs.
    pub fn struct_count(&self) -> usize {
        self.structs.len()
    }

    /// Returns a struct's name.
    pub fn struct_name(&self, id: StructId) -> Option<&str> {
        self.structs.get(id as usize).map(|s| s.name.as_str())
    }

    /// Returns the record size of a struct, type tag included.
    pub fn record_size(&self, id: StructId) -> Option<usize> {
        self.structs.get(id as usize).map(|s| s.size)
    }

    /// Returns a struct's parent.
    pub fn parent(&self, id: StructId) -> Option<StructId> {
        self.structs.get(id as usize).and_then(|s| s.parent)
    }

    /// Returns `true` if records cannot be created from the struct.
    pub fn is_abstract(&self, id: StructId) -> bool {
        self.structs.get(id as usize).is_some_and(|s| s.is_abstract)
    }

    /// Returns `true` if `id` is `base` or extends it, directly or not.
    pub fn is_subtype(&self, id: StructId, base: StructId) -> bool {
        let mut current = Some(id);
        while let Some(struct_id) = current {
            if struct_id == base {
                return true;
            }
            current = self.parent(struct_id);
        }
        false
    }

    /// Returns `true` if the struct or any ancestor uses standard ref counting.
    pub fn is_ref_counted(&self, id: StructId) -> bool {
        self.chain(id).iter().any(|&s| self.structs[s as usize].ref_counted)
    }

    /// Returns `true` if records of the struct are embedded in list blocks.
    pub fn is_list_element(&self, id: StructId) -> bool {
        self.structs.get(id as usize).is_some_and(|s| s.list_element)
    }

    /// Names a relationship that deletes a record of the struct when its
    /// owner lets go of it.
    fn owner_edge(&self, id: StructId) -> Option<&'static str> {
        self.all_fields(id).into_iter().find_map(|field| match self.fields[field].kind {
            FieldKind::ManyToOne { owner: true, .. } => Some("has an owner many-to-one field"),
            FieldKind::OneToOne { inverse: Some(inverse), .. }
                if matches!(self.fields[inverse].kind, FieldKind::OneToOne { owner: true, .. }) =>
            {
                Some("is the owned side of a one-to-one field")
            },
            _ => None,
        })
    }

    /// Returns the struct of the root record, if any.
    pub fn root_struct(&self) -> Option<StructId> {
        self.root_struct
    }

    pub(crate) fn struct_info(&self, id: StructId) -> Option<&StructInfo> {
        self.structs.get(id as usize)
    }

    pub(crate) fn field(&self, id: FieldId) -> &FieldInfo {
        &self.fields[id]
    }

    /// Returns the struct and its ancestors, root ancestor first.
    pub(crate) fn chain(&self, id: StructId) -> Vec<StructId> {
        let mut chain = Vec::new();
        let mut current = self.structs.get(id as usize).map(|_| id);
        while let Some(struct_id) = current {
            chain.push(struct_id);
            current = self.parent(struct_id);
        }
        chain.reverse();
        chain
    }

    /// Returns every field of the struct's layout, inherited ones first.
    pub(crate) fn all_fields(&self, id: StructId) -> Vec<FieldId> {
        self.chain(id)
            .into_iter()
            .flat_map(|s| self.structs[s as usize].fields.iter().copied())
            .collect()
    }
}
