//! String keys indexed by a B-tree hanging off the root record.
//!
//! A [`FieldSearchIndex`] lives on the root struct and holds the root of a
//! B-tree. Each [`FieldSearchKey`] names one index; records whose key is
//! non-empty are kept in that tree ordered by key (ignoring case first, then
//! case-sensitively), ties broken by address.

use std::{cmp::Ordering, fmt, marker::PhantomData};

use crate::{
    btree::{BTree, BTreeComparator, BTreeVisitor, DEFAULT_DEGREE},
    db::Database,
    error::{Error, Result},
    field::{FieldString, string::destruct as free_key},
    nd::{Nd, NdWriteLock},
    schema::{FieldId, FieldKind, Schema, SchemaBuilder, StructDef, StructId, kind_mismatch},
    string,
    types::{Address, NdRecord},
};

/// Orders records by the string stored at `key_offset`, then by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchKeyComparator {
    key: FieldString,
}

impl SearchKeyComparator {
    /// Creates a comparator reading keys at `key_offset`.
    pub fn new(key_offset: u64) -> Self {
        Self { key: FieldString::at(key_offset) }
    }
}

impl BTreeComparator for SearchKeyComparator {
    fn compare(&self, db: &Database, a: Address, b: Address) -> Result<Ordering> {
        Ok(self.key.compare(db, a, b)?.then_with(|| a.cmp(&b)))
    }
}

/// What to look for in a search index.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct SearchCriteria {
    /// Key, or key prefix, to match.
    #[builder(into)]
    pub text: String,
    /// Match keys starting with `text` instead of equal to it.
    #[builder(default = false)]
    pub prefix: bool,
    /// Require the case to match too.
    #[builder(default = false)]
    pub match_case: bool,
    /// Only match records of this struct or its subtypes.
    pub node_type: Option<StructId>,
}

impl SearchCriteria {
    /// Matches keys equal to `text`, ignoring case.
    pub fn exact(text: impl Into<String>) -> Self {
        Self::builder().text(text).build()
    }

    /// Matches keys starting with `text`, ignoring case.
    pub fn prefix(text: impl Into<String>) -> Self {
        Self::builder().text(text).prefix(true).build()
    }

    fn accepts(&self, key: &str) -> bool {
        if !self.match_case {
            return true;
        }
        if self.prefix { key.starts_with(self.text.as_str()) } else { key == self.text }
    }
}

/// A B-tree of records keyed by a [`FieldSearchKey`].
pub struct FieldSearchIndex<T> {
    id: FieldId,
    offset: u64,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for FieldSearchIndex<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FieldSearchIndex<T> {}

impl<T> fmt::Debug for FieldSearchIndex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSearchIndex").field("id", &self.id).field("offset", &self.offset).finish()
    }
}

fn index_tree(schema: &Schema, index: FieldId, root_record: Address) -> Result<BTree<SearchKeyComparator>> {
    let info = schema.field(index);
    let FieldKind::SearchIndex { key: Some(key) } = info.kind else {
        return Err(kind_mismatch(index, "keyed search index"));
    };
    if root_record.is_null() {
        return Err(Error::InvalidSchema { reason: "search index used without a root record".to_string() });
    }
    let comparator = SearchKeyComparator::new(schema.field(key).offset);
    Ok(BTree::new(root_record.add(info.offset), DEFAULT_DEGREE, comparator))
}

struct SearchVisitor<'a, F> {
    schema: &'a Schema,
    key: FieldString,
    criteria: &'a SearchCriteria,
    on_match: F,
}

impl<F> BTreeVisitor for SearchVisitor<'_, F>
where
    F: FnMut(&Database, Address) -> Result<bool>,
{
    fn compare(&mut self, db: &Database, candidate: Address) -> Result<Ordering> {
        let key = self.key.get(db, candidate)?;
        Ok(string::compare_for_search(&key, &self.criteria.text, self.criteria.prefix))
    }

    fn visit(&mut self, db: &Database, record: Address) -> Result<bool> {
        if !self.criteria.accepts(&self.key.get(db, record)?) {
            return Ok(true);
        }
        if let Some(required) = self.criteria.node_type {
            let tag = db.get_u16(record)?;
            if !self.schema.is_subtype(tag, required) {
                return Ok(true);
            }
        }
        (self.on_match)(db, record)
    }
}

impl<T: NdRecord> FieldSearchIndex<T> {
    /// Declares an index on the root struct.
    ///
    /// # Panics
    ///
    /// Panics if `root` is done.
    pub fn create<R>(b: &mut SchemaBuilder, root: StructDef<R>) -> Self {
        let (id, offset) = b.add_field(root.id(), Address::SIZE, FieldKind::SearchIndex { key: None });
        Self { id, offset, _record: PhantomData }
    }

    pub(crate) fn field_id(&self) -> FieldId {
        self.id
    }

    /// Returns the byte offset of the field within the root record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn tree(&self, nd: &Nd) -> Result<BTree<SearchKeyComparator>> {
        index_tree(nd.schema(), self.id, nd.root_record()?)
    }

    /// Visits every match in key order until `on_match` returns `false`.
    ///
    /// # Errors
    ///
    /// Returns the first error from the tree or from `on_match`.
    pub fn visit<F>(&self, nd: &Nd, criteria: &SearchCriteria, mut on_match: F) -> Result<()>
    where
        F: FnMut(&Database, T) -> Result<bool>,
    {
        let tree = self.tree(nd)?;
        let mut visitor = SearchVisitor {
            schema: nd.schema(),
            key: tree.comparator().key,
            criteria,
            on_match: |db: &Database, record: Address| on_match(db, T::from_address(record)),
        };
        tree.accept(nd.db(), &mut visitor)?;
        Ok(())
    }

    /// Returns the first match in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be read.
    pub fn find_first(&self, nd: &Nd, criteria: &SearchCriteria) -> Result<Option<T>> {
        let mut found = None;
        self.visit(nd, criteria, |_, record| {
            found = Some(record);
            Ok(false)
        })?;
        Ok(found)
    }

    /// Returns every match in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be read.
    pub fn find_all(&self, nd: &Nd, criteria: &SearchCriteria) -> Result<Vec<T>> {
        let mut found = Vec::new();
        self.visit(nd, criteria, |_, record| {
            found.push(record);
            Ok(true)
        })?;
        Ok(found)
    }

    /// Returns the match `rank` scores highest; the first in key order wins ties.
    ///
    /// # Errors
    ///
    /// Returns the first error from the tree or from `rank`.
    pub fn find_best<F>(&self, nd: &Nd, criteria: &SearchCriteria, mut rank: F) -> Result<Option<T>>
    where
        F: FnMut(&Database, T) -> Result<i64>,
    {
        let mut best: Option<(i64, T)> = None;
        self.visit(nd, criteria, |db, record| {
            let score = rank(db, record)?;
            if best.is_none_or(|(top, _)| score > top) {
                best = Some((score, record));
            }
            Ok(true)
        })?;
        Ok(best.map(|(_, record)| record))
    }

    /// Returns the number of indexed records.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be read.
    pub fn len(&self, nd: &Nd) -> Result<usize> {
        self.tree(nd)?.len(nd.db())
    }

    /// Returns `true` if no record is indexed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root record cannot be read.
    pub fn is_empty(&self, nd: &Nd) -> Result<bool> {
        self.tree(nd)?.is_empty(nd.db())
    }

    /// Describes structural problems of the index tree; empty when sound.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be read.
    pub fn invariants_report(&self, nd: &Nd) -> Result<String> {
        self.tree(nd)?.invariants_report(nd.db())
    }
}

/// A string field whose records are kept in a [`FieldSearchIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSearchKey {
    key: FieldString,
    index: FieldId,
}

impl FieldSearchKey {
    /// Declares the key of `index`. An index has exactly one key.
    ///
    /// # Panics
    ///
    /// Panics if `def` is done or `index` already has a key.
    pub fn create<S, T>(b: &mut SchemaBuilder, def: StructDef<S>, index: FieldSearchIndex<T>) -> Self
    where
        T: NdRecord,
    {
        let (id, offset) =
            b.add_field(def.id(), Address::SIZE, FieldKind::SearchKey { index: index.field_id() });
        match &mut b.field_mut(index.field_id()).kind {
            FieldKind::SearchIndex { key } => {
                assert!(key.is_none(), "search index {} already has a key", index.field_id());
                *key = Some(id);
            },
            _ => panic!("field {} is not a search index", index.field_id()),
        }
        Self { key: FieldString::at(offset), index: index.field_id() }
    }

    /// Returns the byte offset of the field within its record.
    pub fn offset(&self) -> u64 {
        self.key.offset()
    }

    /// Reads the key of `record`; empty when unset.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be read.
    pub fn get(&self, db: &Database, record: Address) -> Result<String> {
        self.key.get(db, record)
    }

    /// Replaces the key of `record` and moves it within the index. Records with
    /// an empty key are not indexed.
    ///
    /// # Errors
    ///
    /// Returns an error if the string or the index cannot be updated.
    pub fn put(&self, w: &mut NdWriteLock<'_>, record: Address, text: &str) -> Result<()> {
        let tree = index_tree(w.schema(), self.index, w.nd().root_record()?)?;
        unindex(w, &tree, self.key, record)?;
        if !text.is_empty() {
            self.key.put(w, record, text)?;
            tree.insert(w, record)?;
        }
        Ok(())
    }
}

/// Removes `record` from the index and frees its key.
fn unindex(
    w: &mut NdWriteLock<'_>,
    tree: &BTree<SearchKeyComparator>,
    key: FieldString,
    record: Address,
) -> Result<()> {
    if key.get_address(w, record)?.is_null() {
        return Ok(());
    }
    if !tree.delete(w, record)? {
        tracing::warn!(record = %record, "Search key was missing from its index");
    }
    free_key(w, record.add(key.offset()))
}

/// Removes a record being deleted from the index its key belongs to.
pub(crate) fn destruct_key(w: &mut NdWriteLock<'_>, field: FieldId, record: Address) -> Result<()> {
    let schema = w.schema();
    let info = schema.field(field);
    let FieldKind::SearchKey { index } = info.kind else {
        return Err(kind_mismatch(field, "search key"));
    };
    let tree = index_tree(schema, index, w.nd().root_record()?)?;
    unindex(w, &tree, FieldString::at(info.offset), record)
}

/// Frees the nodes of an index whose holder is being deleted.
pub(crate) fn destruct_index(w: &mut NdWriteLock<'_>, field: FieldId, record: Address) -> Result<()> {
    let tree = index_tree(w.schema(), field, record)?;
    tree.destruct(w)
}
