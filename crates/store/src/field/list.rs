//! Records embedded in chained blocks owned by a parent record.

use std::{fmt, marker::PhantomData};

use crate::{
    db::{Database, WriteLock},
    error::{Error, Result},
    nd::NdWriteLock,
    schema::{FieldId, FieldKind, SchemaBuilder, StructDef, StructId, kind_mismatch},
    types::{Address, NdRecord, POOL_LIST_BLOCK},
};

const NEXT_OFFSET: u64 = 0;
const CAPACITY_OFFSET: u64 = 8;
const COUNT_OFFSET: u64 = 12;
const BLOCK_HEADER_SIZE: u64 = 16;

const FIRST_BLOCK_CAPACITY: usize = 4;
const MAX_BLOCK_CAPACITY: usize = 64;

/// A list of element records stored inside blocks owned by the parent.
///
/// ```text
/// Field:  [u64 first block]
/// Block:  [u64 next][u32 capacity][u32 count][capacity x element]
/// ```
///
/// Elements never move once appended, so other records may point at them. They
/// are destroyed together with the parent.
pub struct FieldList<E> {
    id: FieldId,
    offset: u64,
    element: StructId,
    element_size: usize,
    _element: PhantomData<fn() -> E>,
}

impl<E> Clone for FieldList<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for FieldList<E> {}

impl<E> fmt::Debug for FieldList<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldList")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("element", &self.element)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct Block {
    address: Address,
    capacity: usize,
    count: usize,
}

fn read_block(db: &Database, address: Address) -> Result<Block> {
    let capacity = db.get_u32(address.add(CAPACITY_OFFSET))? as usize;
    let count = db.get_u32(address.add(COUNT_OFFSET))? as usize;
    if count > capacity {
        return Err(Error::corrupted(format!(
            "List block {address} holds {count} elements but has room for {capacity}"
        )));
    }
    Ok(Block { address, capacity, count })
}

fn blocks(db: &Database, head: Address) -> Result<Vec<Block>> {
    let limit = db.end_offset() / BLOCK_HEADER_SIZE;
    let mut blocks = Vec::new();
    let mut next = db.get_address(head)?;
    while !next.is_null() {
        if blocks.len() as u64 > limit {
            return Err(Error::corrupted(format!("List at {head} loops")));
        }
        let block = read_block(db, next)?;
        next = db.get_address(next.add(NEXT_OFFSET))?;
        blocks.push(block);
    }
    Ok(blocks)
}

impl<E: NdRecord> FieldList<E> {
    /// Declares a list of `element` records.
    ///
    /// # Panics
    ///
    /// Panics if `def` is done, or `element` is not done yet.
    ///
    /// Elements live inside the list's blocks, so [`SchemaBuilder::build`]
    /// rejects an element struct that could be deleted on its own.
    pub fn create<P>(b: &mut SchemaBuilder, def: StructDef<P>, element: StructDef<E>) -> Self {
        let element_size = b.use_as_list_element(element.id());
        let (id, offset) = b.add_field(def.id(), Address::SIZE, FieldKind::List { element: element.id() });
        Self { id, offset, element: element.id(), element_size, _element: PhantomData }
    }

    /// Returns the byte offset of the field within its record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn element_at(&self, block: Address, index: usize) -> Address {
        block.add(BLOCK_HEADER_SIZE + (index * self.element_size) as u64)
    }

    /// Returns the number of elements.
    ///
    /// # Errors
    ///
    /// Returns an error if a block cannot be read.
    pub fn size(&self, db: &Database, record: Address) -> Result<usize> {
        Ok(blocks(db, record.add(self.offset))?.iter().map(|b| b.count).sum())
    }

    /// Returns the number of elements the list holds without allocating.
    ///
    /// # Errors
    ///
    /// Returns an error if a block cannot be read.
    pub fn capacity(&self, db: &Database, record: Address) -> Result<usize> {
        Ok(blocks(db, record.add(self.offset))?.iter().map(|b| b.capacity).sum())
    }

    /// Returns the element at `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if a block cannot be read.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn get(&self, db: &Database, record: Address, index: usize) -> Result<E> {
        let mut remaining = index;
        for block in blocks(db, record.add(self.offset))? {
            if remaining < block.count {
                return Ok(E::from_address(self.element_at(block.address, remaining)));
            }
            remaining -= block.count;
        }
        panic!("list index {index} out of bounds");
    }

    /// Returns every element in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if a block cannot be read.
    pub fn as_list(&self, db: &Database, record: Address) -> Result<Vec<E>> {
        let mut elements = Vec::new();
        for block in blocks(db, record.add(self.offset))? {
            elements.extend((0..block.count).map(|i| E::from_address(self.element_at(block.address, i))));
        }
        Ok(elements)
    }

    /// Appends a zeroed element and returns it for the caller to fill in.
    ///
    /// # Errors
    ///
    /// Returns an error if a block cannot be read or allocated.
    pub fn append(&self, w: &mut WriteLock<'_>, record: Address) -> Result<E> {
        let head = record.add(self.offset);
        let chain = blocks(w, head)?;

        let block = match chain.iter().find(|b| b.count < b.capacity) {
            Some(block) => *block,
            None => {
                let capacity = chain
                    .last()
                    .map_or(FIRST_BLOCK_CAPACITY, |last| (last.capacity * 2).min(MAX_BLOCK_CAPACITY));
                self.push_block(w, head, chain.last(), capacity)?
            },
        };

        let element = self.element_at(block.address, block.count);
        w.put_u16(element, self.element)?;
        w.put_u32(block.address.add(COUNT_OFFSET), (block.count + 1) as u32)?;
        Ok(E::from_address(element))
    }

    /// Preallocates room for `capacity` elements in total.
    ///
    /// # Errors
    ///
    /// Returns an error if a block cannot be read or allocated.
    pub fn ensure_capacity(&self, w: &mut WriteLock<'_>, record: Address, capacity: usize) -> Result<()> {
        let head = record.add(self.offset);
        let chain = blocks(w, head)?;
        let current: usize = chain.iter().map(|b| b.capacity).sum();
        if capacity > current {
            self.push_block(w, head, chain.last(), (capacity - current).max(FIRST_BLOCK_CAPACITY))?;
        }
        Ok(())
    }

    fn push_block(
        &self,
        w: &mut WriteLock<'_>,
        head: Address,
        last: Option<&Block>,
        capacity: usize,
    ) -> Result<Block> {
        let bytes = BLOCK_HEADER_SIZE as usize + capacity * self.element_size;
        let address = w.malloc(bytes, POOL_LIST_BLOCK)?;
        w.put_u32(address.add(CAPACITY_OFFSET), capacity as u32)?;
        let link = last.map_or(head, |b| b.address.add(NEXT_OFFSET));
        w.put_address(link, address)?;
        Ok(Block { address, capacity, count: 0 })
    }
}

/// Destroys every element of a record's list and frees its blocks.
pub(crate) fn destruct(w: &mut NdWriteLock<'_>, field: FieldId, record: Address) -> Result<()> {
    let schema = w.schema();
    let info = schema.field(field);
    let FieldKind::List { element } = info.kind else {
        return Err(kind_mismatch(field, "list"));
    };
    let element_size = schema.record_size(element).unwrap_or_default();

    let head = record.add(info.offset);
    for block in blocks(w, head)? {
        for index in 0..block.count {
            let address = block.address.add(BLOCK_HEADER_SIZE + (index * element_size) as u64);
            w.destroy(address, element)?;
        }
        w.free(block.address, POOL_LIST_BLOCK)?;
    }
    w.put_address(head, Address::NULL)
}
