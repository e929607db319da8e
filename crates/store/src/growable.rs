//! Growable arrays of record addresses embedded in a parent record.
//!
//! The field holds a storage pointer followed by a few inline slots. Elements
//! `0..inline_size` always live inline; the rest spill into separately allocated
//! storage:
//!
//! ```text
//! Field:      [u64 storage][inline_size x u64]
//! Block:      [u32 size][u32 capacity][capacity x u64]
//! Metablock:  [u32 size][u32 capacity][capacity / MAX_GROWABLE_BLOCK x u64 sub-block]
//! Sub-block:  [MAX_GROWABLE_BLOCK x u64]
//! ```
//!
//! `size` counts every element, inline ones included; `capacity` counts spilled
//! slots only. A capacity above [`MAX_GROWABLE_BLOCK`] marks a metablock. Without
//! storage the size is the number of leading non-null inline slots, so elements
//! are never null.

use crate::{
    db::{Database, WriteLock},
    error::{Error, Result},
    types::{Address, POOL_GROWABLE_ARRAY},
};

/// Smallest spilled capacity.
pub const MIN_GROWABLE_BLOCK: usize = 4;
/// Largest single growable block, in elements; beyond it storage grows in
/// whole multiples of this through a metablock.
pub const MAX_GROWABLE_BLOCK: usize = 256;

const HEADER_SIZE: u64 = 8;
const SLOT: u64 = Address::SIZE as u64;

/// Spilled capacity serving `extra` elements beyond the inline slots.
fn spilled_capacity_for(extra: usize) -> usize {
    if extra == 0 {
        0
    } else if extra <= MAX_GROWABLE_BLOCK {
        extra.max(MIN_GROWABLE_BLOCK).next_power_of_two()
    } else {
        extra.div_ceil(MAX_GROWABLE_BLOCK) * MAX_GROWABLE_BLOCK
    }
}

/// Accessor for growable arrays with a fixed number of inline slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawGrowableArray {
    inline_size: usize,
}

impl RawGrowableArray {
    /// Creates an accessor for arrays with `inline_size` inline slots.
    pub const fn new(inline_size: usize) -> Self {
        Self { inline_size }
    }

    /// Returns the number of inline slots.
    pub const fn inline_size(&self) -> usize {
        self.inline_size
    }

    /// Returns the bytes the array occupies inside its parent record.
    pub const fn record_size(&self) -> usize {
        Address::SIZE * (1 + self.inline_size)
    }

    /// Returns the capacity [`ensure_capacity`](Self::ensure_capacity) settles on
    /// for a request of `requested` elements.
    pub fn capacity_for(&self, requested: usize) -> usize {
        self.inline_size + spilled_capacity_for(requested.saturating_sub(self.inline_size))
    }

    fn inline_slot(&self, address: Address, index: usize) -> Address {
        address.add(SLOT * (1 + index as u64))
    }

    fn storage(&self, db: &Database, address: Address) -> Result<Address> {
        db.get_address(address)
    }

    /// Returns `(size, spilled capacity)`.
    fn header(&self, db: &Database, address: Address, storage: Address) -> Result<(usize, usize)> {
        if storage.is_null() {
            let mut size = 0;
            while size < self.inline_size && !db.get_address(self.inline_slot(address, size))?.is_null()
            {
                size += 1;
            }
            return Ok((size, 0));
        }

        let size = db.get_u32(storage)? as usize;
        let capacity = db.get_u32(storage.add(4))? as usize;
        if size > self.inline_size + capacity
            || (capacity > MAX_GROWABLE_BLOCK && capacity % MAX_GROWABLE_BLOCK != 0)
        {
            return Err(Error::corrupted(format!(
                "Growable array {address} has size {size} and capacity {capacity}"
            )));
        }
        Ok((size, capacity))
    }

    fn write_header(
        &self,
        w: &mut WriteLock<'_>,
        storage: Address,
        size: usize,
        capacity: usize,
    ) -> Result<()> {
        w.put_u32(storage, size as u32)?;
        w.put_u32(storage.add(4), capacity as u32)
    }

    /// Address of the slot holding element `index`.
    fn slot(
        &self,
        db: &Database,
        address: Address,
        storage: Address,
        capacity: usize,
        index: usize,
    ) -> Result<Address> {
        if index < self.inline_size {
            return Ok(self.inline_slot(address, index));
        }
        let spilled = index - self.inline_size;
        if capacity <= MAX_GROWABLE_BLOCK {
            return Ok(storage.add(HEADER_SIZE + SLOT * spilled as u64));
        }
        let block = spilled / MAX_GROWABLE_BLOCK;
        let sub_block = db.get_address(storage.add(HEADER_SIZE + SLOT * block as u64))?;
        if sub_block.is_null() {
            return Err(Error::corrupted(format!("Growable array {address} lost sub-block {block}")));
        }
        Ok(sub_block.add(SLOT * (spilled % MAX_GROWABLE_BLOCK) as u64))
    }

    /// Returns the number of elements.
    ///
    /// # Errors
    ///
    /// Returns an error if the array cannot be read or its header is inconsistent.
    pub fn size(&self, db: &Database, address: Address) -> Result<usize> {
        let storage = self.storage(db, address)?;
        Ok(self.header(db, address, storage)?.0)
    }

    /// Returns `true` if the array has no elements.
    ///
    /// # Errors
    ///
    /// Returns an error if the array cannot be read.
    pub fn is_empty(&self, db: &Database, address: Address) -> Result<bool> {
        Ok(self.size(db, address)? == 0)
    }

    /// Returns the number of elements the array holds without reallocating.
    ///
    /// # Errors
    ///
    /// Returns an error if the array cannot be read.
    pub fn capacity(&self, db: &Database, address: Address) -> Result<usize> {
        let storage = self.storage(db, address)?;
        Ok(self.inline_size + self.header(db, address, storage)?.1)
    }

    /// Returns element `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the array cannot be read.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn get(&self, db: &Database, address: Address, index: usize) -> Result<Address> {
        let storage = self.storage(db, address)?;
        let (size, capacity) = self.header(db, address, storage)?;
        assert!(index < size, "growable array index {index} out of bounds for size {size}");
        db.get_address(self.slot(db, address, storage, capacity, index)?)
    }

    /// Returns every element in index order.
    ///
    /// # Errors
    ///
    /// Returns an error if the array cannot be read.
    pub fn to_vec(&self, db: &Database, address: Address) -> Result<Vec<Address>> {
        let storage = self.storage(db, address)?;
        let (size, capacity) = self.header(db, address, storage)?;
        (0..size)
            .map(|i| db.get_address(self.slot(db, address, storage, capacity, i)?))
            .collect()
    }

    /// Appends `value` and returns its index.
    ///
    /// # Errors
    ///
    /// Returns an error if the array cannot be read, written or grown.
    ///
    /// # Panics
    ///
    /// Panics if `value` is null.
    pub fn add(&self, w: &mut WriteLock<'_>, address: Address, value: Address) -> Result<usize> {
        assert!(!value.is_null(), "growable arrays cannot hold the null address");

        let size = self.size(w, address)?;
        self.ensure_capacity(w, address, size + 1)?;

        let storage = self.storage(w, address)?;
        let (_, capacity) = self.header(w, address, storage)?;
        let slot = self.slot(w, address, storage, capacity, size)?;
        w.put_address(slot, value)?;
        if !storage.is_null() {
            self.write_header(w, storage, size + 1, capacity)?;
        }
        Ok(size)
    }

    /// Removes element `index` by moving the last element into its place.
    ///
    /// Returns the element now at `index`, or null if `index` was the last one.
    /// Spilled storage shrinks once it is at most a quarter full and is released
    /// entirely once every element fits inline.
    ///
    /// # Errors
    ///
    /// Returns an error if the array cannot be read, written or shrunk.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn remove(&self, w: &mut WriteLock<'_>, address: Address, index: usize) -> Result<Address> {
        let storage = self.storage(w, address)?;
        let (size, capacity) = self.header(w, address, storage)?;
        assert!(index < size, "growable array index {index} out of bounds for size {size}");

        let last_slot = self.slot(w, address, storage, capacity, size - 1)?;
        let moved = if index == size - 1 {
            Address::NULL
        } else {
            let last = w.get_address(last_slot)?;
            let slot = self.slot(w, address, storage, capacity, index)?;
            w.put_address(slot, last)?;
            last
        };
        w.put_address(last_slot, Address::NULL)?;

        if !storage.is_null() {
            let size = size - 1;
            self.write_header(w, storage, size, capacity)?;

            let spilled = size.saturating_sub(self.inline_size);
            if spilled == 0 {
                self.resize(w, address, 0)?;
            } else if spilled <= capacity / 4 {
                let target = spilled_capacity_for(spilled * 2);
                if target < capacity {
                    self.resize(w, address, target)?;
                }
            }
        }
        Ok(moved)
    }

    /// Makes room for at least `requested` elements. Never shrinks.
    ///
    /// # Errors
    ///
    /// Returns an error if the array cannot be read or storage cannot be allocated.
    pub fn ensure_capacity(&self, w: &mut WriteLock<'_>, address: Address, requested: usize) -> Result<()> {
        if requested <= self.capacity(w, address)? {
            return Ok(());
        }
        let target = spilled_capacity_for(requested - self.inline_size);
        self.resize(w, address, target)
    }

    /// Frees spilled storage and clears the field.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be read or freed.
    pub fn destruct(&self, w: &mut WriteLock<'_>, address: Address) -> Result<()> {
        let storage = self.storage(w, address)?;
        let (_, capacity) = self.header(w, address, storage)?;
        self.free_storage(w, storage, capacity)?;
        w.clear_range(address, self.record_size())
    }

    fn allocate_storage(&self, w: &mut WriteLock<'_>, capacity: usize) -> Result<Address> {
        if capacity <= MAX_GROWABLE_BLOCK {
            return w.malloc(HEADER_SIZE as usize + capacity * Address::SIZE, POOL_GROWABLE_ARRAY);
        }
        let blocks = capacity / MAX_GROWABLE_BLOCK;
        let metablock = w.malloc(HEADER_SIZE as usize + blocks * Address::SIZE, POOL_GROWABLE_ARRAY)?;
        for block in 0..blocks {
            let sub_block = w.malloc(MAX_GROWABLE_BLOCK * Address::SIZE, POOL_GROWABLE_ARRAY)?;
            w.put_address(metablock.add(HEADER_SIZE + SLOT * block as u64), sub_block)?;
        }
        Ok(metablock)
    }

    fn free_storage(&self, w: &mut WriteLock<'_>, storage: Address, capacity: usize) -> Result<()> {
        if storage.is_null() {
            return Ok(());
        }
        if capacity > MAX_GROWABLE_BLOCK {
            for block in 0..capacity / MAX_GROWABLE_BLOCK {
                let sub_block = w.get_address(storage.add(HEADER_SIZE + SLOT * block as u64))?;
                w.free(sub_block, POOL_GROWABLE_ARRAY)?;
            }
        }
        w.free(storage, POOL_GROWABLE_ARRAY)
    }

    /// Moves the spilled elements into storage of exactly `target` spilled slots.
    fn resize(&self, w: &mut WriteLock<'_>, address: Address, target: usize) -> Result<()> {
        let storage = self.storage(w, address)?;
        let (size, capacity) = self.header(w, address, storage)?;
        let spilled = size.saturating_sub(self.inline_size);
        if spilled > target {
            return Err(Error::corrupted(format!(
                "Shrinking growable array {address} below its {spilled} spilled elements"
            )));
        }

        if capacity > MAX_GROWABLE_BLOCK && target > MAX_GROWABLE_BLOCK {
            return self.resize_metablock(w, address, storage, size, capacity, target);
        }

        let db: &Database = &**w;
        let elements = (self.inline_size..size)
            .map(|i| db.get_address(self.slot(db, address, storage, capacity, i)?))
            .collect::<Result<Vec<_>>>()?;
        self.free_storage(w, storage, capacity)?;

        if target == 0 {
            return w.put_address(address, Address::NULL);
        }

        let new_storage = self.allocate_storage(w, target)?;
        self.write_header(w, new_storage, size, target)?;
        for (i, element) in elements.into_iter().enumerate() {
            let slot = self.slot(w, address, new_storage, target, self.inline_size + i)?;
            w.put_address(slot, element)?;
        }
        w.put_address(address, new_storage)
    }

    /// Metablock to metablock: keeps the sub-blocks, reallocates only the index.
    fn resize_metablock(
        &self,
        w: &mut WriteLock<'_>,
        address: Address,
        storage: Address,
        size: usize,
        capacity: usize,
        target: usize,
    ) -> Result<()> {
        let old_blocks = capacity / MAX_GROWABLE_BLOCK;
        let new_blocks = target / MAX_GROWABLE_BLOCK;

        let db: &Database = &**w;
        let mut sub_blocks = (0..old_blocks)
            .map(|b| db.get_address(storage.add(HEADER_SIZE + SLOT * b as u64)))
            .collect::<Result<Vec<_>>>()?;
        for sub_block in sub_blocks.drain(new_blocks.min(old_blocks)..) {
            w.free(sub_block, POOL_GROWABLE_ARRAY)?;
        }
        while sub_blocks.len() < new_blocks {
            sub_blocks.push(w.malloc(MAX_GROWABLE_BLOCK * Address::SIZE, POOL_GROWABLE_ARRAY)?);
        }
        w.free(storage, POOL_GROWABLE_ARRAY)?;

        let metablock = w.malloc(HEADER_SIZE as usize + new_blocks * Address::SIZE, POOL_GROWABLE_ARRAY)?;
        self.write_header(w, metablock, size, target)?;
        for (b, sub_block) in sub_blocks.into_iter().enumerate() {
            w.put_address(metablock.add(HEADER_SIZE + SLOT * b as u64), sub_block)?;
        }
        w.put_address(address, metablock)
    }
}
