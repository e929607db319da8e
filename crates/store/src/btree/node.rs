//! On-disk B-tree node layout.
//!
//! A node of degree `t` is one block holding `2t - 1` record slots followed by
//! `2t` child slots, all 8-byte addresses. Records fill the slots from the left
//! and the first null slot ends them. A leaf has no children; an internal node
//! has exactly one more child than records.

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    db::{Database, WriteLock},
    error::{Error, Result},
    types::Address,
};

/// Slot counts derived from the tree degree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeLayout {
    degree: usize,
}

impl NodeLayout {
    pub(crate) fn new(degree: usize) -> Self {
        Self { degree }
    }

    pub(crate) fn degree(&self) -> usize {
        self.degree
    }

    pub(crate) fn max_records(&self) -> usize {
        2 * self.degree - 1
    }

    pub(crate) fn max_children(&self) -> usize {
        2 * self.degree
    }

    /// Fewest records a non-root node may hold.
    pub(crate) fn min_records(&self) -> usize {
        self.degree - 1
    }

    pub(crate) fn node_size(&self) -> usize {
        (self.max_records() + self.max_children()) * Address::SIZE
    }
}

/// An in-memory copy of one node.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) address: Address,
    pub(crate) records: Vec<Address>,
    pub(crate) children: Vec<Address>,
}

impl Node {
    pub(crate) fn empty(address: Address) -> Self {
        Self { address, records: Vec::new(), children: Vec::new() }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub(crate) fn read(db: &Database, address: Address, layout: NodeLayout) -> Result<Self> {
        let mut buf = vec![0u8; layout.node_size()];
        db.get_bytes(address, &mut buf)?;

        let slots: Vec<Address> =
            buf.chunks_exact(Address::SIZE).map(|s| Address::new(LittleEndian::read_u64(s))).collect();
        let (record_slots, child_slots) = slots.split_at(layout.max_records());

        let count = record_slots.iter().position(|a| a.is_null()).unwrap_or(record_slots.len());
        if record_slots[count..].iter().any(|a| !a.is_null()) {
            return Err(Error::corrupted(format!("B-tree node {address} has a gap in its records")));
        }

        let children = if child_slots[0].is_null() {
            if child_slots.iter().any(|a| !a.is_null()) {
                return Err(Error::corrupted(format!(
                    "B-tree node {address} has children but no first child"
                )));
            }
            Vec::new()
        } else {
            let used = &child_slots[..=count];
            if used.iter().any(|a| a.is_null()) || child_slots[count + 1..].iter().any(|a| !a.is_null())
            {
                return Err(Error::corrupted(format!(
                    "B-tree node {address} has {count} records but a different number of children"
                )));
            }
            used.to_vec()
        };

        Ok(Self { address, records: record_slots[..count].to_vec(), children })
    }

    pub(crate) fn write(&self, w: &mut WriteLock<'_>, layout: NodeLayout) -> Result<()> {
        let mut buf = vec![0u8; layout.node_size()];
        for (i, record) in self.records.iter().enumerate() {
            LittleEndian::write_u64(&mut buf[i * Address::SIZE..], record.raw());
        }
        let children_start = layout.max_records() * Address::SIZE;
        for (i, child) in self.children.iter().enumerate() {
            LittleEndian::write_u64(&mut buf[children_start + i * Address::SIZE..], child.raw());
        }
        w.put_bytes(self.address, &buf)
    }
}
