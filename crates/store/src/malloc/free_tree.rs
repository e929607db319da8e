//! Persistent bitwise trie of free large blocks, keyed by chunk count.
//!
//! Each free large block doubles as a trie node: the link fields live in its
//! payload, right after the block header. A node at depth `d` routes keys by bit
//! `31 - d`, so every key in a subtree shares the top `d` bits of its root.
//! Blocks of equal size hang off the trie node in a doubly linked list; only
//! the head of that list (`prev == 0`) is linked into the trie.
//!
//! ```text
//! Offset  Field
//! ------  -----
//! 0       Block header (signed chunk count)
//! 8       Parent node
//! 16      Child for bit 0
//! 24      Child for bit 1
//! 32      Next block of the same size
//! 40      Previous block of the same size (0 on the list head)
//! ```

use super::{Allocator, LARGE_BLOCK_HEADER_SIZE};
use crate::{
    backend::FREE_TREE_ROOT_OFFSET,
    db::Database,
    error::{Error, Result},
};

pub(crate) const PARENT: u64 = LARGE_BLOCK_HEADER_SIZE;
pub(crate) const CHILD0: u64 = PARENT + 8;
pub(crate) const CHILD1: u64 = CHILD0 + 8;
pub(crate) const NEXT: u64 = CHILD1 + 8;
pub(crate) const PREV: u64 = NEXT + 8;
const NODE_END: u64 = PREV + 8;

/// Bits in a trie key.
const KEY_BITS: u32 = 32;

fn child_field(key: u64, depth: u32) -> u64 {
    if (key >> (KEY_BITS - 1 - depth)) & 1 == 0 { CHILD0 } else { CHILD1 }
}

fn field(db: &Database, block: u64, offset: u64) -> Result<u64> {
    db.read_u64_raw(block + offset)
}

fn key_of(db: &Database, block: u64) -> Result<u64> {
    let tag = db.read_i32_raw(block)?;
    if tag <= 0 {
        return Err(Error::corrupted(format!(
            "Free-tree node {block:#x} is not a free block (header {tag})"
        )));
    }
    Ok(tag as u64)
}

/// Returns the root of the trie, or zero when empty.
pub(crate) fn root(db: &Database) -> Result<u64> {
    db.read_u64_raw(FREE_TREE_ROOT_OFFSET)
}

/// Finds the free block with the smallest chunk count `>= target`.
///
/// Returns `(block start, chunk count)`.
pub(crate) fn best_fit(db: &Database, target: u64) -> Result<Option<(u64, u64)>> {
    best_fit_in(db, root(db)?, 0, target)
}

fn best_fit_in(db: &Database, node: u64, depth: u32, target: u64) -> Result<Option<(u64, u64)>> {
    if node == 0 {
        return Ok(None);
    }
    if depth > KEY_BITS {
        return Err(Error::corrupted("Free tree deeper than its key width"));
    }

    let key = key_of(db, node)?;
    let free_bits = KEY_BITS - depth;
    let subtree_max = key | ((1u64 << free_bits) - 1);
    if subtree_max < target {
        return Ok(None);
    }
    if key == target {
        return Ok(Some((node, key)));
    }

    let mut best = (key >= target).then_some((node, key));
    // Bit-0 keys are all below bit-1 keys, so a hit on the left settles it.
    for child in [CHILD0, CHILD1] {
        if let Some(found) = best_fit_in(db, field(db, node, child)?, depth + 1, target)? {
            if best.is_none_or(|(_, k)| found.1 < k) {
                best = Some(found);
            }
            break;
        }
    }
    Ok(best)
}

/// Lists every free block reachable from the trie as `(block start, chunk count)`,
/// sorted by block start.
pub(crate) fn collect(db: &Database) -> Result<Vec<(u64, u64)>> {
    let mut out = Vec::new();
    let mut stack = vec![(root(db)?, 0u64)];
    while let Some((node, parent)) = stack.pop() {
        if node == 0 {
            continue;
        }
        if field(db, node, PARENT)? != parent {
            return Err(Error::corrupted(format!("Free-tree node {node:#x} has a stale parent")));
        }
        if field(db, node, PREV)? != 0 {
            return Err(Error::corrupted(format!("Free-tree node {node:#x} is not a list head")));
        }

        let key = key_of(db, node)?;
        out.push((node, key));

        let mut previous = node;
        let mut duplicate = field(db, node, NEXT)?;
        while duplicate != 0 {
            if key_of(db, duplicate)? != key || field(db, duplicate, PREV)? != previous {
                return Err(Error::corrupted(format!(
                    "Free-tree duplicate list broken at {duplicate:#x}"
                )));
            }
            out.push((duplicate, key));
            if out.len() as u64 > db.chunk_count() {
                return Err(Error::corrupted("Free-tree duplicate list loops"));
            }
            previous = duplicate;
            duplicate = field(db, duplicate, NEXT)?;
        }

        stack.push((field(db, node, CHILD0)?, node));
        stack.push((field(db, node, CHILD1)?, node));
    }
    out.sort_unstable();
    Ok(out)
}

impl Allocator<'_> {
    fn set_field(&mut self, block: u64, offset: u64, value: u64) -> Result<()> {
        self.write_u64(block + offset, value)
    }

    fn set_root(&mut self, block: u64) -> Result<()> {
        self.write_u64(FREE_TREE_ROOT_OFFSET, block)
    }

    fn clear_node(&mut self, block: u64) -> Result<()> {
        self.db.clear_raw(self.state, block + PARENT, (NODE_END - PARENT) as usize)
    }

    /// Points whichever child slot of `parent` holds `old` at `new`.
    fn replace_child(&mut self, parent: u64, old: u64, new: u64) -> Result<()> {
        if field(self.db, parent, CHILD0)? == old {
            self.set_field(parent, CHILD0, new)
        } else if field(self.db, parent, CHILD1)? == old {
            self.set_field(parent, CHILD1, new)
        } else {
            Err(Error::corrupted(format!(
                "Free-tree node {old:#x} is not a child of {parent:#x}"
            )))
        }
    }

    /// Links a free block of `key` chunks into the trie.
    pub(crate) fn insert_free_block(&mut self, block: u64, key: u64) -> Result<()> {
        self.clear_node(block)?;

        let mut node = root(self.db)?;
        if node == 0 {
            return self.set_root(block);
        }

        let mut depth = 0;
        loop {
            if key_of(self.db, node)? == key {
                let next = field(self.db, node, NEXT)?;
                self.set_field(block, NEXT, next)?;
                self.set_field(block, PREV, node)?;
                if next != 0 {
                    self.set_field(next, PREV, block)?;
                }
                return self.set_field(node, NEXT, block);
            }
            if depth >= KEY_BITS {
                return Err(Error::corrupted("Free tree deeper than its key width"));
            }

            let slot = child_field(key, depth);
            let child = field(self.db, node, slot)?;
            if child == 0 {
                self.set_field(node, slot, block)?;
                return self.set_field(block, PARENT, node);
            }
            node = child;
            depth += 1;
        }
    }

    /// Unlinks a free block from the trie.
    ///
    /// A list head with duplicates hands its trie position to the next duplicate;
    /// a lone interior node is replaced by one of its leaf descendants.
    pub(crate) fn remove_free_block(&mut self, block: u64) -> Result<()> {
        let prev = field(self.db, block, PREV)?;
        let next = field(self.db, block, NEXT)?;

        if prev != 0 {
            self.set_field(prev, NEXT, next)?;
            if next != 0 {
                self.set_field(next, PREV, prev)?;
            }
            return self.clear_node(block);
        }

        let replacement = if next != 0 {
            self.set_field(next, PREV, 0)?;
            next
        } else {
            let mut leaf = field(self.db, block, CHILD0)?;
            if leaf == 0 {
                leaf = field(self.db, block, CHILD1)?;
            }
            if leaf != 0 {
                loop {
                    let left = field(self.db, leaf, CHILD0)?;
                    let right = field(self.db, leaf, CHILD1)?;
                    if left != 0 {
                        leaf = left;
                    } else if right != 0 {
                        leaf = right;
                    } else {
                        break;
                    }
                }
                let leaf_parent = field(self.db, leaf, PARENT)?;
                self.replace_child(leaf_parent, leaf, 0)?;
            }
            leaf
        };

        let parent = field(self.db, block, PARENT)?;
        if replacement != 0 {
            let left = field(self.db, block, CHILD0)?;
            let right = field(self.db, block, CHILD1)?;
            self.set_field(replacement, PARENT, parent)?;
            self.set_field(replacement, CHILD0, left)?;
            self.set_field(replacement, CHILD1, right)?;
            for child in [left, right] {
                if child != 0 {
                    self.set_field(child, PARENT, replacement)?;
                }
            }
        }

        if parent == 0 {
            if root(self.db)? != block {
                return Err(Error::corrupted(format!(
                    "Free-tree node {block:#x} has no parent but is not the root"
                )));
            }
            self.set_root(replacement)?;
        } else {
            self.replace_child(parent, block, replacement)?;
        }
        self.clear_node(block)
    }
}
