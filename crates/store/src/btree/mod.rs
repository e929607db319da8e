//! B-tree over database-resident records.
//!
//! The tree stores record addresses only; ordering comes from a caller-supplied
//! [`BTreeComparator`] that usually reads key fields out of the records. It is a
//! classic degree-`t` B-tree with records in every node:
//! - every node but the root holds between `t - 1` and `2t - 1` records
//! - every leaf sits at the same depth
//! - inserts split full nodes on the way down, deletes top up thin nodes on the
//!   way down, so neither ever walks back up
//!
//! The tree's root address lives in an 8-byte slot anywhere in the database,
//! typically a header root slot or a field of some record.
//!
//! ## Structure
//!
//! - `node.rs`: on-disk node layout and (de)serialization

pub(crate) mod node;

use std::cmp::Ordering;

use node::{Node, NodeLayout};

use crate::{
    db::{Database, WriteLock},
    error::{Error, Result},
    types::{Address, POOL_BTREE_BLOCK},
};

/// Default minimum degree.
pub const DEFAULT_DEGREE: usize = 8;

/// Deeper than any tree the allocator can hold; used to stop on cyclic corruption.
const MAX_DEPTH: usize = 64;

/// Orders records for a [`BTree`].
pub trait BTreeComparator {
    /// Compares two records.
    ///
    /// # Errors
    ///
    /// Returns an error if either record cannot be read.
    fn compare(&self, db: &Database, a: Address, b: Address) -> Result<Ordering>;
}

impl<F> BTreeComparator for F
where
    F: Fn(&Database, Address, Address) -> Result<Ordering>,
{
    fn compare(&self, db: &Database, a: Address, b: Address) -> Result<Ordering> {
        self(db, a, b)
    }
}

/// Steers a traversal started by [`BTree::accept`].
pub trait BTreeVisitor {
    /// Locates `candidate` relative to the records the visitor wants.
    ///
    /// `Less` means the candidate sorts before the wanted range, `Greater` after
    /// it, `Equal` inside it.
    fn compare(&mut self, db: &Database, candidate: Address) -> Result<Ordering>;

    /// Visits a record inside the wanted range. Returns `false` to stop.
    fn visit(&mut self, db: &Database, record: Address) -> Result<bool>;
}

/// A B-tree whose root address is stored at `root_pointer`.
pub struct BTree<C> {
    root_pointer: Address,
    layout: NodeLayout,
    comparator: C,
}

impl<C: BTreeComparator> BTree<C> {
    /// Creates an accessor for the tree rooted at `root_pointer`.
    ///
    /// # Panics
    ///
    /// Panics if `degree < 2`.
    pub fn new(root_pointer: Address, degree: usize, comparator: C) -> Self {
        assert!(degree >= 2, "B-tree degree must be at least 2, got {degree}");
        Self { root_pointer, layout: NodeLayout::new(degree), comparator }
    }

    /// Returns the minimum degree.
    pub fn degree(&self) -> usize {
        self.layout.degree()
    }

    /// Returns the comparator.
    pub fn comparator(&self) -> &C {
        &self.comparator
    }

    /// Returns the root node's address, null for an empty tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the root slot cannot be read.
    pub fn root(&self, db: &Database) -> Result<Address> {
        db.get_address(self.root_pointer)
    }

    /// Returns `true` if the tree holds no records.
    ///
    /// # Errors
    ///
    /// Returns an error if the root slot cannot be read.
    pub fn is_empty(&self, db: &Database) -> Result<bool> {
        Ok(self.root(db)?.is_null())
    }

    fn set_root(&self, w: &mut WriteLock<'_>, root: Address) -> Result<()> {
        w.put_address(self.root_pointer, root)
    }

    fn read(&self, db: &Database, address: Address) -> Result<Node> {
        Node::read(db, address, self.layout)
    }

    fn write(&self, w: &mut WriteLock<'_>, node: &Node) -> Result<()> {
        node.write(w, self.layout)
    }

    fn allocate_node(&self, w: &mut WriteLock<'_>) -> Result<Node> {
        let address = w.malloc(self.layout.node_size(), POOL_BTREE_BLOCK)?;
        Ok(Node::empty(address))
    }

    fn free_node(&self, w: &mut WriteLock<'_>, address: Address) -> Result<()> {
        w.free(address, POOL_BTREE_BLOCK)
    }

    /// Binary search; returns the first index whose record is `>= target`.
    fn search(&self, db: &Database, node: &Node, target: Address) -> Result<(usize, bool)> {
        let (mut lo, mut hi) = (0, node.records.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.comparator.compare(db, node.records[mid], target)? {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok((mid, true)),
            }
        }
        Ok((lo, false))
    }

    /// Inserts `record` unless an equal record is present.
    ///
    /// Returns `record`, or the existing record that compares equal to it.
    ///
    /// # Errors
    ///
    /// Returns an error if node storage cannot be read, written or allocated.
    ///
    /// # Panics
    ///
    /// Panics if `record` is null.
    pub fn insert(&self, w: &mut WriteLock<'_>, record: Address) -> Result<Address> {
        assert!(!record.is_null(), "the null address cannot be inserted into a B-tree");

        let root = self.root(w)?;
        if root.is_null() {
            let mut node = self.allocate_node(w)?;
            node.records.push(record);
            self.write(w, &node)?;
            self.set_root(w, node.address)?;
            return Ok(record);
        }

        let mut node = self.read(w, root)?;
        if node.records.len() == self.layout.max_records() {
            let mut new_root = self.allocate_node(w)?;
            new_root.children.push(node.address);
            self.split_child(w, &mut new_root, 0, node)?;
            self.set_root(w, new_root.address)?;
            node = new_root;
        }

        loop {
            let (mut index, found) = self.search(w, &node, record)?;
            if found {
                return Ok(node.records[index]);
            }
            if node.is_leaf() {
                node.records.insert(index, record);
                self.write(w, &node)?;
                return Ok(record);
            }

            let child = self.read(w, node.children[index])?;
            if child.records.len() == self.layout.max_records() {
                self.split_child(w, &mut node, index, child)?;
                match self.comparator.compare(w, node.records[index], record)? {
                    Ordering::Equal => return Ok(node.records[index]),
                    Ordering::Less => index += 1,
                    Ordering::Greater => {},
                }
                node = self.read(w, node.children[index])?;
            } else {
                node = child;
            }
        }
    }

    /// Splits the full `child` at `parent.children[index]` around its median.
    fn split_child(
        &self,
        w: &mut WriteLock<'_>,
        parent: &mut Node,
        index: usize,
        mut child: Node,
    ) -> Result<()> {
        let t = self.layout.degree();
        let mut right = self.allocate_node(w)?;
        right.records = child.records.split_off(t);
        let median = child.records.pop().ok_or_else(|| {
            Error::corrupted(format!("Splitting B-tree node {} with no records", child.address))
        })?;
        if !child.is_leaf() {
            right.children = child.children.split_off(t);
        }

        parent.records.insert(index, median);
        parent.children.insert(index + 1, right.address);

        self.write(w, &child)?;
        self.write(w, &right)?;
        self.write(w, parent)
    }

    /// Removes the record comparing equal to `record`. Returns `false` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if node storage cannot be read, written or freed.
    pub fn delete(&self, w: &mut WriteLock<'_>, record: Address) -> Result<bool> {
        let root = self.root(w)?;
        if root.is_null() {
            return Ok(false);
        }

        let min = self.layout.min_records();
        let mut target = record;
        let mut node = self.read(w, root)?;

        for _ in 0..MAX_DEPTH {
            let (index, found) = self.search(w, &node, target)?;

            if node.is_leaf() {
                if !found {
                    return Ok(false);
                }
                node.records.remove(index);
                if node.records.is_empty() {
                    // Only the root may run empty.
                    self.set_root(w, Address::NULL)?;
                    self.free_node(w, node.address)?;
                } else {
                    self.write(w, &node)?;
                }
                return Ok(true);
            }

            if found {
                let left = self.read(w, node.children[index])?;
                if left.records.len() > min {
                    let predecessor = self.last_record(w, &left)?;
                    node.records[index] = predecessor;
                    self.write(w, &node)?;
                    target = predecessor;
                    node = left;
                    continue;
                }

                let right = self.read(w, node.children[index + 1])?;
                if right.records.len() > min {
                    let successor = self.first_record(w, &right)?;
                    node.records[index] = successor;
                    self.write(w, &node)?;
                    target = successor;
                    node = right;
                    continue;
                }

                node = self.merge_children(w, node, index, left, right)?;
                continue;
            }

            let child = self.read(w, node.children[index])?;
            node = if child.records.len() > min {
                child
            } else {
                self.top_up_child(w, node, index, child)?
            };
        }

        Err(Error::corrupted("B-tree deeper than any valid tree"))
    }

    /// Gives a minimal child an extra record by rotating one in from a sibling or
    /// merging with a sibling. Returns the node to descend into.
    fn top_up_child(
        &self,
        w: &mut WriteLock<'_>,
        mut parent: Node,
        index: usize,
        mut child: Node,
    ) -> Result<Node> {
        let min = self.layout.min_records();

        let left = if index > 0 { Some(self.read(w, parent.children[index - 1])?) } else { None };
        if let Some(mut left) = left.clone().filter(|l| l.records.len() > min) {
            let borrowed = left.records.pop().ok_or_else(|| Error::corrupted("Empty sibling"))?;
            child.records.insert(0, std::mem::replace(&mut parent.records[index - 1], borrowed));
            if !left.is_leaf() {
                let moved = left.children.pop().ok_or_else(|| Error::corrupted("Empty sibling"))?;
                child.children.insert(0, moved);
            }
            self.write(w, &left)?;
            self.write(w, &child)?;
            self.write(w, &parent)?;
            return Ok(child);
        }

        if index < parent.records.len() {
            let mut right = self.read(w, parent.children[index + 1])?;
            if right.records.len() > min {
                let borrowed = right.records.remove(0);
                child.records.push(std::mem::replace(&mut parent.records[index], borrowed));
                if !right.is_leaf() {
                    child.children.push(right.children.remove(0));
                }
                self.write(w, &right)?;
                self.write(w, &child)?;
                self.write(w, &parent)?;
                return Ok(child);
            }
            return self.merge_children(w, parent, index, child, right);
        }

        match left {
            Some(left) => self.merge_children(w, parent, index - 1, left, child),
            None => Err(Error::corrupted(format!(
                "B-tree node {} has a single child",
                parent.address
            ))),
        }
    }

    /// Merges `right` and the separator at `parent.records[index]` into `left`.
    /// Returns the merged node. Collapses the root if it runs empty.
    fn merge_children(
        &self,
        w: &mut WriteLock<'_>,
        mut parent: Node,
        index: usize,
        mut left: Node,
        right: Node,
    ) -> Result<Node> {
        left.records.push(parent.records.remove(index));
        left.records.extend(right.records);
        left.children.extend(right.children);
        parent.children.remove(index + 1);

        self.write(w, &left)?;
        self.free_node(w, right.address)?;

        if parent.records.is_empty() {
            if parent.address != self.root(w)? {
                return Err(Error::corrupted(format!(
                    "Non-root B-tree node {} ran empty",
                    parent.address
                )));
            }
            self.set_root(w, left.address)?;
            self.free_node(w, parent.address)?;
        } else {
            self.write(w, &parent)?;
        }
        Ok(left)
    }

    fn last_record(&self, db: &Database, node: &Node) -> Result<Address> {
        let mut current = node.clone();
        for _ in 0..MAX_DEPTH {
            match current.children.last() {
                Some(&child) => current = self.read(db, child)?,
                None => {
                    return current.records.last().copied().ok_or_else(|| {
                        Error::corrupted(format!("B-tree leaf {} is empty", current.address))
                    });
                },
            }
        }
        Err(Error::corrupted("B-tree deeper than any valid tree"))
    }

    fn first_record(&self, db: &Database, node: &Node) -> Result<Address> {
        let mut current = node.clone();
        for _ in 0..MAX_DEPTH {
            match current.children.first() {
                Some(&child) => current = self.read(db, child)?,
                None => {
                    return current.records.first().copied().ok_or_else(|| {
                        Error::corrupted(format!("B-tree leaf {} is empty", current.address))
                    });
                },
            }
        }
        Err(Error::corrupted("B-tree deeper than any valid tree"))
    }

    /// Walks the records the visitor selects, in order.
    ///
    /// Returns `false` if the visitor stopped the walk.
    ///
    /// # Errors
    ///
    /// Returns the first error from node reads or from the visitor.
    pub fn accept<V: BTreeVisitor + ?Sized>(&self, db: &Database, visitor: &mut V) -> Result<bool> {
        let root = self.root(db)?;
        self.accept_node(db, root, visitor, 0)
    }

    fn accept_node<V: BTreeVisitor + ?Sized>(
        &self,
        db: &Database,
        address: Address,
        visitor: &mut V,
        depth: usize,
    ) -> Result<bool> {
        if address.is_null() {
            return Ok(true);
        }
        if depth > MAX_DEPTH {
            return Err(Error::corrupted("B-tree deeper than any valid tree"));
        }

        let node = self.read(db, address)?;
        for (i, &record) in node.records.iter().enumerate() {
            match visitor.compare(db, record)? {
                Ordering::Less => {},
                Ordering::Greater => {
                    return match node.children.get(i) {
                        Some(&child) => self.accept_node(db, child, visitor, depth + 1),
                        None => Ok(true),
                    };
                },
                Ordering::Equal => {
                    if let Some(&child) = node.children.get(i) {
                        if !self.accept_node(db, child, visitor, depth + 1)? {
                            return Ok(false);
                        }
                    }
                    if !visitor.visit(db, record)? {
                        return Ok(false);
                    }
                },
            }
        }

        match node.children.last() {
            Some(&child) => self.accept_node(db, child, visitor, depth + 1),
            None => Ok(true),
        }
    }

    /// Returns the first record for which `compare` reports `Equal`.
    ///
    /// `compare` locates a candidate relative to the wanted key, as in
    /// [`BTreeVisitor::compare`].
    ///
    /// # Errors
    ///
    /// Returns the first error from node reads or from `compare`.
    pub fn find<F>(&self, db: &Database, compare: F) -> Result<Option<Address>>
    where
        F: FnMut(&Database, Address) -> Result<Ordering>,
    {
        struct FindFirst<F> {
            compare: F,
            found: Option<Address>,
        }

        impl<F> BTreeVisitor for FindFirst<F>
        where
            F: FnMut(&Database, Address) -> Result<Ordering>,
        {
            fn compare(&mut self, db: &Database, candidate: Address) -> Result<Ordering> {
                (self.compare)(db, candidate)
            }

            fn visit(&mut self, _db: &Database, record: Address) -> Result<bool> {
                self.found = Some(record);
                Ok(false)
            }
        }

        let mut visitor = FindFirst { compare, found: None };
        self.accept(db, &mut visitor)?;
        Ok(visitor.found)
    }

    /// Returns every record in order.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be read.
    pub fn collect(&self, db: &Database) -> Result<Vec<Address>> {
        struct All(Vec<Address>);

        impl BTreeVisitor for All {
            fn compare(&mut self, _db: &Database, _candidate: Address) -> Result<Ordering> {
                Ok(Ordering::Equal)
            }

            fn visit(&mut self, _db: &Database, record: Address) -> Result<bool> {
                self.0.push(record);
                Ok(true)
            }
        }

        let mut all = All(Vec::new());
        self.accept(db, &mut all)?;
        Ok(all.0)
    }

    /// Returns the number of records.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be read.
    pub fn len(&self, db: &Database) -> Result<usize> {
        Ok(self.collect(db)?.len())
    }

    /// Frees every node and empties the tree. The records themselves are untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be read or freed.
    pub fn destruct(&self, w: &mut WriteLock<'_>) -> Result<()> {
        let root = self.root(w)?;
        self.destruct_node(w, root, 0)?;
        self.set_root(w, Address::NULL)
    }

    fn destruct_node(&self, w: &mut WriteLock<'_>, address: Address, depth: usize) -> Result<()> {
        if address.is_null() {
            return Ok(());
        }
        if depth > MAX_DEPTH {
            return Err(Error::corrupted("B-tree deeper than any valid tree"));
        }
        let node = self.read(w, address)?;
        for &child in &node.children {
            self.destruct_node(w, child, depth + 1)?;
        }
        self.free_node(w, address)
    }

    /// Checks ordering, fill and balance of the whole tree.
    ///
    /// Returns a human-readable list of violations, one per line; an empty string
    /// means the tree is sound.
    ///
    /// # Errors
    ///
    /// Returns an error only if the root slot cannot be read or a comparison fails.
    pub fn invariants_report(&self, db: &Database) -> Result<String> {
        let mut problems = Vec::new();
        let root = self.root(db)?;
        if !root.is_null() {
            let mut leaf_depth = None;
            self.check_node(db, root, 0, None, None, &mut leaf_depth, &mut problems)?;
        }
        Ok(problems.join("\n"))
    }

    #[allow(clippy::too_many_arguments)]
    fn check_node(
        &self,
        db: &Database,
        address: Address,
        depth: usize,
        lower: Option<Address>,
        upper: Option<Address>,
        leaf_depth: &mut Option<usize>,
        problems: &mut Vec<String>,
    ) -> Result<()> {
        if depth > MAX_DEPTH {
            problems.push(format!("Node {address} is deeper than {MAX_DEPTH} levels"));
            return Ok(());
        }
        let node = match self.read(db, address) {
            Ok(node) => node,
            Err(e) => {
                problems.push(format!("Node {address} is unreadable: {e}"));
                return Ok(());
            },
        };

        let count = node.records.len();
        if depth == 0 {
            if count == 0 {
                problems.push(format!("Root {address} has no records"));
            }
        } else if count < self.layout.min_records() {
            problems.push(format!(
                "Node {address} has {count} records, fewer than the minimum {}",
                self.layout.min_records()
            ));
        }

        for pair in node.records.windows(2) {
            if self.comparator.compare(db, pair[0], pair[1])? != Ordering::Less {
                problems.push(format!(
                    "Node {address}: record {} does not sort before {}",
                    pair[0], pair[1]
                ));
            }
        }
        if let (Some(lower), Some(&first)) = (lower, node.records.first()) {
            if self.comparator.compare(db, lower, first)? != Ordering::Less {
                problems.push(format!("Node {address}: record {first} is not above separator {lower}"));
            }
        }
        if let (Some(upper), Some(&last)) = (upper, node.records.last()) {
            if self.comparator.compare(db, last, upper)? != Ordering::Less {
                problems.push(format!("Node {address}: record {last} is not below separator {upper}"));
            }
        }

        if node.is_leaf() {
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if expected != depth => problems.push(format!(
                    "Leaf {address} is at depth {depth}, other leaves at depth {expected}"
                )),
                Some(_) => {},
            }
            return Ok(());
        }

        for (i, &child) in node.children.iter().enumerate() {
            let child_lower = if i == 0 { lower } else { Some(node.records[i - 1]) };
            let child_upper = node.records.get(i).copied().or(upper);
            self.check_node(db, child, depth + 1, child_lower, child_upper, leaf_depth, problems)?;
        }
        Ok(())
    }
}
