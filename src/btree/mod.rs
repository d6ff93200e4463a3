//! # BTree
//!
//! An ordered index over records stored in the [`Database`].
//!
//! The tree only stores record addresses, the order between them is defined by a
//! [`Comparator`] that looks at the records themselves. Two records the comparator
//! considers `Equal` are the same entry: inserting the second one returns the first.
//!
//! The tree lives entirely in the database: a pointer sized root slot (inside some
//! record, or one of the database root slots) and one chunk per node.
//!
//! Insertion splits full nodes on the way down, and deletion makes sure every node it
//! descends into can spare a record (borrowing from a sibling or merging with it), so
//! neither ever has to walk back up.

use std::{cmp::Ordering, mem::size_of};

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::db::{
    error::{DbError, Result},
    ptr::{Ptr, Void},
    Database,
};

pub mod visitor;

pub use visitor::Visitor;

/// minimum degree of the tree
pub const DEGREE: usize = 8;
pub const MAX_RECORDS: usize = 2 * DEGREE - 1;
pub const MAX_CHILDREN: usize = 2 * DEGREE;
/// fewest records a node other than the root may hold
const MIN_RECORDS: usize = DEGREE - 1;

/// Defines the order of the records in a tree
pub trait Comparator {
    fn compare(&self, db: &Database, a: Ptr<Void>, b: Ptr<Void>) -> Result<Ordering>;
}

impl<F> Comparator for F
where
    F: Fn(&Database, Ptr<Void>, Ptr<Void>) -> Result<Ordering>,
{
    fn compare(&self, db: &Database, a: Ptr<Void>, b: Ptr<Void>) -> Result<Ordering> {
        self(db, a, b)
    }
}

/// on-disk form of a node. unused record slots are null, and the first null
/// record ends the list. leaves have no children at all
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
struct Node {
    records: [Ptr<Void>; MAX_RECORDS],
    children: [Ptr<Node>; MAX_CHILDREN],
}

static_assertions::const_assert_eq!(size_of::<Node>(), 8 * (MAX_RECORDS + MAX_CHILDREN));

/// a node, loaded for modification
#[derive(Debug, Clone, Default)]
struct NodeBuf {
    records: Vec<Ptr<Void>>,
    /// empty for leaves, `records.len() + 1` entries otherwise
    children: Vec<Ptr<Node>>,
}

impl NodeBuf {
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn is_full(&self) -> bool {
        self.records.len() == MAX_RECORDS
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BTree<C> {
    root_slot: Ptr<Void>,
    cmp: C,
}

impl<C: Comparator> BTree<C> {
    /// A tree whose root node address is stored at `root_slot`.
    ///
    /// A null root slot is an empty tree, so a freshly zeroed slot needs no setup.
    pub fn new(root_slot: Ptr<Void>, cmp: C) -> Self {
        Self { root_slot, cmp }
    }

    pub fn root_slot(&self) -> Ptr<Void> {
        self.root_slot
    }

    fn root(&self, db: &Database) -> Result<Ptr<Node>> {
        db.get_ptr(self.root_slot)
    }

    fn load(db: &Database, ptr: Ptr<Node>) -> Result<NodeBuf> {
        let node = db.read_typed(ptr)?;
        let len = node
            .records
            .iter()
            .position(|r| r.is_null())
            .unwrap_or(MAX_RECORDS);
        let children = if node.children[0].is_null() {
            vec![]
        } else {
            node.children[..=len].to_vec()
        };
        if children.iter().any(|c| c.is_null()) {
            error!("corrupt data: btree node {ptr:?} is missing a child");
            return Err(DbError::Corrupt("btree node is missing a child"));
        }
        Ok(NodeBuf {
            records: node.records[..len].to_vec(),
            children,
        })
    }

    fn store(db: &mut Database, ptr: Ptr<Node>, buf: &NodeBuf) -> Result<()> {
        debug_assert!(buf.records.len() <= MAX_RECORDS);
        debug_assert!(buf.is_leaf() || buf.children.len() == buf.records.len() + 1);
        let mut node = Node::new_zeroed();
        node.records[..buf.records.len()].copy_from_slice(&buf.records);
        node.children[..buf.children.len()].copy_from_slice(&buf.children);
        db.write_typed(ptr, &node)
    }

    fn alloc_node(db: &mut Database, buf: &NodeBuf) -> Result<Ptr<Node>> {
        let ptr = db.malloc(size_of::<Node>() as u32)?.cast();
        Self::store(db, ptr, buf)?;
        Ok(ptr)
    }

    /// position of `record` in `records`, or where it would have to go
    fn search(&self, db: &Database, records: &[Ptr<Void>], record: Ptr<Void>) -> Result<(usize, bool)> {
        let (mut lo, mut hi) = (0, records.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.cmp.compare(db, records[mid], record)? {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok((mid, true)),
            }
        }
        Ok((lo, false))
    }

    /// Insert `record`.
    ///
    /// If the tree already contains an equal record, nothing is inserted and that
    /// record is returned instead. Otherwise `record` itself is returned.
    #[instrument(level = "trace", skip(self, db))]
    pub fn insert(&self, db: &mut Database, record: Ptr<Void>) -> Result<Ptr<Void>> {
        if record.is_null() {
            return Err(DbError::PointerInvalid(record));
        }
        let mut node_ptr = self.root(db)?;
        if node_ptr.is_null() {
            let root = Self::alloc_node(
                db,
                &NodeBuf {
                    records: vec![record],
                    children: vec![],
                },
            )?;
            db.put_ptr(self.root_slot, root)?;
            return Ok(record);
        }
        if Self::load(db, node_ptr)?.is_full() {
            trace!("splitting root {node_ptr:?}");
            let mut new_root = NodeBuf {
                records: vec![],
                children: vec![node_ptr],
            };
            let new_root_ptr = Self::alloc_node(db, &new_root)?;
            self.split_child(db, new_root_ptr, &mut new_root, 0)?;
            db.put_ptr(self.root_slot, new_root_ptr)?;
            node_ptr = new_root_ptr;
        }
        loop {
            let mut node = Self::load(db, node_ptr)?;
            let (mut idx, found) = self.search(db, &node.records, record)?;
            if found {
                return Ok(node.records[idx]);
            }
            if node.is_leaf() {
                node.records.insert(idx, record);
                Self::store(db, node_ptr, &node)?;
                return Ok(record);
            }
            if Self::load(db, node.children[idx])?.is_full() {
                self.split_child(db, node_ptr, &mut node, idx)?;
                // the median moved up into `idx`
                match self.cmp.compare(db, node.records[idx], record)? {
                    Ordering::Equal => return Ok(node.records[idx]),
                    Ordering::Less => idx += 1,
                    Ordering::Greater => {}
                }
            }
            node_ptr = node.children[idx];
        }
    }

    /// split the full child `idx` of `parent` in two, moving its median up
    fn split_child(
        &self,
        db: &mut Database,
        parent_ptr: Ptr<Node>,
        parent: &mut NodeBuf,
        idx: usize,
    ) -> Result<()> {
        let child_ptr = parent.children[idx];
        let mut child = Self::load(db, child_ptr)?;
        debug_assert!(child.is_full());
        let right = NodeBuf {
            records: child.records.split_off(DEGREE),
            children: if child.is_leaf() {
                vec![]
            } else {
                child.children.split_off(DEGREE)
            },
        };
        let Some(median) = child.records.pop() else {
            return Err(DbError::Corrupt("split of an empty btree node"));
        };
        // new node first, then the parent, and only then drop the moved records from
        // the child. an interruption leaves duplicates behind, never lost records
        let right_ptr = Self::alloc_node(db, &right)?;
        parent.records.insert(idx, median);
        parent.children.insert(idx + 1, right_ptr);
        Self::store(db, parent_ptr, parent)?;
        Self::store(db, child_ptr, &child)
    }

    /// Remove the entry equal to `record`. Returns whether there was one.
    #[instrument(level = "trace", skip(self, db))]
    pub fn delete(&self, db: &mut Database, record: Ptr<Void>) -> Result<bool> {
        let root_ptr = self.root(db)?;
        if root_ptr.is_null() {
            return Ok(false);
        }
        let found = self.delete_from(db, root_ptr, record);
        // a merge below the root can leave it empty even when the delete failed later on
        let root = Self::load(db, root_ptr)?;
        if root.records.is_empty() {
            let new_root = root.children.first().copied().unwrap_or(Ptr::null());
            trace!("collapsing root {root_ptr:?} into {new_root:?}");
            db.put_ptr(self.root_slot, new_root)?;
            db.free(root_ptr)?;
        }
        found
    }

    fn delete_from(&self, db: &mut Database, node_ptr: Ptr<Node>, record: Ptr<Void>) -> Result<bool> {
        let mut node = Self::load(db, node_ptr)?;
        let (idx, found) = self.search(db, &node.records, record)?;
        if node.is_leaf() {
            if found {
                node.records.remove(idx);
                Self::store(db, node_ptr, &node)?;
            }
            return Ok(found);
        }
        if !found {
            let idx = self.fill_child(db, node_ptr, &mut node, idx)?;
            return self.delete_from(db, node.children[idx], record);
        }
        let (left_ptr, right_ptr) = (node.children[idx], node.children[idx + 1]);
        // the replacement leaves its subtree before it takes the place of `record`, so
        // a failing comparison on the way down leaves the tree as it was
        if Self::load(db, left_ptr)?.records.len() > MIN_RECORDS {
            let pred = Self::last_record(db, left_ptr)?;
            self.replace_with(db, node_ptr, &mut node, idx, left_ptr, pred)?;
            return Ok(true);
        }
        if Self::load(db, right_ptr)?.records.len() > MIN_RECORDS {
            let succ = Self::first_record(db, right_ptr)?;
            self.replace_with(db, node_ptr, &mut node, idx, right_ptr, succ)?;
            return Ok(true);
        }
        self.merge_children(db, node_ptr, &mut node, idx)?;
        self.delete_from(db, left_ptr, record)
    }

    /// move `with` out of the subtree at `from` into record slot `idx` of `node`
    fn replace_with(
        &self,
        db: &mut Database,
        node_ptr: Ptr<Node>,
        node: &mut NodeBuf,
        idx: usize,
        from: Ptr<Node>,
        with: Ptr<Void>,
    ) -> Result<()> {
        if !self.delete_from(db, from, with)? {
            error!("btree record {with:?} could not be found in its own subtree");
            return Err(DbError::Corrupt("btree record missing from its subtree"));
        }
        node.records[idx] = with;
        Self::store(db, node_ptr, node)
    }

    /// Make sure child `idx` of `node` holds more than the minimum number of records,
    /// so that one can be removed from it. Returns the index of the child that now
    /// covers the range the original child did.
    fn fill_child(
        &self,
        db: &mut Database,
        node_ptr: Ptr<Node>,
        node: &mut NodeBuf,
        idx: usize,
    ) -> Result<usize> {
        let child_ptr = node.children[idx];
        let mut child = Self::load(db, child_ptr)?;
        if child.records.len() > MIN_RECORDS {
            return Ok(idx);
        }
        if idx > 0 {
            let left_ptr = node.children[idx - 1];
            let mut left = Self::load(db, left_ptr)?;
            if left.records.len() > MIN_RECORDS {
                // rotate right through the separator
                let (Some(moved), last_child) = (left.records.pop(), left.children.pop()) else {
                    return Err(DbError::Corrupt("btree sibling lost its records"));
                };
                child.records.insert(0, node.records[idx - 1]);
                node.records[idx - 1] = moved;
                if let Some(c) = last_child {
                    child.children.insert(0, c);
                }
                Self::store(db, child_ptr, &child)?;
                Self::store(db, node_ptr, node)?;
                Self::store(db, left_ptr, &left)?;
                return Ok(idx);
            }
        }
        if idx < node.records.len() {
            let right_ptr = node.children[idx + 1];
            let mut right = Self::load(db, right_ptr)?;
            if right.records.len() > MIN_RECORDS {
                // rotate left through the separator
                child.records.push(node.records[idx]);
                node.records[idx] = right.records.remove(0);
                if !right.is_leaf() {
                    child.children.push(right.children.remove(0));
                }
                Self::store(db, child_ptr, &child)?;
                Self::store(db, node_ptr, node)?;
                Self::store(db, right_ptr, &right)?;
                return Ok(idx);
            }
            self.merge_children(db, node_ptr, node, idx)?;
            Ok(idx)
        } else {
            self.merge_children(db, node_ptr, node, idx - 1)?;
            Ok(idx - 1)
        }
    }

    /// merge child `idx + 1` and the separator between them into child `idx`
    fn merge_children(
        &self,
        db: &mut Database,
        node_ptr: Ptr<Node>,
        node: &mut NodeBuf,
        idx: usize,
    ) -> Result<()> {
        let (left_ptr, right_ptr) = (node.children[idx], node.children[idx + 1]);
        let mut left = Self::load(db, left_ptr)?;
        let right = Self::load(db, right_ptr)?;
        left.records.push(node.records.remove(idx));
        left.records.extend(right.records);
        left.children.extend(right.children);
        node.children.remove(idx + 1);
        Self::store(db, left_ptr, &left)?;
        Self::store(db, node_ptr, node)?;
        db.free(right_ptr)
    }

    fn last_record(db: &Database, mut ptr: Ptr<Node>) -> Result<Ptr<Void>> {
        loop {
            let node = Self::load(db, ptr)?;
            match node.children.last() {
                Some(&child) => ptr = child,
                None => {
                    return node
                        .records
                        .last()
                        .copied()
                        .ok_or(DbError::Corrupt("empty btree leaf"))
                }
            }
        }
    }

    fn first_record(db: &Database, mut ptr: Ptr<Node>) -> Result<Ptr<Void>> {
        loop {
            let node = Self::load(db, ptr)?;
            match node.children.first() {
                Some(&child) => ptr = child,
                None => {
                    return node
                        .records
                        .first()
                        .copied()
                        .ok_or(DbError::Corrupt("empty btree leaf"))
                }
            }
        }
    }

    /// Walk the records matching `visitor`, in order.
    ///
    /// Returns `false` if the visitor stopped the traversal early.
    pub fn accept<V: Visitor + ?Sized>(&self, db: &Database, visitor: &mut V) -> Result<bool> {
        let root = self.root(db)?;
        if root.is_null() {
            return Ok(true);
        }
        Ok(self.accept_node(db, root, visitor)? != Walk::Stopped)
    }

    fn accept_node<V: Visitor + ?Sized>(
        &self,
        db: &Database,
        ptr: Ptr<Node>,
        visitor: &mut V,
    ) -> Result<Walk> {
        let node = Self::load(db, ptr)?;
        // skip everything sorting before the key
        let (mut lo, mut hi) = (0, node.records.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if visitor.compare(db, node.records[mid])? == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        for i in lo..=node.records.len() {
            if let Some(&child) = node.children.get(i) {
                match self.accept_node(db, child, visitor)? {
                    Walk::Continue => {}
                    done => return Ok(done),
                }
            }
            let Some(&record) = node.records.get(i) else {
                break;
            };
            match visitor.compare(db, record)? {
                Ordering::Less => {}
                Ordering::Equal => {
                    if !visitor.visit(db, record)? {
                        return Ok(Walk::Stopped);
                    }
                }
                Ordering::Greater => return Ok(Walk::PastEnd),
            }
        }
        Ok(Walk::Continue)
    }

    /// First record the visitor's comparison considers `Equal`
    pub fn find<F>(&self, db: &Database, compare: F) -> Result<Option<Ptr<Void>>>
    where
        F: FnMut(&Database, Ptr<Void>) -> Result<Ordering>,
    {
        let mut finder = visitor::FindFirst::new(compare);
        self.accept(db, &mut finder)?;
        Ok(finder.found)
    }

    /// every record, in order
    pub fn records(&self, db: &Database) -> Result<Vec<Ptr<Void>>> {
        let mut all = visitor::CollectAll::default();
        self.accept(db, &mut all)?;
        Ok(all.records)
    }

    pub fn is_empty(&self, db: &Database) -> Result<bool> {
        Ok(self.root(db)?.is_null())
    }

    /// Free every node of the tree and clear the root slot.
    ///
    /// The records themselves are left alone.
    #[instrument(level = "debug", skip(self, db))]
    pub fn destroy(&self, db: &mut Database) -> Result<()> {
        let root = self.root(db)?;
        if !root.is_null() {
            Self::destroy_node(db, root)?;
        }
        db.put_ptr(self.root_slot, Ptr::<Node>::null())
    }

    fn destroy_node(db: &mut Database, ptr: Ptr<Node>) -> Result<()> {
        let node = Self::load(db, ptr)?;
        for child in node.children {
            Self::destroy_node(db, child)?;
        }
        db.free(ptr)
    }

    /// Check the structure of the tree: record order, node occupancy and equal leaf
    /// depth. Returns the number of records.
    pub fn check(&self, db: &Database) -> Result<usize> {
        let root = self.root(db)?;
        if root.is_null() {
            return Ok(0);
        }
        let mut leaf_depth = None;
        self.check_node(db, root, 0, true, (None, None), &mut leaf_depth)
    }

    fn check_node(
        &self,
        db: &Database,
        ptr: Ptr<Node>,
        depth: usize,
        is_root: bool,
        (lower, upper): (Option<Ptr<Void>>, Option<Ptr<Void>>),
        leaf_depth: &mut Option<usize>,
    ) -> Result<usize> {
        let node = Self::load(db, ptr)?;
        let bad = |what: &'static str| {
            error!("btree node {ptr:?} is invalid: {what}");
            Err(DbError::Corrupt(what))
        };
        if node.records.is_empty() || (!is_root && node.records.len() < MIN_RECORDS) {
            return bad("node is under-full");
        }
        let bounded = lower.into_iter().chain(node.records.iter().copied()).chain(upper);
        let mut prev: Option<Ptr<Void>> = None;
        for record in bounded {
            if let Some(prev) = prev {
                if self.cmp.compare(db, prev, record)? != Ordering::Less {
                    return bad("records out of order");
                }
            }
            prev = Some(record);
        }
        if node.is_leaf() {
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(d) if d != depth => return bad("leaves at different depths"),
                Some(_) => {}
            }
            return Ok(node.records.len());
        }
        let mut count = node.records.len();
        for (i, &child) in node.children.iter().enumerate() {
            let lo = if i == 0 { lower } else { Some(node.records[i - 1]) };
            let hi = node.records.get(i).copied().or(upper);
            count += self.check_node(db, child, depth + 1, false, (lo, hi), leaf_depth)?;
        }
        Ok(count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Walk {
    Continue,
    /// passed the last possible match
    PastEnd,
    /// the visitor asked to stop
    Stopped,
}
