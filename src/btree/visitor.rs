use std::cmp::Ordering;

use crate::db::{
    error::Result,
    ptr::{Ptr, Void},
    Database,
};

/// Walks (part of) a [`BTree`](super::BTree).
///
/// `compare` places a record relative to the key the visitor is looking for:
/// `Less` if the record sorts before it, `Equal` if it matches, `Greater` if it sorts after.
/// Matches must form one contiguous run in the tree's order (an exact key, a prefix,
/// a range), which lets the traversal skip everything outside of it.
pub trait Visitor {
    fn compare(&mut self, db: &Database, record: Ptr<Void>) -> Result<Ordering>;
    /// called for every match, in order. return `false` to stop the traversal
    fn visit(&mut self, db: &Database, record: Ptr<Void>) -> Result<bool>;
}

/// visitor built from a pair of closures
pub struct FnVisitor<C, V> {
    compare: C,
    visit: V,
}

pub fn visitor<C, V>(compare: C, visit: V) -> FnVisitor<C, V>
where
    C: FnMut(&Database, Ptr<Void>) -> Result<Ordering>,
    V: FnMut(&Database, Ptr<Void>) -> Result<bool>,
{
    FnVisitor { compare, visit }
}

impl<C, V> Visitor for FnVisitor<C, V>
where
    C: FnMut(&Database, Ptr<Void>) -> Result<Ordering>,
    V: FnMut(&Database, Ptr<Void>) -> Result<bool>,
{
    fn compare(&mut self, db: &Database, record: Ptr<Void>) -> Result<Ordering> {
        (self.compare)(db, record)
    }

    fn visit(&mut self, db: &Database, record: Ptr<Void>) -> Result<bool> {
        (self.visit)(db, record)
    }
}

/// matches every record
#[derive(Debug, Default)]
pub struct CollectAll {
    pub records: Vec<Ptr<Void>>,
}

impl Visitor for CollectAll {
    fn compare(&mut self, _db: &Database, _record: Ptr<Void>) -> Result<Ordering> {
        Ok(Ordering::Equal)
    }

    fn visit(&mut self, _db: &Database, record: Ptr<Void>) -> Result<bool> {
        self.records.push(record);
        Ok(true)
    }
}

/// stops at the first match
pub struct FindFirst<C> {
    compare: C,
    pub found: Option<Ptr<Void>>,
}

impl<C> FindFirst<C>
where
    C: FnMut(&Database, Ptr<Void>) -> Result<Ordering>,
{
    pub fn new(compare: C) -> Self {
        Self {
            compare,
            found: None,
        }
    }
}

impl<C> Visitor for FindFirst<C>
where
    C: FnMut(&Database, Ptr<Void>) -> Result<Ordering>,
{
    fn compare(&mut self, db: &Database, record: Ptr<Void>) -> Result<Ordering> {
        (self.compare)(db, record)
    }

    fn visit(&mut self, _db: &Database, record: Ptr<Void>) -> Result<bool> {
        self.found = Some(record);
        Ok(false)
    }
}
