use std::{cmp::Ordering, sync::Arc};

use super::{Destructable, Field};
use crate::{
    btree::{visitor, BTree, Comparator},
    db::{
        error::Result,
        ptr::{Ptr, Void},
        Database, DbString,
    },
};

/// Handle of a string stored in the database. Null while unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldString {
    offset: u32,
}

impl FieldString {
    pub const fn new() -> Self {
        Self { offset: 0 }
    }

    pub fn handle(&self, db: &Database, record: Ptr<Void>) -> Result<Ptr<DbString>> {
        db.get_ptr(self.at(record))
    }

    /// `None` if the field was never set
    pub fn get(&self, db: &Database, record: Ptr<Void>) -> Result<Option<String>> {
        match self.handle(db, record)?.non_null() {
            Some(handle) => Ok(Some(db.get_string(handle)?)),
            None => Ok(None),
        }
    }

    /// store `value`, releasing the previous string
    pub fn put(&self, db: &mut Database, record: Ptr<Void>, value: &str) -> Result<()> {
        let new = db.new_string(value)?;
        let old = self.handle(db, record)?;
        db.put_ptr(self.at(record), new)?;
        if !old.is_null() {
            db.free_string(old)?;
        }
        Ok(())
    }

    pub fn clear(&self, db: &mut Database, record: Ptr<Void>) -> Result<()> {
        let old = self.handle(db, record)?;
        if !old.is_null() {
            db.put_ptr(self.at(record), Ptr::<DbString>::null())?;
            db.free_string(old)?;
        }
        Ok(())
    }
}

impl Field for FieldString {
    const KIND: &'static str = "string";

    fn width(&self) -> u32 {
        8
    }

    fn offset(&self) -> u32 {
        self.offset
    }

    fn set_offset(&mut self, offset: u32) {
        self.offset = offset;
    }

    fn destructor(&self) -> Option<Arc<dyn Destructable>> {
        Some(Arc::new(*self))
    }
}

impl Destructable for FieldString {
    fn destruct(&self, db: &mut Database, record: Ptr<Void>) -> Result<()> {
        self.clear(db, record)
    }
}

/// Orders search keys: case-insensitive first, ties broken by the exact bytes.
fn key_cmp(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

/// Comparator over the string stored at `offset` of each record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyOrder {
    field: FieldString,
}

impl KeyOrder {
    fn key(&self, db: &Database, record: Ptr<Void>) -> Result<String> {
        Ok(self.field.get(db, record)?.unwrap_or_default())
    }
}

impl Comparator for KeyOrder {
    fn compare(&self, db: &Database, a: Ptr<Void>, b: Ptr<Void>) -> Result<Ordering> {
        Ok(key_cmp(&self.key(db, a)?, &self.key(db, b)?))
    }
}

/// A string field that is also the key of an index over every record holding it.
///
/// The index root lives in a fixed slot (usually one of the database roots), so all
/// records of the shape share one index. Keys are unique within the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSearchKey {
    string: FieldString,
    root_slot: Ptr<Void>,
}

impl FieldSearchKey {
    pub const fn new(root_slot: Ptr<Void>) -> Self {
        Self {
            string: FieldString::new(),
            root_slot,
        }
    }

    /// the index over this key
    pub fn index(&self) -> BTree<KeyOrder> {
        BTree::new(self.root_slot, KeyOrder { field: self.string })
    }

    pub fn get(&self, db: &Database, record: Ptr<Void>) -> Result<Option<String>> {
        self.string.get(db, record)
    }

    /// Set the key of `record` and (re)index it.
    ///
    /// Returns the record now indexed under `key`. If another record already held an
    /// equal key, that one is returned and `record` stays out of the index.
    pub fn put(&self, db: &mut Database, record: Ptr<Void>, key: &str) -> Result<Ptr<Void>> {
        self.unindex(db, record)?;
        self.string.put(db, record, key)?;
        let indexed = self.index().insert(db, record)?;
        if indexed != record {
            debug!("key {key:?} is already held by {indexed:?}, {record:?} is not indexed");
        }
        Ok(indexed)
    }

    /// remove `record` from the index, if it is the one indexed under its key
    fn unindex(&self, db: &mut Database, record: Ptr<Void>) -> Result<()> {
        let Some(key) = self.string.get(db, record)? else {
            return Ok(());
        };
        if self.find(db, &key)? == Some(record) {
            self.index().delete(db, record)?;
        }
        Ok(())
    }

    /// the record with exactly this key
    pub fn find(&self, db: &Database, key: &str) -> Result<Option<Ptr<Void>>> {
        let order = KeyOrder { field: self.string };
        self.index()
            .find(db, |db, record| Ok(key_cmp(&order.key(db, record)?, key)))
    }

    /// Visit every record whose key starts with `prefix`, in key order.
    ///
    /// The callback gets the record and its key, and returns `false` to stop.
    /// Returns whether every match was visited.
    pub fn visit_prefix<F>(
        &self,
        db: &Database,
        prefix: &str,
        case_sensitive: bool,
        mut f: F,
    ) -> Result<bool>
    where
        F: FnMut(Ptr<Void>, &str) -> Result<bool>,
    {
        let order = KeyOrder { field: self.string };
        let folded = prefix.to_lowercase();
        // the walk itself is always case-insensitive, exact matching filters on top
        self.index().accept(
            db,
            &mut visitor::visitor(
                |db, record| {
                    let key = order.key(db, record)?.to_lowercase();
                    Ok(if key.starts_with(&folded) {
                        Ordering::Equal
                    } else {
                        key.cmp(&folded)
                    })
                },
                |db, record| {
                    let key = order.key(db, record)?;
                    if case_sensitive && !key.starts_with(prefix) {
                        return Ok(true);
                    }
                    f(record, &key)
                },
            ),
        )
    }
}

impl Field for FieldSearchKey {
    const KIND: &'static str = "search key";

    fn width(&self) -> u32 {
        self.string.width()
    }

    fn offset(&self) -> u32 {
        self.string.offset()
    }

    fn set_offset(&mut self, offset: u32) {
        self.string.set_offset(offset);
    }

    fn destructor(&self) -> Option<Arc<dyn Destructable>> {
        Some(Arc::new(*self))
    }
}

impl Destructable for FieldSearchKey {
    fn destruct(&self, db: &mut Database, record: Ptr<Void>) -> Result<()> {
        self.unindex(db, record)?;
        self.string.clear(db, record)
    }
}

/// Root slot of a tree owned by the record
pub struct FieldBTree<C> {
    offset: u32,
    cmp: C,
}

impl<C: Comparator + Copy> FieldBTree<C> {
    pub const fn new(cmp: C) -> Self {
        Self { offset: 0, cmp }
    }

    /// the tree rooted in `record`
    pub fn tree(&self, record: Ptr<Void>) -> BTree<C> {
        BTree::new(record.field(self.offset), self.cmp)
    }
}

impl<C: Copy> Clone for FieldBTree<C> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<C: Copy> Copy for FieldBTree<C> {}

impl<C> std::fmt::Debug for FieldBTree<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldBTree")
            .field("offset", &self.offset)
            .finish()
    }
}

impl<C> Field for FieldBTree<C>
where
    C: Comparator + Copy + Send + Sync + 'static,
{
    const KIND: &'static str = "btree";

    fn width(&self) -> u32 {
        8
    }

    fn offset(&self) -> u32 {
        self.offset
    }

    fn set_offset(&mut self, offset: u32) {
        self.offset = offset;
    }

    fn destructor(&self) -> Option<Arc<dyn Destructable>> {
        Some(Arc::new(*self))
    }
}

impl<C> Destructable for FieldBTree<C>
where
    C: Comparator + Copy + Send + Sync + 'static,
{
    /// frees the nodes, the records they point to are left alone
    fn destruct(&self, db: &mut Database, record: Ptr<Void>) -> Result<()> {
        self.tree(record).destroy(db)
    }
}
