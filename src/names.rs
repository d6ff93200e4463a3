//! Name → location index, the record shape the CLI works with.

use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};

use crate::{
    db::{
        self,
        ptr::{Ptr, Void},
        Database,
    },
    field::{FieldInt, FieldSearchKey, FieldString, StructBuilder, StructDef},
    job::{Job, JobStatus, ProgressMonitor},
};

/// database root slot holding the index
pub const ROOT: usize = 0;
/// job family of index updates
pub const FAMILY: &str = "index";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub location: String,
    pub line: i32,
}

/// Record layout: `{ name: search key, location: string, line: int }`
#[derive(Debug, Clone)]
pub struct NameIndex {
    shape: StructDef,
    name: FieldSearchKey,
    location: FieldString,
    line: FieldInt,
}

impl NameIndex {
    pub fn new(db: &Database) -> db::error::Result<Self> {
        let mut shape = StructBuilder::new();
        let name = shape.add(FieldSearchKey::new(db.root_slot(ROOT)?));
        let location = shape.add(FieldString::new());
        let line = shape.add(FieldInt::new());
        Ok(Self {
            shape: shape.seal(),
            name,
            location,
            line,
        })
    }

    /// Add `entry`, or update the location of an existing entry with the same name
    pub fn add(&self, db: &mut Database, entry: &Entry) -> db::error::Result<Ptr<Void>> {
        if let Some(existing) = self.name.find(db, &entry.name)? {
            self.location.put(db, existing, &entry.location)?;
            self.line.put(db, existing, entry.line)?;
            return Ok(existing);
        }
        let record = self.shape.alloc(db)?;
        if let Err(e) = self.fill(db, record, entry) {
            if let Err(cleanup) = self.shape.destruct(db, record) {
                warn!("failed to release partially written record {record:?}: {cleanup}");
            }
            return Err(e);
        }
        Ok(record)
    }

    fn fill(&self, db: &mut Database, record: Ptr<Void>, entry: &Entry) -> db::error::Result<()> {
        self.location.put(db, record, &entry.location)?;
        self.line.put(db, record, entry.line)?;
        self.name.put(db, record, &entry.name)?;
        Ok(())
    }

    pub fn remove(&self, db: &mut Database, name: &str) -> db::error::Result<bool> {
        match self.name.find(db, name)? {
            Some(record) => {
                self.shape.destruct(db, record)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn read(&self, db: &Database, record: Ptr<Void>, name: String) -> db::error::Result<Entry> {
        Ok(Entry {
            name,
            location: self.location.get(db, record)?.unwrap_or_default(),
            line: self.line.get(db, record)?,
        })
    }

    pub fn get(&self, db: &Database, name: &str) -> db::error::Result<Option<Entry>> {
        match self.name.find(db, name)? {
            Some(record) => Ok(Some(self.read(db, record, name.to_owned())?)),
            None => Ok(None),
        }
    }

    /// Entries whose name starts with `prefix`, in name order. At most `limit` of them.
    pub fn find_prefix(
        &self,
        db: &Database,
        prefix: &str,
        case_sensitive: bool,
        limit: Option<usize>,
    ) -> db::error::Result<Vec<Entry>> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut found = vec![];
        if limit == 0 {
            return Ok(found);
        }
        self.name
            .visit_prefix(db, prefix, case_sensitive, |record, name| {
                found.push(self.read(db, record, name.to_owned())?);
                Ok(found.len() < limit)
            })?;
        Ok(found)
    }

    pub fn len(&self, db: &Database) -> db::error::Result<usize> {
        Ok(self.name.index().records(db)?.len())
    }

    pub fn is_empty(&self, db: &Database) -> db::error::Result<bool> {
        self.name.index().is_empty(db)
    }

    /// Remove every entry
    pub fn clear(&self, db: &mut Database) -> db::error::Result<usize> {
        let records = self.name.index().records(db)?;
        for &record in &records {
            self.shape.destruct(db, record)?;
        }
        Ok(records.len())
    }

    /// size of one record
    pub fn record_size(&self) -> u32 {
        self.shape.record_size()
    }
}

pub(crate) fn write_lock(
    db: &RwLock<Database>,
) -> Result<std::sync::RwLockWriteGuard<'_, Database>> {
    db.write().map_err(|_| anyhow!("database lock is poisoned"))
}

pub(crate) fn read_lock(db: &RwLock<Database>) -> Result<std::sync::RwLockReadGuard<'_, Database>> {
    db.read().map_err(|_| anyhow!("database lock is poisoned"))
}

/// Writes entries into the index, a batch at a time.
///
/// Reschedules itself until every entry is written, so queries waiting on the
/// queue get a chance in between batches.
pub struct IndexJob {
    db: Arc<RwLock<Database>>,
    index: Arc<NameIndex>,
    pending: Vec<Entry>,
    batch: usize,
}

impl IndexJob {
    pub const DEFAULT_BATCH: usize = 256;

    pub fn new(db: Arc<RwLock<Database>>, index: Arc<NameIndex>, mut entries: Vec<Entry>) -> Self {
        // popped from the back, so reverse to keep the submission order
        entries.reverse();
        Self {
            db,
            index,
            pending: entries,
            batch: Self::DEFAULT_BATCH,
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }
}

impl Job for IndexJob {
    fn family(&self) -> Option<&str> {
        Some(FAMILY)
    }

    fn name(&self) -> &str {
        "index names"
    }

    fn execute(&mut self, monitor: &dyn ProgressMonitor) -> Result<JobStatus> {
        let mut db = write_lock(&self.db)?;
        for _ in 0..self.batch {
            let Some(entry) = self.pending.pop() else {
                break;
            };
            self.index.add(&mut db, &entry)?;
        }
        monitor.remaining(self.pending.len());
        if self.pending.is_empty() {
            db.flush()?;
            Ok(JobStatus::Complete)
        } else {
            trace!("{} entries left to index", self.pending.len());
            Ok(JobStatus::Reschedule)
        }
    }
}
