//! # Session
//!
//! Owns everything belonging to one open index: the database, the job manager that
//! decides who may touch it, and the interning cache for query results.
//!
//! The database is shared as `Arc<RwLock<Database>>`. Writes only ever happen inside
//! jobs (background ones from the queue, or foreground ones under a [`Policy`]),
//! reads happen inside foreground jobs holding the read lock.

use std::{
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};

use crate::{
    config::Config,
    db::{
        store::{disk::DiskMode, DiskStore},
        Database,
    },
    intern::{Interned, WeakSet},
    job::{Job, JobManager, JobStatus, NullMonitor, Outcome, Policy, ProgressMonitor},
    names::{self, Entry, IndexJob, NameIndex},
};

/// One search result. Names are interned, so repeated queries share them.
#[derive(Debug, Clone)]
pub struct Hit {
    pub name: Arc<Interned<String>>,
    pub location: String,
    pub line: i32,
}

pub struct Session {
    db: Arc<RwLock<Database>>,
    names: Arc<NameIndex>,
    jobs: JobManager,
    interned: Mutex<WeakSet<String>>,
    rebuilt: bool,
}

impl Session {
    /// Open (or create) the index file named in the config
    #[instrument(skip_all, fields(path = ?config.database.path))]
    pub fn open(config: &Config) -> Result<Self> {
        let store = DiskStore::open(&config.database.path, DiskMode::Dynamic)
            .with_context(|| format!("failed to open {:?}", config.database.path))?;
        let (db, rebuilt) = if config.database.rebuild_on_corrupt {
            Database::open_or_rebuild(store)?
        } else {
            (
                Database::open(store).context("refusing to use the existing index file")?,
                false,
            )
        };
        if rebuilt {
            info!("index file was (re)initialized, it has to be repopulated");
        }
        Self::with_database(db.with_grow_by(config.database.grow_by), rebuilt, config)
    }

    /// A session around an already open database
    pub fn with_database(db: Database, rebuilt: bool, config: &Config) -> Result<Self> {
        let names = Arc::new(NameIndex::new(&db)?);
        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            names,
            jobs: JobManager::new(&config.jobs)?,
            interned: Mutex::new(WeakSet::new()),
            rebuilt,
        })
    }

    /// whether the database was created or thrown away when it was opened
    pub fn was_rebuilt(&self) -> bool {
        self.rebuilt
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn database(&self) -> &Arc<RwLock<Database>> {
        &self.db
    }

    /// Queue `entries` to be written by the background worker
    pub fn index(&self, entries: Vec<Entry>) {
        self.jobs
            .request(IndexJob::new(self.db.clone(), self.names.clone(), entries));
    }

    /// Drop all queued (not yet written) index updates
    pub fn cancel_indexing(&self) -> usize {
        self.jobs.discard_jobs(Some(names::FAMILY))
    }

    /// Remove an entry right away
    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut job = RemoveJob {
            db: self.db.clone(),
            names: self.names.clone(),
            name: name.to_owned(),
            removed: false,
        };
        self.jobs.perform_concurrent_job(
            &mut job,
            Policy::ForceImmediate,
            &NullMonitor,
        )?;
        Ok(job.removed)
    }

    /// Look up every entry starting with `prefix`.
    ///
    /// `policy` decides what happens when the indexer is busy. `None` means the
    /// search was canceled (through `monitor`, or by the policy).
    #[instrument(skip(self, monitor))]
    pub fn search(
        &self,
        prefix: &str,
        limit: Option<usize>,
        policy: Policy,
        monitor: &dyn ProgressMonitor,
    ) -> Result<Option<Vec<Hit>>> {
        let mut job = SearchJob {
            db: self.db.clone(),
            names: self.names.clone(),
            prefix: prefix.to_owned(),
            limit,
            found: vec![],
        };
        match self.jobs.perform_concurrent_job(&mut job, policy, monitor)? {
            Outcome::Canceled => Ok(None),
            Outcome::Completed(_) => {
                let mut interned = self
                    .interned
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let hits = job
                    .found
                    .into_iter()
                    .map(|entry| Hit {
                        name: interned.add(entry.name),
                        location: entry.location,
                        line: entry.line,
                    })
                    .collect::<Vec<_>>();
                debug!("{} hits, {} names interned", hits.len(), interned.size());
                Ok(Some(hits))
            }
        }
    }

    /// number of distinct names currently held by results
    pub fn interned_names(&self) -> usize {
        let mut interned = self
            .interned
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // an empty lookup sweeps dropped names
        interned.contains(&String::new());
        interned.size()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.names.len(&*names::read_lock(&self.db)?)?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Wait for queued indexing to finish. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.jobs.wait_idle(timeout)
    }

    /// Stop the background worker and flush the database
    #[instrument(skip(self))]
    pub fn close(mut self) -> Result<()> {
        self.jobs.shutdown();
        let mut db = names::write_lock(&self.db)?;
        db.infodump()?;
        db.flush()?;
        Ok(())
    }
}

struct SearchJob {
    db: Arc<RwLock<Database>>,
    names: Arc<NameIndex>,
    prefix: String,
    limit: Option<usize>,
    found: Vec<Entry>,
}

impl Job for SearchJob {
    fn name(&self) -> &str {
        "search"
    }

    fn execute(&mut self, _monitor: &dyn ProgressMonitor) -> Result<JobStatus> {
        let db = names::read_lock(&self.db)?;
        self.found = self.names.find_prefix(&db, &self.prefix, false, self.limit)?;
        Ok(JobStatus::Complete)
    }
}

struct RemoveJob {
    db: Arc<RwLock<Database>>,
    names: Arc<NameIndex>,
    name: String,
    removed: bool,
}

impl Job for RemoveJob {
    fn family(&self) -> Option<&str> {
        Some(names::FAMILY)
    }

    fn name(&self) -> &str {
        "remove name"
    }

    fn execute(&mut self, _monitor: &dyn ProgressMonitor) -> Result<JobStatus> {
        let mut db = names::write_lock(&self.db)?;
        self.removed = self.names.remove(&mut db, &self.name)?;
        Ok(JobStatus::Complete)
    }
}
