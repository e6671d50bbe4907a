pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod locks;
pub mod manager;
pub mod model;
pub mod parser;
pub mod server;
pub mod storage;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound::{Excluded, Unbounded};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::{Clock, TimeSource};
use crate::config::{DeletePolicy, StoreConfig, UpdatePolicy};
use crate::error::{StoreError, StoreResult};
use crate::locks::{KeyGuard, KeyLocks};
use crate::model::{Book, BookId, HistoryRecord, Record, Validity, Version};
use crate::storage::{Commit, Mutation, Segment};

type CurrentTable = BTreeMap<BookId, Record>;
type HistoryTable = BTreeMap<BookId, Vec<HistoryRecord>>;

/// Current table plus history table for Books, versioned by the application.
pub struct VersionedStore {
    // Readers clone the Arc; writers copy-on-write only while a reader still holds it.
    current: RwLock<Arc<CurrentTable>>,
    history: RwLock<HistoryTable>,
    locks: KeyLocks,
    journal: Option<Mutex<Segment>>,
    clock: TimeSource,
    config: StoreConfig,
}

impl fmt::Debug for VersionedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedStore")
            .field("active", &self.current.read().map(|c| c.len()).unwrap_or(0))
            .field("archived_ids", &self.history.read().map(|h| h.len()).unwrap_or(0))
            .field("durable", &self.journal.is_some())
            .finish()
    }
}

/// An invariant breach found by [`VersionedStore::verify`].
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub id: BookId,
    pub detail: String,
}

impl VersionedStore {
    /// Volatile store; nothing survives the process.
    pub fn in_memory(config: StoreConfig, clock: impl Clock + 'static) -> Self {
        Self {
            current: RwLock::new(Arc::new(BTreeMap::new())),
            history: RwLock::new(BTreeMap::new()),
            locks: KeyLocks::new(),
            journal: None,
            clock: TimeSource::new(clock),
            config,
        }
    }

    /// Opens the journal at `path` and rebuilds both tables from it.
    pub fn open(path: &Path, config: StoreConfig, clock: impl Clock + 'static) -> StoreResult<Self> {
        let (segment, commits) = Segment::open(path, config.strict_durability)?;

        let time = TimeSource::new(clock);
        let mut current = BTreeMap::new();
        let mut history = BTreeMap::new();
        for commit in &commits {
            for op in &commit.ops {
                match op {
                    Mutation::Put(r) => time.observe(r.valid_time.from),
                    Mutation::Append(h) => time.observe(h.valid_time.to),
                    _ => {}
                }
            }
            apply_ops(&mut current, &mut history, &commit.ops);
        }

        info!(
            path = %path.display(),
            commits = commits.len(),
            active = current.len(),
            "store recovered"
        );

        Ok(Self {
            current: RwLock::new(Arc::new(current)),
            history: RwLock::new(history),
            locks: KeyLocks::new(),
            journal: Some(Mutex::new(segment)),
            clock: time,
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // --- MUTATIONS ---

    pub fn insert(&self, id: BookId, fields: Book) -> StoreResult<Record> {
        let _guard = self.lock(id)?;
        if self.get_active(id)?.is_some() {
            return Err(StoreError::DuplicateKey(id));
        }

        let now = self.stamp(id, None)?;
        let record = Record::new(id, fields, now);
        self.commit(vec![Mutation::Put(record.clone())])?;

        info!(id, valid_from = now, "book inserted");
        Ok(record)
    }

    pub fn update(&self, id: BookId, fields: Book) -> StoreResult<Record> {
        self.modify(id, move |_| fields)
    }

    /// Read-modify-write under the book's lock. `f` sees the active fields.
    pub fn modify<F>(&self, id: BookId, f: F) -> StoreResult<Record>
    where
        F: FnOnce(&Book) -> Book,
    {
        let _guard = self.lock(id)?;
        let current = self.get_active(id)?.ok_or(StoreError::NotFound(id))?;

        // Same instant closes the old version and opens the new one.
        let now = self.stamp(id, Some(&current))?;
        let archived = current.archive(now);
        let valid_from = match self.config.update_policy {
            UpdatePolicy::Refresh => now,
            UpdatePolicy::Preserve => current.valid_time.from,
        };
        let next = Record {
            id,
            fields: f(&current.fields),
            valid_time: Validity::open_at(valid_from),
        };

        self.commit(vec![Mutation::Append(archived), Mutation::Put(next.clone())])?;

        info!(id, at = now, "book updated");
        Ok(next)
    }

    pub fn delete(&self, id: BookId) -> StoreResult<()> {
        let _guard = self.lock(id)?;
        let current = self.get_active(id)?.ok_or(StoreError::NotFound(id))?;

        match self.config.delete_policy {
            DeletePolicy::Archive => {
                let now = self.stamp(id, Some(&current))?;
                self.commit(vec![Mutation::Append(current.archive(now)), Mutation::Remove(id)])?;
                info!(id, at = now, "book deleted (archived)");
            }
            DeletePolicy::Purge => {
                self.commit(vec![Mutation::Purge(id)])?;
                info!(id, "book purged with history");
            }
        }
        Ok(())
    }

    // --- READS ---

    pub fn get_active(&self, id: BookId) -> StoreResult<Option<Record>> {
        let current = self.current.read().map_err(|_| StoreError::Poisoned("current table"))?;
        Ok(current.get(&id).cloned())
    }

    /// Lazy scan of active rows, frozen at call time. Call again to see later writes.
    pub fn read_active<P>(&self, predicate: P) -> StoreResult<ActiveRows<P>>
    where
        P: FnMut(&Record) -> bool,
    {
        let snapshot = self
            .current
            .read()
            .map_err(|_| StoreError::Poisoned("current table"))?
            .clone();
        Ok(ActiveRows { snapshot, cursor: None, predicate })
    }

    /// The version of `id` that was live at `ts`.
    pub fn read_as_of(&self, id: BookId, ts: u64) -> StoreResult<Version> {
        let history = self.history.read().map_err(|_| StoreError::Poisoned("history table"))?;
        let current = self.current.read().map_err(|_| StoreError::Poisoned("current table"))?;

        // Preserve-mode rows share validFrom; the earliest closing one was live at ts.
        let archived = history
            .get(&id)
            .into_iter()
            .flatten()
            .filter(|h| h.valid_time.contains(ts))
            .min_by_key(|h| h.valid_time.to);

        if let Some(h) = archived {
            return Ok(Version::Archived(h.clone()));
        }
        match current.get(&id) {
            Some(r) if r.valid_time.contains(ts) => Ok(Version::Current(r.clone())),
            _ => Err(StoreError::NotFound(id)),
        }
    }

    /// Archived versions of one book, oldest first.
    pub fn history(&self, id: BookId) -> StoreResult<Vec<HistoryRecord>> {
        let history = self.history.read().map_err(|_| StoreError::Poisoned("history table"))?;
        Ok(history.get(&id).cloned().unwrap_or_default())
    }

    /// Every archived version, by book then age.
    pub fn history_all(&self) -> StoreResult<Vec<HistoryRecord>> {
        let history = self.history.read().map_err(|_| StoreError::Poisoned("history table"))?;
        Ok(history.values().flatten().cloned().collect())
    }

    /// Checks the one-open-row and interval-ordering invariants across both tables.
    pub fn verify(&self) -> StoreResult<Vec<Violation>> {
        let history = self.history.read().map_err(|_| StoreError::Poisoned("history table"))?;
        let current = self.current.read().map_err(|_| StoreError::Poisoned("current table"))?;
        let mut found = Vec::new();
        let mut flag = |id: BookId, detail: String| found.push(Violation { id, detail });

        for (key, r) in current.iter() {
            if *key != r.id {
                flag(*key, format!("row stored under key {} carries id {}", key, r.id));
            }
            if !r.valid_time.is_open() {
                flag(r.id, "active row has a closed interval".into());
            }
        }

        for (id, rows) in history.iter() {
            for h in rows {
                if h.valid_time.is_open() || h.valid_time.from >= h.valid_time.to {
                    flag(*id, format!("bad archived interval {:?}", h.valid_time));
                }
            }
            for pair in rows.windows(2) {
                let (a, b) = (pair[0].valid_time, pair[1].valid_time);
                let ordered = match self.config.update_policy {
                    UpdatePolicy::Refresh => a.to <= b.from,
                    UpdatePolicy::Preserve => a.to < b.to && a.from <= b.from,
                };
                if !ordered {
                    flag(*id, format!("archived intervals {:?} and {:?} overlap", a, b));
                }
            }
            if let (Some(last), Some(r)) = (rows.last(), current.get(id)) {
                let ordered = match self.config.update_policy {
                    UpdatePolicy::Refresh => last.valid_time.to <= r.valid_time.from,
                    UpdatePolicy::Preserve => last.valid_time.from <= r.valid_time.from,
                };
                if !ordered {
                    flag(*id, format!("active row {:?} overlaps history {:?}", r.valid_time, last.valid_time));
                }
            }
        }

        Ok(found)
    }

    pub fn active_count(&self) -> StoreResult<usize> {
        Ok(self.current.read().map_err(|_| StoreError::Poisoned("current table"))?.len())
    }

    // --- MAINTENANCE ---

    /// Rewrites the journal as one frame holding exactly the live tables.
    pub fn checkpoint(&self) -> StoreResult<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };

        // Journal before tables, the same order commit() takes them in.
        let mut segment = journal.lock().map_err(|_| StoreError::Poisoned("journal"))?;
        let history = self.history.read().map_err(|_| StoreError::Poisoned("history table"))?;
        let current = self.current.read().map_err(|_| StoreError::Poisoned("current table"))?;

        let ops: Vec<Mutation> = history
            .values()
            .flatten()
            .cloned()
            .map(Mutation::Append)
            .chain(current.values().cloned().map(Mutation::Put))
            .collect();

        let before = segment.len();
        let count = ops.len();
        segment.rewrite(&Commit { txn: *Uuid::nil().as_bytes(), ops })?;

        info!(rows = count, before, after = segment.len(), "journal checkpointed");
        Ok(())
    }

    // --- INTERNALS ---

    fn lock(&self, id: BookId) -> StoreResult<KeyGuard<'_>> {
        self.locks.acquire(id, self.config.lock_timeout, self.config.max_attempts)
    }

    /// Timestamp for a mutation of `id`, which must be strictly after anything recorded for it.
    fn stamp(&self, id: BookId, current: Option<&Record>) -> StoreResult<u64> {
        let now = self.clock.now();

        let last_archived = {
            let history = self.history.read().map_err(|_| StoreError::Poisoned("history table"))?;
            history.get(&id).and_then(|rows| rows.last()).map(|h| h.valid_time.to)
        };
        let last = current.map(|r| r.valid_time.from).into_iter().chain(last_archived).max();

        match last {
            Some(last) if now <= last => Err(StoreError::ClockSkew { id, now, last }),
            _ => Ok(now),
        }
    }

    fn commit(&self, ops: Vec<Mutation>) -> StoreResult<()> {
        let commit = Commit { txn: *Uuid::new_v4().as_bytes(), ops };

        // Held through apply so a checkpoint never sees a journaled but unapplied commit.
        let segment = match &self.journal {
            Some(journal) => {
                let mut segment = journal.lock().map_err(|_| StoreError::Poisoned("journal"))?;
                segment.append(&commit)?;
                Some(segment)
            }
            None => None,
        };

        {
            let mut history = self.history.write().map_err(|_| StoreError::Poisoned("history table"))?;
            let mut current = self.current.write().map_err(|_| StoreError::Poisoned("current table"))?;
            apply_ops(Arc::make_mut(&mut *current), &mut *history, &commit.ops);
        }
        drop(segment);

        debug!(txn = %Uuid::from_bytes(commit.txn), ops = commit.ops.len(), "commit applied");
        Ok(())
    }
}

fn apply_ops(current: &mut CurrentTable, history: &mut HistoryTable, ops: &[Mutation]) {
    for op in ops {
        match op {
            Mutation::Put(r) => {
                current.insert(r.id, r.clone());
            }
            Mutation::Append(h) => history.entry(h.id).or_default().push(h.clone()),
            Mutation::Remove(id) => {
                current.remove(id);
            }
            Mutation::Purge(id) => {
                current.remove(id);
                history.remove(id);
            }
        }
    }
}

/// Iterator returned by [`VersionedStore::read_active`].
pub struct ActiveRows<P> {
    snapshot: Arc<CurrentTable>,
    cursor: Option<BookId>,
    predicate: P,
}

impl<P> Iterator for ActiveRows<P>
where
    P: FnMut(&Record) -> bool,
{
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        let rows = match self.cursor {
            None => self.snapshot.range::<BookId, _>(..),
            Some(last) => self.snapshot.range((Excluded(last), Unbounded)),
        };
        for (id, record) in rows {
            self.cursor = Some(*id);
            if record.valid_time.is_open() && (self.predicate)(record) {
                return Some(record.clone());
            }
        }
        None
    }
}
