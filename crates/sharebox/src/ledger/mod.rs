//! Append-only upload ledgers kept as CSV files.
//!
//! Three ledgers (pending, completed, declined) replace a mutable uploads
//! table: an upload changes state by moving its row from one ledger to
//! another. A fourth, append-only activity ledger records downloads and
//! changes made directly to the destination tree. Each ledger has its own mutex; every mutation rewrites the whole
//! file under that mutex and replaces it atomically, so readers that do not
//! take the lock still see either the old or the new file, never a mix.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::LedgerError;
use crate::sequence::IdSource;

mod file;
pub mod record;

pub(crate) use file::{count_rows, read_rows, write_rows};
pub use record::{
    ActivityKind, ActivityRecord, CompletedRecord, DeclinedRecord, LedgerRecord, PendingRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Pending,
    Completed,
    Declined,
    Activity,
}

impl std::fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerKind::Pending => write!(f, "pending"),
            LedgerKind::Completed => write!(f, "completed"),
            LedgerKind::Declined => write!(f, "declined"),
            LedgerKind::Activity => write!(f, "activity"),
        }
    }
}

/// Published after every committed ledger mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEvent {
    pub kind: LedgerKind,
    /// Row count of the ledger after the mutation.
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct LedgerPaths {
    pub pending: PathBuf,
    pub completed: PathBuf,
    pub declined: PathBuf,
    pub activity: PathBuf,
}

impl LedgerPaths {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pending: config.resolve(&config.ledgers.pending),
            completed: config.resolve(&config.ledgers.completed),
            declined: config.resolve(&config.ledgers.declined),
            activity: config.resolve(&config.ledgers.activity),
        }
    }

    pub fn in_directory<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        Self {
            pending: dir.join("upload_pending_log.csv"),
            completed: dir.join("upload_completed_log.csv"),
            declined: dir.join("declined_log.csv"),
            activity: dir.join("download_log.csv"),
        }
    }

    pub fn path(&self, kind: LedgerKind) -> &Path {
        match kind {
            LedgerKind::Pending => &self.pending,
            LedgerKind::Completed => &self.completed,
            LedgerKind::Declined => &self.declined,
            LedgerKind::Activity => &self.activity,
        }
    }
}

pub struct LedgerStore {
    paths: LedgerPaths,
    pending_lock: Mutex<()>,
    completed_lock: Mutex<()>,
    declined_lock: Mutex<()>,
    activity_lock: Mutex<()>,
    subscribers: Mutex<Vec<Sender<LedgerEvent>>>,
}

impl LedgerStore {
    pub fn new(paths: LedgerPaths) -> Self {
        Self {
            paths,
            pending_lock: Mutex::new(()),
            completed_lock: Mutex::new(()),
            declined_lock: Mutex::new(()),
            activity_lock: Mutex::new(()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn paths(&self) -> &LedgerPaths {
        &self.paths
    }

    /// Receives a [`LedgerEvent`] for every mutation committed from now on.
    pub fn subscribe(&self) -> Receiver<LedgerEvent> {
        let (tx, rx) = unbounded();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Reads all rows of a ledger without taking its lock.
    pub fn scan<R: LedgerRecord>(&self) -> Result<Vec<R>, LedgerError> {
        read_rows(self.paths.path(R::KIND), true, R::HEADER.len())
    }

    pub fn count<R: LedgerRecord>(&self) -> Result<usize, LedgerError> {
        count_rows(self.paths.path(R::KIND), true)
    }

    pub fn find_by_id<R: LedgerRecord>(&self, upload_id: u64) -> Result<Option<R>, LedgerError> {
        Ok(self
            .scan::<R>()?
            .into_iter()
            .find(|row| row.upload_id() == Some(upload_id)))
    }

    /// Rows whose stored name or logical path equals `value`, in ledger order.
    pub fn find_by_name_or_path<R: LedgerRecord>(&self, value: &str) -> Result<Vec<R>, LedgerError> {
        Ok(self
            .scan::<R>()?
            .into_iter()
            .filter(|row| row.matches_name(value))
            .collect())
    }

    pub fn append<R: LedgerRecord>(&self, row: R) -> Result<(), LedgerError> {
        self.mutate::<R, _, _>(|rows| {
            rows.push(row);
            Some(())
        })
        .map(|_| ())
    }

    /// Removes the row with `upload_id`, returning it if it was present.
    pub fn remove<R: LedgerRecord>(&self, upload_id: u64) -> Result<Option<R>, LedgerError> {
        self.mutate::<R, _, _>(|rows| {
            let position = rows
                .iter()
                .position(|row| row.upload_id() == Some(upload_id))?;
            Some(rows.remove(position))
        })
    }

    /// Applies `edit` to the row with `upload_id` in place and returns the
    /// updated row.
    pub fn update<R, F>(&self, upload_id: u64, edit: F) -> Result<Option<R>, LedgerError>
    where
        R: LedgerRecord,
        F: FnOnce(&mut R),
    {
        self.mutate::<R, _, _>(|rows| {
            let row = rows
                .iter_mut()
                .find(|row| row.upload_id() == Some(upload_id))?;
            edit(row);
            Some(row.clone())
        })
    }

    /// Read-modify-write under the ledger's lock. The file is rewritten only
    /// when `change` reports a result.
    fn mutate<R, T, F>(&self, change: F) -> Result<Option<T>, LedgerError>
    where
        R: LedgerRecord,
        F: FnOnce(&mut Vec<R>) -> Option<T>,
    {
        let path = self.paths.path(R::KIND);
        let row_count;
        let outcome;
        {
            let _guard = self.lock(R::KIND)?;
            let mut rows: Vec<R> = read_rows(path, true, R::HEADER.len())?;
            outcome = change(&mut rows);
            if outcome.is_none() {
                return Ok(None);
            }
            write_rows(path, Some(R::HEADER), &rows)?;
            row_count = rows.len();
        }

        self.notify(LedgerEvent {
            kind: R::KIND,
            rows: row_count,
        });
        Ok(outcome)
    }

    fn lock(&self, kind: LedgerKind) -> Result<MutexGuard<'_, ()>, LedgerError> {
        let lock = match kind {
            LedgerKind::Pending => &self.pending_lock,
            LedgerKind::Completed => &self.completed_lock,
            LedgerKind::Declined => &self.declined_lock,
            LedgerKind::Activity => &self.activity_lock,
        };
        lock.lock().map_err(|_| LedgerError::LockPoisoned)
    }

    fn notify(&self, event: LedgerEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event).is_ok());
        }
    }
}

/// Upload ids live in the pending and completed ledgers.
impl IdSource for LedgerStore {
    fn max_existing_id(&self) -> Result<u64, LedgerError> {
        let pending = self
            .scan::<PendingRecord>()?
            .iter()
            .map(|row| row.upload_id)
            .max()
            .unwrap_or(0);
        let completed = self
            .scan::<CompletedRecord>()?
            .iter()
            .map(|row| row.upload_id)
            .max()
            .unwrap_or(0);
        Ok(pending.max(completed))
    }
}
