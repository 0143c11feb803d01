//! Persistent id allocation for uploads and users.
//!
//! A counter file holds the next id to hand out. Every allocation also scans
//! the records of the namespace for the highest id in use, so a missing,
//! stale or rolled-back counter heals upward on the next call.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::LedgerError;

/// Anything that can report the largest id already handed out.
pub trait IdSource: Send + Sync {
    fn max_existing_id(&self) -> Result<u64, LedgerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Uploads,
    Users,
}

/// User database CSV files whose first column is the user id.
#[derive(Debug, Clone)]
pub struct UserDatabases {
    files: Vec<PathBuf>,
}

impl UserDatabases {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config
                .ledgers
                .user_databases
                .iter()
                .map(|file| config.resolve(file))
                .collect(),
        )
    }

    fn max_in_file(path: &Path) -> Result<u64, LedgerError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(LedgerError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);
        let has_id_column = reader
            .headers()
            .map_err(|e| LedgerError::Csv {
                path: path.to_path_buf(),
                source: e,
            })?
            .get(0)
            .is_some_and(|column| column.trim().eq_ignore_ascii_case("id"));
        if !has_id_column {
            log::debug!("{} has no id column; skipping", path.display());
            return Ok(0);
        }

        let mut max = 0;
        for record in reader.records() {
            let record = record.map_err(|e| LedgerError::Csv {
                path: path.to_path_buf(),
                source: e,
            })?;
            if let Some(id) = record.get(0).and_then(|raw| raw.trim().parse::<u64>().ok()) {
                max = max.max(id);
            }
        }
        Ok(max)
    }
}

impl IdSource for UserDatabases {
    fn max_existing_id(&self) -> Result<u64, LedgerError> {
        let mut max = 0;
        for file in &self.files {
            max = max.max(Self::max_in_file(file)?);
        }
        Ok(max)
    }
}

/// Allocates ids for one namespace.
pub struct SequenceAllocator {
    counter_path: PathBuf,
    source: Arc<dyn IdSource>,
    lock: Mutex<()>,
}

impl SequenceAllocator {
    pub fn new<P: AsRef<Path>>(counter_path: P, source: Arc<dyn IdSource>) -> Self {
        Self {
            counter_path: counter_path.as_ref().to_path_buf(),
            source,
            lock: Mutex::new(()),
        }
    }

    pub fn counter_path(&self) -> &Path {
        &self.counter_path
    }

    /// Returns the next unused id.
    ///
    /// Threads of this process are serialized by a mutex, other processes by
    /// an advisory lock on `<counter>.lock`.
    pub fn next_id(&self) -> Result<u64, LedgerError> {
        let _guard = self.lock.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let _file_lock = self.lock_counter();

        let max_existing = self.source.max_existing_id()?;
        let stored = self.read_counter();
        let next = stored.max(max_existing + 1);

        if let Err(e) = self.write_counter(next + 1) {
            log::warn!(
                "Failed to persist sequence counter {}: {}",
                self.counter_path.display(),
                e
            );
        }

        log::debug!(
            "Allocated id {} (stored {}, max existing {})",
            next,
            stored,
            max_existing
        );
        Ok(next)
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .counter_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.counter_path.with_file_name(name)
    }

    /// Takes the cross-process lock. Allocation proceeds without it when the
    /// lock file cannot be opened.
    fn lock_counter(&self) -> Option<CounterLock> {
        let path = self.lock_path();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) => {
                log::warn!("Cannot open counter lock {}: {}", path.display(), e);
                return None;
            }
        };

        match file.lock_exclusive() {
            Ok(()) => Some(CounterLock { file }),
            Err(e) => {
                log::warn!("Cannot lock {}: {}", path.display(), e);
                None
            }
        }
    }

    fn read_counter(&self) -> u64 {
        match std::fs::read_to_string(&self.counter_path) {
            Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
                log::warn!(
                    "Ignoring unreadable sequence counter {}: {:?}",
                    self.counter_path.display(),
                    raw.trim()
                );
                0
            }),
            Err(_) => 0,
        }
    }

    fn write_counter(&self, value: u64) -> std::io::Result<()> {
        let parent = match self.counter_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        writeln!(temp, "{}", value)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.counter_path).map_err(|e| e.error)?;
        Ok(())
    }
}

struct CounterLock {
    file: File,
}

impl Drop for CounterLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// The two allocators of the portal.
pub struct Sequences {
    uploads: SequenceAllocator,
    users: SequenceAllocator,
}

impl Sequences {
    pub fn new(uploads: SequenceAllocator, users: SequenceAllocator) -> Self {
        Self { uploads, users }
    }

    pub fn next_id(&self, namespace: Namespace) -> Result<u64, LedgerError> {
        self.allocator(namespace).next_id()
    }

    pub fn allocator(&self, namespace: Namespace) -> &SequenceAllocator {
        match namespace {
            Namespace::Uploads => &self.uploads,
            Namespace::Users => &self.users,
        }
    }
}
