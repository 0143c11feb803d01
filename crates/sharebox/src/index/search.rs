//! Letter-sharded snapshot of the completed ledger.
//!
//! Shards are disposable: `rebuild` regenerates all of them from the ledger,
//! and the manifest is written last so its presence marks a complete set.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::info_span;

use crate::error::{IndexError, LedgerError};
use crate::ledger::{read_rows, record, write_rows, CompletedRecord, LedgerRecord, LedgerStore};
use crate::validation;

const MANIFEST: &str = "manifest.json";
const CATCH_ALL: char = '_';

/// Every shard key: `a` to `z`, then the catch-all.
fn shard_keys() -> impl Iterator<Item = char> {
    ('a'..='z').chain(std::iter::once(CATCH_ALL))
}

/// Shard a file name belongs to.
pub fn shard_key(name: &str) -> char {
    match name.chars().next().map(|c| c.to_ascii_lowercase()) {
        Some(c) if c.is_ascii_lowercase() => c,
        _ => CATCH_ALL,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    #[serde(with = "crate::ledger::record::timestamp")]
    pub built_at: NaiveDateTime,
    pub rows: usize,
    pub shards: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub upload_id: u64,
    pub name: String,
    pub path: String,
    pub submitted_at: NaiveDateTime,
    pub approved_at: NaiveDateTime,
}

impl From<CompletedRecord> for SearchHit {
    fn from(row: CompletedRecord) -> Self {
        Self {
            upload_id: row.upload_id,
            name: row.file_name().to_string(),
            path: row.final_path,
            submitted_at: row.submitted_at,
            approved_at: row.approved_at,
        }
    }
}

pub struct SearchIndex {
    shard_root: PathBuf,
    ledger: Arc<LedgerStore>,
    rebuild_lock: Mutex<()>,
}

impl SearchIndex {
    pub fn new<P: AsRef<Path>>(shard_root: P, ledger: Arc<LedgerStore>) -> Self {
        Self {
            shard_root: shard_root.as_ref().to_path_buf(),
            ledger,
            rebuild_lock: Mutex::new(()),
        }
    }

    pub fn shard_root(&self) -> &Path {
        &self.shard_root
    }

    fn shard_path(&self, key: char) -> PathBuf {
        self.shard_root.join(format!("{}.csv", key))
    }

    fn manifest_path(&self) -> PathBuf {
        self.shard_root.join(MANIFEST)
    }

    /// True once a complete set of shards has been written.
    pub fn is_ready(&self) -> bool {
        self.manifest_path().is_file() && shard_keys().all(|key| self.shard_path(key).is_file())
    }

    /// Stats of the last completed rebuild.
    pub fn stats(&self) -> Option<IndexStats> {
        let raw = std::fs::read(self.manifest_path()).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// Regenerates every shard from the completed ledger.
    ///
    /// The ledger is read without its lock; ledger files are replaced
    /// atomically so the snapshot is always a whole file.
    pub fn rebuild(&self) -> Result<IndexStats, IndexError> {
        let _span = info_span!("index.rebuild").entered();
        let _guard = self
            .rebuild_lock
            .lock()
            .map_err(|_| IndexError::Ledger(LedgerError::LockPoisoned))?;

        let rows = self.ledger.scan::<CompletedRecord>()?;
        let total = rows.len();

        let mut buckets: Vec<(char, Vec<CompletedRecord>)> =
            shard_keys().map(|key| (key, Vec::new())).collect();
        for row in rows {
            let key = shard_key(row.file_name());
            if let Some((_, bucket)) = buckets.iter_mut().find(|(k, _)| *k == key) {
                bucket.push(row);
            }
        }

        // The manifest goes away first so a crash mid-rebuild reads as not ready.
        let manifest = self.manifest_path();
        if let Err(e) = std::fs::remove_file(&manifest) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(IndexError::Io {
                    path: manifest,
                    source: e,
                });
            }
        }

        for (key, bucket) in &buckets {
            write_rows(&self.shard_path(*key), None, bucket)?;
        }

        let stats = IndexStats {
            built_at: record::now(),
            rows: total,
            shards: buckets.len(),
        };
        self.write_manifest(&stats)?;

        log::info!("Search index rebuilt: {} row(s) in {} shard(s)", total, stats.shards);
        Ok(stats)
    }

    fn write_manifest(&self, stats: &IndexStats) -> Result<(), IndexError> {
        let path = self.manifest_path();
        let io_error = |e: std::io::Error| IndexError::Io {
            path: path.clone(),
            source: e,
        };

        let body = serde_json::to_vec_pretty(stats).map_err(|e| io_error(e.into()))?;
        let mut temp = tempfile::NamedTempFile::new_in(&self.shard_root).map_err(io_error)?;
        temp.write_all(&body).map_err(io_error)?;
        temp.as_file().sync_all().map_err(io_error)?;
        temp.persist(&path).map_err(|e| io_error(e.error))?;
        Ok(())
    }

    /// Completed uploads whose file name contains `query`, case-insensitively,
    /// sorted by name.
    ///
    /// `folder` restricts hits to paths containing it. Returns `NotReady`
    /// instead of an empty result when the shards have not been built.
    pub fn search(&self, query: &str, folder: Option<&str>) -> Result<Vec<SearchHit>, IndexError> {
        if !self.is_ready() {
            return Err(IndexError::NotReady);
        }

        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let folder = folder
            .and_then(validation::clean_relative_path)
            .filter(|folder| !folder.is_empty());

        // Primary shard first; names containing the query elsewhere live in
        // the other shards.
        let primary = shard_key(&needle);
        let order = std::iter::once(primary).chain(shard_keys().filter(|key| *key != primary));

        let mut hits = Vec::new();
        for key in order {
            let path = self.shard_path(key);
            if !path.is_file() {
                return Err(IndexError::NotReady);
            }
            let rows: Vec<CompletedRecord> =
                read_rows(&path, false, CompletedRecord::HEADER.len())?;
            hits.extend(
                rows.into_iter()
                    .filter(|row| {
                        folder
                            .as_deref()
                            .is_none_or(|folder| row.final_path.contains(folder))
                    })
                    .filter(|row| row.file_name().to_lowercase().contains(&needle))
                    .map(SearchHit::from),
            );
        }

        hits.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.path.cmp(&b.path))
        });
        log::debug!("Search matched {} row(s)", hits.len());
        Ok(hits)
    }
}
