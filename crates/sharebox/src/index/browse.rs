//! Directory listings of the destination tree annotated with upload ids.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use walkdir::WalkDir;

use crate::error::IndexError;
use crate::ledger::{CompletedRecord, LedgerStore};
use crate::resolver::join_relative;
use crate::validation;

#[derive(Debug, Clone, Serialize)]
pub struct FolderEntry {
    pub name: String,
    pub path: String,
    /// 0 when the folder was not created through an upload.
    pub upload_id: u64,
    /// Whether any regular file exists somewhere below the folder.
    pub has_files: bool,
    /// Total size of all files below the folder.
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    /// 0 for files that never went through the upload workflow.
    pub upload_id: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub path: String,
    pub parent: Option<String>,
    pub folders: Vec<FolderEntry>,
    pub files: Vec<FileEntry>,
}

pub struct Browser {
    destination_root: PathBuf,
    ledger: Arc<LedgerStore>,
}

impl Browser {
    pub fn new<P: AsRef<Path>>(destination_root: P, ledger: Arc<LedgerStore>) -> Self {
        Self {
            destination_root: destination_root.as_ref().to_path_buf(),
            ledger,
        }
    }

    /// Lists the folder at `subpath` (relative to the destination root).
    ///
    /// Paths that climb out of the root, lexically or through symlinks, are
    /// refused with `AccessDenied`.
    pub fn browse(&self, subpath: &str) -> Result<Listing, IndexError> {
        let relative = validation::clean_relative_path(subpath)
            .ok_or_else(|| IndexError::AccessDenied(subpath.to_string()))?;

        let root = self
            .destination_root
            .canonicalize()
            .map_err(|_| IndexError::NotFound(String::new()))?;
        let target = root
            .join(&relative)
            .canonicalize()
            .map_err(|_| IndexError::NotFound(relative.clone()))?;
        if !target.starts_with(&root) {
            log::warn!("Refusing to browse outside the destination tree: {}", subpath);
            return Err(IndexError::AccessDenied(subpath.to_string()));
        }
        if !target.is_dir() {
            return Err(IndexError::NotFound(relative));
        }

        let ids: HashMap<String, u64> = self
            .ledger
            .scan::<CompletedRecord>()?
            .into_iter()
            .map(|row| (row.final_path, row.upload_id))
            .collect();

        let mut folders = Vec::new();
        let mut files = Vec::new();
        let entries = std::fs::read_dir(&target).map_err(|e| IndexError::Io {
            path: target.clone(),
            source: e,
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let path = join_relative(&[&relative, &name]);
            let upload_id = ids.get(&path).copied().unwrap_or(0);
            let Ok(metadata) = entry.metadata() else {
                continue;
            };

            if metadata.is_dir() {
                let (has_files, size) = folder_contents(&entry.path());
                folders.push(FolderEntry {
                    name,
                    path,
                    upload_id,
                    has_files,
                    size,
                });
            } else {
                files.push(FileEntry {
                    name,
                    path,
                    upload_id,
                    size: metadata.len(),
                });
            }
        }
        folders.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        files.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));

        let parent = (!relative.is_empty()).then(|| {
            relative
                .rsplit_once('/')
                .map(|(parent, _)| parent.to_string())
                .unwrap_or_default()
        });

        Ok(Listing {
            path: relative,
            parent,
            folders,
            files,
        })
    }
}

/// Whether a folder holds any file below it, and their combined size.
fn folder_contents(dir: &Path) -> (bool, u64) {
    let mut has_files = false;
    let mut size = 0;
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            has_files = true;
            size += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    (has_files, size)
}
