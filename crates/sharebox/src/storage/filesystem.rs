use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// Move a file from `src` to `dst`. Uses `rename` first (fast, atomic on same
/// filesystem). Falls back to copy + delete when rename fails across devices.
pub fn move_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    let move_error = |e| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    };

    match std::fs::rename(src, dst) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(move_error(e)),
        Err(e) => log::debug!("rename failed ({}), falling back to copy", e),
    }

    std::fs::copy(src, dst).map_err(move_error)?;
    std::fs::remove_file(src).map_err(move_error)?;
    Ok(())
}

/// Physical file operations on the staging area and the destination tree.
#[derive(Debug, Clone)]
pub struct FileStorage {
    staging_root: PathBuf,
    destination_root: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(staging_root: P, destination_root: Q) -> Self {
        Self {
            staging_root: staging_root.as_ref().to_path_buf(),
            destination_root: destination_root.as_ref().to_path_buf(),
        }
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    pub fn destination_root(&self) -> &Path {
        &self.destination_root
    }

    pub fn staging_path(&self, stored_name: &str) -> PathBuf {
        self.staging_root.join(stored_name)
    }

    pub fn destination_path(&self, relative_path: &str) -> PathBuf {
        self.destination_root.join(relative_path)
    }

    /// Creates both roots if they are missing.
    pub fn prepare(&self) -> Result<(), StorageError> {
        self.ensure_directory(&self.staging_root)?;
        self.ensure_directory(&self.destination_root)
    }

    /// Writes `content` to a file that must not exist yet.
    ///
    /// Creation uses `create_new` (O_CREAT | O_EXCL); `Ok(None)` means another
    /// writer got the name first and the caller should pick a new one.
    /// Returns the number of bytes written.
    pub fn store_new<R: Read>(&self, path: &Path, content: &mut R) -> Result<Option<u64>, StorageError> {
        if let Some(parent) = path.parent() {
            self.ensure_directory(parent)?;
        }

        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => {
                return Err(StorageError::WriteFile {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let written = std::io::copy(content, &mut file).and_then(|n| file.sync_all().map(|_| n));
        match written {
            Ok(n) => Ok(Some(n)),
            Err(e) => {
                drop(file);
                // A half-written upload must not stay behind under a reserved name.
                let _ = std::fs::remove_file(path);
                Err(StorageError::WriteFile {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }
    }

    /// Creates an empty placeholder at `path` so no concurrent writer can
    /// take it. `Ok(false)` means something already lives there.
    pub fn reserve(&self, path: &Path) -> Result<bool, StorageError> {
        if let Some(parent) = path.parent() {
            self.ensure_directory(parent)?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StorageError::WriteFile {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Moves `from` to `to`, creating the parent directories of `to`.
    pub fn relocate(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        if let Some(parent) = to.parent() {
            self.ensure_directory(parent)?;
        }
        move_file(from, to)
    }

    /// Deletes a file, or a directory recursively. Returns false when nothing
    /// was there.
    pub fn remove(&self, path: &Path) -> Result<bool, StorageError> {
        let metadata = match std::fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(StorageError::RemoveFile {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let result = if metadata.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };
        result.map_err(|e| StorageError::RemoveFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(true)
    }

    pub fn ensure_directory(&self, path: &Path) -> Result<(), StorageError> {
        if !path.exists() {
            std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        Ok(())
    }
}
