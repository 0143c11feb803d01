//! Direct maintenance of the destination tree outside the upload workflow:
//! folder creation, moving items to the trash, file downloads and folder
//! archives.
//!
//! Each successful operation appends an [`ActivityRecord`]. Paths are
//! confined to the destination root both lexically and after resolving
//! symlinks.

use std::fs::File;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Local;
use serde::Serialize;
use tracing::info_span;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{LedgerError, TreeError};
use crate::identity::Submitter;
use crate::ledger::{record, ActivityKind, ActivityRecord, LedgerStore};
use crate::resolver::{self, join_relative, split_name};
use crate::sanitize;
use crate::storage::FileStorage;
use crate::validation;

const TRASH_STAMP: &str = "%Y%m%d_%H%M%S";

/// Where a deleted item ended up.
#[derive(Debug, Clone, Serialize)]
pub struct TrashedItem {
    /// Former path relative to the destination root.
    pub path: String,
    /// Name inside the trash directory.
    pub trash_name: String,
}

/// An opened file ready to be streamed to the caller.
#[derive(Debug)]
pub struct FileDownload {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub file: File,
}

/// Summary of a written folder archive.
#[derive(Debug, Clone, Serialize)]
pub struct FolderArchive {
    /// Suggested download name, `<folder>.zip`.
    pub name: String,
    pub path: String,
    pub files: usize,
}

pub struct ShareTree {
    storage: FileStorage,
    trash_root: PathBuf,
    ledger: Arc<LedgerStore>,
    trash_lock: Mutex<()>,
}

impl ShareTree {
    pub fn new<P: AsRef<Path>>(storage: FileStorage, trash_root: P, ledger: Arc<LedgerStore>) -> Self {
        Self {
            storage,
            trash_root: trash_root.as_ref().to_path_buf(),
            ledger,
            trash_lock: Mutex::new(()),
        }
    }

    pub fn trash_root(&self) -> &Path {
        &self.trash_root
    }

    /// Creates the trash directory if it is missing.
    pub fn prepare(&self) -> Result<(), TreeError> {
        Ok(self.storage.ensure_directory(&self.trash_root)?)
    }

    /// Creates `name` under `parent` and returns its relative path.
    ///
    /// Missing parent folders are created too. The name is trimmed and may
    /// not contain separators or `..`.
    pub fn create_folder(&self, actor: &Submitter, parent: &str, name: &str) -> Result<String, TreeError> {
        let _span = info_span!("create_folder", parent, name).entered();

        let name = name.trim();
        if name.is_empty() {
            return Err(TreeError::InvalidName {
                name: name.to_string(),
                reason: "folder name cannot be empty",
            });
        }
        if name.contains(['/', '\\']) || name.contains("..") {
            return Err(TreeError::InvalidName {
                name: name.to_string(),
                reason: "invalid characters in folder name",
            });
        }

        let parent = validation::clean_relative_path(parent)
            .ok_or_else(|| TreeError::AccessDenied(parent.to_string()))?;
        let relative = join_relative(&[&parent, name]);
        let target = self.locate(&relative)?;
        if std::fs::symlink_metadata(&target).is_ok() {
            return Err(TreeError::AlreadyExists(name.to_string()));
        }

        std::fs::create_dir_all(&target).map_err(|e| TreeError::Io {
            path: target.clone(),
            source: e,
        })?;

        log::info!("Created folder {}", relative);
        self.record(actor, ActivityKind::CreateFolder, &relative);
        Ok(relative)
    }

    /// Moves a file or folder into the trash as `<timestamp>_<name>`.
    ///
    /// The destination root itself cannot be deleted.
    pub fn delete_to_trash(&self, actor: &Submitter, path: &str) -> Result<TrashedItem, TreeError> {
        let _span = info_span!("delete", path).entered();

        let relative = validation::clean_relative_path(path)
            .ok_or_else(|| TreeError::AccessDenied(path.to_string()))?;
        if relative.is_empty() {
            return Err(TreeError::AccessDenied(path.to_string()));
        }
        let source = self.locate(&relative)?;
        if std::fs::symlink_metadata(&source).is_err() {
            return Err(TreeError::NotFound(relative));
        }

        let (_, base) = split_name(&relative);
        let wanted = format!("{}_{}", Local::now().format(TRASH_STAMP), base);

        let trash_name = {
            let _guard = self
                .trash_lock
                .lock()
                .map_err(|_| TreeError::Ledger(LedgerError::LockPoisoned))?;
            self.prepare()?;
            let resolved = resolver::resolve(&wanted, &self.trash_root, None, "", false)?;
            self.storage.relocate(&source, &resolved.stored_path)?;
            resolved.stored_name
        };

        log::info!(
            "Moved {} to trash as {}",
            sanitize::redact_path(Path::new(&relative)),
            trash_name
        );
        self.record(actor, ActivityKind::Delete, &relative);
        Ok(TrashedItem {
            path: relative,
            trash_name,
        })
    }

    /// Opens a file of the destination tree for download.
    pub fn open_file(&self, actor: &Submitter, path: &str) -> Result<FileDownload, TreeError> {
        let relative = validation::clean_relative_path(path)
            .ok_or_else(|| TreeError::AccessDenied(path.to_string()))?;
        let target = self.locate(&relative)?;
        if !target.is_file() {
            return Err(TreeError::NotFound(relative));
        }

        let file = File::open(&target).map_err(|e| TreeError::Io {
            path: target.clone(),
            source: e,
        })?;
        let size = file
            .metadata()
            .map_err(|e| TreeError::Io {
                path: target.clone(),
                source: e,
            })?
            .len();

        self.record(actor, ActivityKind::File, &relative);
        Ok(FileDownload {
            name: split_name(&relative).1.to_string(),
            path: relative,
            size,
            file,
        })
    }

    /// Writes every regular file below `folder` into a deflated zip archive,
    /// named by its path relative to the folder.
    ///
    /// Symlinks are not followed.
    pub fn export_folder<W: Write + Seek>(
        &self,
        actor: &Submitter,
        folder: &str,
        writer: W,
    ) -> Result<FolderArchive, TreeError> {
        let _span = info_span!("export_folder", folder).entered();

        let relative = validation::clean_relative_path(folder)
            .ok_or_else(|| TreeError::AccessDenied(folder.to_string()))?;
        let root = self.locate(&relative)?;
        if !root.is_dir() {
            return Err(TreeError::NotFound(relative));
        }

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(true);
        let mut archive = ZipWriter::new(writer);
        let mut files = 0;

        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                TreeError::Io {
                    path,
                    source: e.into(),
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(inner) = entry.path().strip_prefix(&root) else {
                continue;
            };
            let name = inner.to_string_lossy().replace('\\', "/");

            let io_error = |e: std::io::Error| TreeError::Io {
                path: entry.path().to_path_buf(),
                source: e,
            };
            let mut source = File::open(entry.path()).map_err(io_error)?;
            archive.start_file(name, options)?;
            std::io::copy(&mut source, &mut archive).map_err(io_error)?;
            files += 1;
        }
        archive.finish()?;

        let base = match split_name(&relative).1 {
            "" => root
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| "share".to_string()),
            name => name.to_string(),
        };
        log::info!("Exported {} file(s) from '{}'", files, relative);
        self.record(actor, ActivityKind::Folder, &relative);
        Ok(FolderArchive {
            name: format!("{}.zip", base),
            path: relative,
            files,
        })
    }

    /// Activity rows, oldest first.
    pub fn activity(&self) -> Result<Vec<ActivityRecord>, TreeError> {
        Ok(self.ledger.scan::<ActivityRecord>()?)
    }

    /// Absolute location of `relative`, refusing anything whose deepest
    /// existing ancestor resolves outside the destination root.
    fn locate(&self, relative: &str) -> Result<PathBuf, TreeError> {
        let denied = || TreeError::AccessDenied(relative.to_string());
        let root = self
            .storage
            .destination_root()
            .canonicalize()
            .map_err(|e| TreeError::Io {
                path: self.storage.destination_root().to_path_buf(),
                source: e,
            })?;

        let target = root.join(relative);
        let mut existing = target.as_path();
        while std::fs::symlink_metadata(existing).is_err() {
            existing = existing.parent().ok_or_else(denied)?;
        }
        let resolved = existing.canonicalize().map_err(|_| denied())?;
        if !resolved.starts_with(&root) {
            log::warn!("Refusing path outside the destination tree: {}", relative);
            return Err(denied());
        }
        Ok(target)
    }

    fn record(&self, actor: &Submitter, kind: ActivityKind, path: &str) {
        let actor = match actor.identity.trim() {
            "" => "unknown".to_string(),
            identity => identity.to_string(),
        };
        let row = ActivityRecord {
            at: record::now(),
            actor,
            kind,
            path: path.to_string(),
        };
        if let Err(e) = self.ledger.append(row) {
            log::error!("Failed to record {:?} of {}: {}", kind, path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerPaths;
    use std::io::{Cursor, Read};
    use tempfile::TempDir;

    fn tree() -> (TempDir, ShareTree) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path().join("staging"), dir.path().join("share"));
        storage.prepare().unwrap();
        let ledger = Arc::new(LedgerStore::new(LedgerPaths::in_directory(
            dir.path().join("logs"),
        )));
        let tree = ShareTree::new(storage, dir.path().join("trash"), ledger);
        tree.prepare().unwrap();
        (dir, tree)
    }

    fn admin() -> Submitter {
        Submitter::new("admin@example.com", Some(1))
    }

    fn seed(dir: &TempDir, relative: &str, content: &[u8]) {
        let path = dir.path().join("share").join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_create_folder_records_activity() {
        let (dir, tree) = tree();

        let created = tree.create_folder(&admin(), "/courses/", "  week1 ").unwrap();

        assert_eq!(created, "courses/week1");
        assert!(dir.path().join("share/courses/week1").is_dir());
        let rows = tree.activity().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, ActivityKind::CreateFolder);
        assert_eq!(rows[0].path, "courses/week1");
        assert_eq!(rows[0].actor, "admin@example.com");
    }

    #[test]
    fn test_create_folder_rejects_bad_names() {
        let (_dir, tree) = tree();

        for name in ["", "   ", "a/b", "a\\b", "..", "x..y"] {
            assert!(
                matches!(
                    tree.create_folder(&admin(), "", name),
                    Err(TreeError::InvalidName { .. })
                ),
                "{:?} should be rejected",
                name
            );
        }
        assert!(tree.activity().unwrap().is_empty());
    }

    #[test]
    fn test_create_folder_refuses_escaping_parent() {
        let (dir, tree) = tree();

        let result = tree.create_folder(&admin(), "../../", "evil");

        assert!(matches!(result, Err(TreeError::AccessDenied(_))));
        assert!(!dir.path().join("evil").exists());
    }

    #[test]
    fn test_create_folder_existing_conflicts() {
        let (_dir, tree) = tree();
        tree.create_folder(&admin(), "", "docs").unwrap();

        assert!(matches!(
            tree.create_folder(&admin(), "", "docs"),
            Err(TreeError::AlreadyExists(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_parent_outside_root_is_refused() {
        let (dir, tree) = tree();
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, dir.path().join("share/link")).unwrap();

        assert!(matches!(
            tree.create_folder(&admin(), "link", "inner"),
            Err(TreeError::AccessDenied(_))
        ));
        assert!(!outside.join("inner").exists());
    }

    #[test]
    fn test_delete_moves_item_to_trash() {
        let (dir, tree) = tree();
        seed(&dir, "docs/old.pdf", b"old");

        let trashed = tree.delete_to_trash(&admin(), "docs/old.pdf").unwrap();

        assert!(!dir.path().join("share/docs/old.pdf").exists());
        assert!(trashed.trash_name.ends_with("_old.pdf"));
        assert_eq!(trashed.trash_name.len(), "YYYYmmdd_HHMMSS_old.pdf".len());
        assert_eq!(
            std::fs::read(dir.path().join("trash").join(&trashed.trash_name)).unwrap(),
            b"old"
        );
        let rows = tree.activity().unwrap();
        assert_eq!(rows[0].kind, ActivityKind::Delete);
        assert_eq!(rows[0].path, "docs/old.pdf");
    }

    #[test]
    fn test_delete_same_name_twice_keeps_both() {
        let (dir, tree) = tree();
        seed(&dir, "a/notes.txt", b"first");
        seed(&dir, "b/notes.txt", b"second");

        let first = tree.delete_to_trash(&admin(), "a/notes.txt").unwrap();
        let second = tree.delete_to_trash(&admin(), "b/notes.txt").unwrap();

        assert_ne!(first.trash_name, second.trash_name);
        assert_eq!(std::fs::read_dir(dir.path().join("trash")).unwrap().count(), 2);
    }

    #[test]
    fn test_delete_folder_moves_whole_tree() {
        let (dir, tree) = tree();
        seed(&dir, "course/week1/a.txt", b"a");

        let trashed = tree.delete_to_trash(&admin(), "course").unwrap();

        assert!(!dir.path().join("share/course").exists());
        assert!(dir
            .path()
            .join("trash")
            .join(&trashed.trash_name)
            .join("week1/a.txt")
            .is_file());
    }

    #[test]
    fn test_delete_refuses_root_traversal_and_missing() {
        let (dir, tree) = tree();
        std::fs::write(dir.path().join("secret.txt"), b"s").unwrap();

        assert!(matches!(
            tree.delete_to_trash(&admin(), "../secret.txt"),
            Err(TreeError::AccessDenied(_))
        ));
        assert!(matches!(
            tree.delete_to_trash(&admin(), "/"),
            Err(TreeError::AccessDenied(_))
        ));
        assert!(matches!(
            tree.delete_to_trash(&admin(), "nope.txt"),
            Err(TreeError::NotFound(_))
        ));
        assert!(dir.path().join("secret.txt").exists());
        assert!(tree.activity().unwrap().is_empty());
    }

    #[test]
    fn test_open_file_logs_download() {
        let (dir, tree) = tree();
        seed(&dir, "docs/a.txt", b"hello");

        let mut download = tree.open_file(&Submitter::new("", None), "/docs/a.txt").unwrap();
        let mut content = String::new();
        download.file.read_to_string(&mut content).unwrap();

        assert_eq!(download.name, "a.txt");
        assert_eq!(download.size, 5);
        assert_eq!(content, "hello");
        let rows = tree.activity().unwrap();
        assert_eq!(rows[0].kind, ActivityKind::File);
        assert_eq!(rows[0].actor, "unknown");
    }

    #[test]
    fn test_open_file_rejects_folders_and_escapes() {
        let (dir, tree) = tree();
        seed(&dir, "docs/a.txt", b"hello");

        assert!(matches!(
            tree.open_file(&admin(), "docs"),
            Err(TreeError::NotFound(_))
        ));
        assert!(matches!(
            tree.open_file(&admin(), "../logs/download_log.csv"),
            Err(TreeError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_export_folder_zips_files_with_relative_names() {
        let (dir, tree) = tree();
        seed(&dir, "course/intro.txt", b"intro");
        seed(&dir, "course/week1/notes.txt", b"notes");
        seed(&dir, "other/skip.txt", b"skip");

        let mut buffer = Cursor::new(Vec::new());
        let archive = tree.export_folder(&admin(), "course", &mut buffer).unwrap();

        assert_eq!(archive.name, "course.zip");
        assert_eq!(archive.files, 2);

        let mut zip = zip::ZipArchive::new(Cursor::new(buffer.into_inner())).unwrap();
        let mut names: Vec<String> = zip.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["intro.txt", "week1/notes.txt"]);

        let mut notes = String::new();
        zip.by_name("week1/notes.txt")
            .unwrap()
            .read_to_string(&mut notes)
            .unwrap();
        assert_eq!(notes, "notes");

        let rows = tree.activity().unwrap();
        assert_eq!(rows[0].kind, ActivityKind::Folder);
        assert_eq!(rows[0].path, "course");
    }

    #[test]
    fn test_export_missing_folder_is_not_found() {
        let (_dir, tree) = tree();

        let result = tree.export_folder(&admin(), "nothing", Cursor::new(Vec::new()));

        assert!(matches!(result, Err(TreeError::NotFound(_))));
        assert!(tree.activity().unwrap().is_empty());
    }
}
