//! Collision-free naming across the staging area and the destination tree.

use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// Outcome of a name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    /// File name actually used on disk, possibly suffixed.
    pub stored_name: String,
    /// Full path the file is to be written to.
    pub stored_path: PathBuf,
    /// Directory part of the desired name plus `stored_name`, `/`-separated.
    pub logical_path: String,
}

/// Joins relative path pieces with `/`, skipping empty ones.
pub(crate) fn join_relative(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|part| part.split(['/', '\\']))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Splits `name` into its `/`-normalized directory part and base name.
pub(crate) fn split_name(name: &str) -> (String, &str) {
    match name.rfind(['/', '\\']) {
        Some(pos) => (join_relative(&[&name[..pos]]), &name[pos + 1..]),
        None => (String::new(), name),
    }
}

/// `base` for attempt 0, then `stem_N.ext` (or `base_N` without extension).
fn candidate(base: &str, attempt: u32) -> String {
    if attempt == 0 {
        return base.to_string();
    }
    match base.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &base[..dot], attempt, &base[dot..]),
        _ => format!("{}_{}", base, attempt),
    }
}

fn occupied(path: &Path) -> bool {
    // symlink_metadata also sees dangling symlinks
    std::fs::symlink_metadata(path).is_ok()
}

/// Finds the first free variant of `desired_name`.
///
/// With `flatten`, the file goes directly under `storage_root` and a
/// candidate must also be free at `destination_root/destination_subpath/<dir
/// part>/`. Without it, the directory part is kept under `storage_root` and
/// only that tree is checked.
pub fn resolve(
    desired_name: &str,
    storage_root: &Path,
    destination_root: Option<&Path>,
    destination_subpath: &str,
    flatten: bool,
) -> Result<ResolvedName, StorageError> {
    let (dir_part, base) = split_name(desired_name);

    let target_dir = if flatten || dir_part.is_empty() {
        storage_root.to_path_buf()
    } else {
        storage_root.join(&dir_part)
    };
    let destination_dir = destination_root
        .filter(|_| flatten)
        .map(|root| root.join(join_relative(&[destination_subpath, &dir_part])));

    for attempt in 0..=u32::MAX {
        let name = candidate(base, attempt);
        let stored_path = target_dir.join(&name);
        if occupied(&stored_path) {
            continue;
        }
        if let Some(dir) = &destination_dir {
            if occupied(&dir.join(&name)) {
                continue;
            }
        }

        return Ok(ResolvedName {
            logical_path: join_relative(&[&dir_part, &name]),
            stored_name: name,
            stored_path,
        });
    }

    Err(StorageError::NameExhausted(target_dir.join(base)))
}

/// The portal's two trees, bound once.
#[derive(Debug, Clone)]
pub struct FilenameResolver {
    staging_root: PathBuf,
    destination_root: PathBuf,
}

impl FilenameResolver {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(staging_root: P, destination_root: Q) -> Self {
        Self {
            staging_root: staging_root.as_ref().to_path_buf(),
            destination_root: destination_root.as_ref().to_path_buf(),
        }
    }

    /// Flat staging name that is also free at its eventual destination.
    pub fn for_submission(
        &self,
        desired_name: &str,
        destination_subpath: &str,
    ) -> Result<ResolvedName, StorageError> {
        resolve(
            desired_name,
            &self.staging_root,
            Some(&self.destination_root),
            destination_subpath,
            true,
        )
    }

    /// Free name for a relative path inside the destination tree.
    pub fn in_destination(&self, relative_path: &str) -> Result<ResolvedName, StorageError> {
        resolve(relative_path, &self.destination_root, None, "", false)
    }
}
