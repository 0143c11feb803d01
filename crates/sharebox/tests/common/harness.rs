//! Isolated portal instance rooted in a temporary data directory.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use sharebox::workflow::StoredUpload;
use sharebox::{CompletedRecord, Config, PendingRecord, Portal, Submission, Submitter, UploadRef};

pub struct TestHarness {
    temp_dir: TempDir,
    pub config: Config,
    pub portal: Portal,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Builds a harness after letting the caller adjust the default config.
    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let mut config = Config::with_data_directory(temp_dir.path());
        adjust(&mut config);
        let portal = Portal::open(config.clone()).expect("Failed to open portal");
        Self {
            temp_dir,
            config,
            portal,
        }
    }

    pub fn data_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.config.staging_root()
    }

    pub fn destination_dir(&self) -> PathBuf {
        self.config.destination_root()
    }

    pub fn member(&self) -> Submitter {
        Submitter::new("member@example.com", Some(7))
    }

    /// Writes a file straight into the staging directory.
    pub fn seed_staging(&self, name: &str, content: &[u8]) -> PathBuf {
        write_file(&self.staging_dir().join(name), content)
    }

    /// Writes a file straight into the shared tree.
    pub fn seed_destination(&self, relative: &str, content: &[u8]) -> PathBuf {
        write_file(&self.destination_dir().join(relative), content)
    }

    pub fn submit(&self, name: &str, content: &[u8]) -> StoredUpload {
        self.submit_into("", name, content)
    }

    pub fn submit_into(&self, subpath: &str, name: &str, content: &[u8]) -> StoredUpload {
        self.portal
            .submit(&self.member(), subpath, Submission::from_bytes(name, content))
            .expect("Submission failed")
    }

    /// Submits and approves in one step.
    pub fn publish(&self, subpath: &str, name: &str, content: &[u8]) -> CompletedRecord {
        let stored = self.submit_into(subpath, name, content);
        self.portal
            .approve(&UploadRef::Id(stored.upload_id), None)
            .expect("Approval failed")
    }

    pub fn pending_rows(&self) -> usize {
        self.portal
            .ledger()
            .count::<PendingRecord>()
            .expect("Failed to read pending ledger")
    }

    pub fn completed_rows(&self) -> usize {
        self.portal
            .completed()
            .expect("Failed to read completed ledger")
            .len()
    }

    pub fn declined_rows(&self) -> usize {
        self.portal
            .declined()
            .expect("Failed to read declined ledger")
            .len()
    }
}

fn write_file(path: &Path, content: &[u8]) -> PathBuf {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent directory");
    }
    fs::write(path, content).expect("Failed to write file");
    path.to_path_buf()
}
