use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default = "default_data_directory")]
    pub data_directory: String,
    #[serde(default = "default_staging_directory")]
    pub staging_directory: String,
    #[serde(default = "default_destination_directory")]
    pub destination_directory: String,
    /// Where deleted items from the destination tree are moved.
    #[serde(default = "default_trash_directory")]
    pub trash_directory: String,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub ledgers: LedgerFilesConfig,
}

fn default_data_directory() -> String {
    dirs::data_dir()
        .map(|p| p.join("sharebox").to_string_lossy().to_string())
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|p| p.join(".sharebox").to_string_lossy().to_string())
                .unwrap_or_else(|| "/var/lib/sharebox".to_string())
        })
}

fn default_staging_directory() -> String {
    "server_files/uploads".to_string()
}

fn default_destination_directory() -> String {
    "server_files/files_to_share".to_string()
}

fn default_trash_directory() -> String {
    "server_files/trash".to_string()
}

fn default_allowed_extensions() -> Vec<String> {
    [
        "txt", "pdf", "png", "jpg", "jpeg", "gif", "zip", "rar", "7z", "doc", "docx", "xls",
        "xlsx", "ppt", "pptx", "mp4", "mov", "avi", "mkv",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            data_directory: default_data_directory(),
            staging_directory: default_staging_directory(),
            destination_directory: default_destination_directory(),
            trash_directory: default_trash_directory(),
            allowed_extensions: default_allowed_extensions(),
            index: IndexConfig::default(),
            ledgers: LedgerFilesConfig::default(),
        }
    }
}

impl Config {
    /// Default configuration rooted at `data_directory`.
    pub fn with_data_directory<P: AsRef<Path>>(data_directory: P) -> Self {
        Self {
            data_directory: data_directory.as_ref().to_string_lossy().to_string(),
            ..Self::default()
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_directory)
    }

    /// Relative paths are anchored at the data directory; absolute ones are kept.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.data_dir().join(candidate)
        }
    }

    pub fn staging_root(&self) -> PathBuf {
        self.resolve(&self.staging_directory)
    }

    pub fn destination_root(&self) -> PathBuf {
        self.resolve(&self.destination_directory)
    }

    pub fn trash_root(&self) -> PathBuf {
        self.resolve(&self.trash_directory)
    }

    pub fn shard_root(&self) -> PathBuf {
        self.resolve(&self.index.shard_directory)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Ledger inactivity after which the search shards are rebuilt.
    #[serde(default = "default_quiet_period")]
    pub quiet_period_secs: u64,
    /// How often the scheduler samples the pending ledger.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_shard_directory")]
    pub shard_directory: String,
}

fn default_quiet_period() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    5
}

fn default_shard_directory() -> String {
    "cache/search".to_string()
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            quiet_period_secs: default_quiet_period(),
            poll_interval_secs: default_poll_interval(),
            shard_directory: default_shard_directory(),
        }
    }
}

impl IndexConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_secs(self.quiet_period_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Locations of the ledger, counter and user database files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerFilesConfig {
    #[serde(default = "default_pending")]
    pub pending: String,
    #[serde(default = "default_completed")]
    pub completed: String,
    #[serde(default = "default_declined")]
    pub declined: String,
    /// Downloads, deletions and folder creation in the destination tree.
    #[serde(default = "default_activity")]
    pub activity: String,
    #[serde(default = "default_upload_sequence")]
    pub upload_sequence: String,
    #[serde(default = "default_user_sequence")]
    pub user_sequence: String,
    #[serde(default = "default_user_databases")]
    pub user_databases: Vec<String>,
}

fn default_pending() -> String {
    "logs/upload_pending_log.csv".to_string()
}

fn default_completed() -> String {
    "logs/upload_completed_log.csv".to_string()
}

fn default_declined() -> String {
    "logs/declined_log.csv".to_string()
}

fn default_activity() -> String {
    "logs/download_log.csv".to_string()
}

fn default_upload_sequence() -> String {
    "logs/upload_id_sequence.txt".to_string()
}

fn default_user_sequence() -> String {
    "data/user_id_sequence.txt".to_string()
}

fn default_user_databases() -> Vec<String> {
    vec![
        "data/auth_users.csv".to_string(),
        "data/new_users.csv".to_string(),
        "data/denied_users.csv".to_string(),
    ]
}

impl Default for LedgerFilesConfig {
    fn default() -> Self {
        Self {
            pending: default_pending(),
            completed: default_completed(),
            declined: default_declined(),
            activity: default_activity(),
            upload_sequence: default_upload_sequence(),
            user_sequence: default_user_sequence(),
            user_databases: default_user_databases(),
        }
    }
}
