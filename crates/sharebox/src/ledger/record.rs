//! Row types of the upload and activity ledgers.
//!
//! Column order is the persisted order; rows are encoded and decoded by
//! position, so reordering fields here changes the on-disk format.

use chrono::{Local, NaiveDateTime, Timelike};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::LedgerKind;

/// Wall-clock timestamp format shared by every ledger.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current local time truncated to whole seconds, as stored in ledgers.
pub fn now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

pub(crate) mod timestamp {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TIMESTAMP_FORMAT;

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Behaviour shared by all ledger row types.
pub trait LedgerRecord: Serialize + DeserializeOwned + Clone + Send + 'static {
    const KIND: LedgerKind;
    const HEADER: &'static [&'static str];

    /// Identifier of the upload this row describes, when the row carries one.
    fn upload_id(&self) -> Option<u64>;

    /// Whether `value` names this row's stored file or its logical path.
    fn matches_name(&self, value: &str) -> bool;
}

/// A submission awaiting review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub upload_id: u64,
    #[serde(with = "timestamp")]
    pub submitted_at: NaiveDateTime,
    pub submitter: String,
    pub user_id: Option<u64>,
    /// Flat file name inside the staging root.
    pub stored_name: String,
    /// Suggested destination, including any folder structure of the upload.
    pub logical_path: String,
}

impl LedgerRecord for PendingRecord {
    const KIND: LedgerKind = LedgerKind::Pending;
    const HEADER: &'static [&'static str] =
        &["upload_id", "timestamp", "email", "user_id", "filename", "path"];

    fn upload_id(&self) -> Option<u64> {
        Some(self.upload_id)
    }

    fn matches_name(&self, value: &str) -> bool {
        self.stored_name == value || self.logical_path == value
    }
}

/// An approved upload living in the destination tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedRecord {
    pub upload_id: u64,
    #[serde(with = "timestamp")]
    pub submitted_at: NaiveDateTime,
    #[serde(with = "timestamp")]
    pub approved_at: NaiveDateTime,
    pub submitter: String,
    pub user_id: Option<u64>,
    pub stored_name: String,
    /// Location relative to the destination root.
    pub final_path: String,
}

impl CompletedRecord {
    /// Last component of the final path; what users see and search for.
    pub fn file_name(&self) -> &str {
        self.final_path
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.stored_name)
    }
}

impl LedgerRecord for CompletedRecord {
    const KIND: LedgerKind = LedgerKind::Completed;
    const HEADER: &'static [&'static str] = &[
        "upload_id",
        "original_timestamp",
        "approval_timestamp",
        "email",
        "user_id",
        "filename",
        "final_path",
    ];

    fn upload_id(&self) -> Option<u64> {
        Some(self.upload_id)
    }

    fn matches_name(&self, value: &str) -> bool {
        self.stored_name == value || self.final_path == value
    }
}

/// A rejected submission. Declined rows do not keep the upload id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclinedRecord {
    #[serde(with = "timestamp")]
    pub declined_at: NaiveDateTime,
    pub submitter: String,
    pub user_id: Option<u64>,
    pub stored_name: String,
}

impl LedgerRecord for DeclinedRecord {
    const KIND: LedgerKind = LedgerKind::Declined;
    const HEADER: &'static [&'static str] = &["timestamp", "email", "user_id", "filename"];

    fn upload_id(&self) -> Option<u64> {
        None
    }

    fn matches_name(&self, value: &str) -> bool {
        self.stored_name == value
    }
}

/// What an activity row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityKind {
    /// A single file was downloaded.
    File,
    /// A folder was downloaded as an archive.
    Folder,
    /// An item was moved to the trash.
    Delete,
    CreateFolder,
}

/// One access to or change of the destination tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    #[serde(with = "timestamp")]
    pub at: NaiveDateTime,
    pub actor: String,
    pub kind: ActivityKind,
    /// Item path relative to the destination root.
    pub path: String,
}

impl LedgerRecord for ActivityRecord {
    const KIND: LedgerKind = LedgerKind::Activity;
    const HEADER: &'static [&'static str] = &["timestamp", "email", "type", "path"];

    fn upload_id(&self) -> Option<u64> {
        None
    }

    fn matches_name(&self, value: &str) -> bool {
        self.path == value
    }
}
