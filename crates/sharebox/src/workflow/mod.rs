//! Upload workflow: submission, review and relocation.
//!
//! An upload is pending, approved or declined depending on which ledger
//! holds its row. Every operation performs its physical file operation
//! first and only then touches the ledgers, so a failure in between leaves
//! an orphaned file rather than a row pointing at nothing. There is no
//! rollback across the steps.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::WorkflowError;
use crate::ledger::{LedgerStore, PendingRecord};
use crate::resolver::FilenameResolver;
use crate::sequence::Sequences;
use crate::storage::FileStorage;
use crate::validation::UploadPolicy;

pub mod listing;
pub mod review;
pub mod submit;

pub use listing::{UploadStatus, UploadSummary};
pub use submit::{FailureKind, StoredUpload, SubmitFailure, SubmitReport, Submission};

/// Attempts at claiming a resolved name before giving up.
const CLAIM_ATTEMPTS: usize = 16;

/// How a caller names a pending upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadRef {
    Id(u64),
    /// Stored name or logical path, for callers that lack the id.
    Name(String),
}

impl FromStr for UploadRef {
    type Err = Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        Ok(match value.parse::<u64>() {
            Ok(id) => UploadRef::Id(id),
            Err(_) => UploadRef::Name(value.to_string()),
        })
    }
}

impl From<u64> for UploadRef {
    fn from(id: u64) -> Self {
        UploadRef::Id(id)
    }
}

impl fmt::Display for UploadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadRef::Id(id) => write!(f, "#{}", id),
            UploadRef::Name(name) => write!(f, "{}", name),
        }
    }
}

pub struct UploadWorkflow {
    ledger: Arc<LedgerStore>,
    sequences: Arc<Sequences>,
    storage: FileStorage,
    resolver: FilenameResolver,
    policy: UploadPolicy,
}

impl UploadWorkflow {
    pub fn new(
        ledger: Arc<LedgerStore>,
        sequences: Arc<Sequences>,
        storage: FileStorage,
        policy: UploadPolicy,
    ) -> Self {
        let resolver = FilenameResolver::new(storage.staging_root(), storage.destination_root());
        Self {
            ledger,
            sequences,
            storage,
            resolver,
            policy,
        }
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn storage(&self) -> &FileStorage {
        &self.storage
    }

    /// Finds the pending row `target` refers to.
    ///
    /// A name only resolves when exactly one pending row carries it as
    /// stored name or logical path.
    fn lookup_pending(&self, target: &UploadRef) -> Result<Option<PendingRecord>, WorkflowError> {
        match target {
            UploadRef::Id(id) => Ok(self.ledger.find_by_id::<PendingRecord>(*id)?),
            UploadRef::Name(name) => {
                let mut matches = self.ledger.find_by_name_or_path::<PendingRecord>(name)?;
                match matches.len() {
                    0 => Ok(None),
                    1 => Ok(matches.pop()),
                    n => Err(WorkflowError::Ambiguous {
                        target: name.clone(),
                        matches: n,
                    }),
                }
            }
        }
    }
}
