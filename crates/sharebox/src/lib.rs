pub mod config;
pub mod error;
pub mod identity;
pub mod index;
pub mod ledger;
pub mod portal;
pub mod resolver;
pub mod sanitize;
pub mod sequence;
pub mod storage;
pub mod tree;
pub mod validation;
pub mod workflow;

pub use config::{load_config, Config};
pub use error::{
    ConfigError, IndexError, LedgerError, Result, ShareboxError, StorageError, TreeError,
    ValidationError, WorkflowError,
};
pub use identity::{Caller, Permission, Role, Submitter};
pub use index::{IndexScheduler, IndexStats, Listing, SearchHit, SearchIndex};
pub use ledger::{
    ActivityKind, ActivityRecord, CompletedRecord, DeclinedRecord, LedgerEvent, LedgerKind,
    LedgerStore, PendingRecord,
};
pub use portal::Portal;
pub use sequence::{Namespace, SequenceAllocator};
pub use tree::{FileDownload, FolderArchive, ShareTree, TrashedItem};
pub use workflow::{SubmitReport, Submission, UploadRef, UploadStatus, UploadSummary, UploadWorkflow};
