use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShareboxError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Share tree error: {0}")]
    Tree(#[from] TreeError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed ledger '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Failed to replace ledger '{path}': {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },

    #[error("Ledger lock poisoned")]
    LockPoisoned,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove '{path}': {source}")]
    RemoveFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No free name could be found for '{0}'")]
    NameExhausted(PathBuf),
}

/// Rejections raised before any side effect takes place.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("File type not allowed: {name}")]
    DisallowedExtension { name: String },

    #[error("Malicious file detected: {name}")]
    ExecutableContent { name: String },

    #[error("Invalid path in filename: '{name}'")]
    PathTraversal { name: String },

    #[error("No files selected")]
    EmptySubmission,

    #[error("Failed to read upload stream for '{name}': {source}")]
    UnreadableStream {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Upload '{target}' not found")]
    NotFound { target: String },

    #[error("Item '{target}' was already removed")]
    AlreadyRemoved { target: String },

    #[error("'{target}' matches {matches} pending uploads; specify the upload id")]
    Ambiguous { target: String, matches: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl WorkflowError {
    /// True for conditions callers should surface as "already handled".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            WorkflowError::NotFound { .. } | WorkflowError::AlreadyRemoved { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Search index is not ready; a rebuild has been scheduled")]
    NotReady,

    #[error("Access denied for path '{0}'")]
    AccessDenied(String),

    #[error("Directory not found: '{0}'")]
    NotFound(String),

    #[error("Index I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("Invalid folder name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Access denied for path '{0}'")]
    AccessDenied(String),

    #[error("File or folder not found: '{0}'")]
    NotFound(String),

    #[error("A folder or file named '{0}' already exists")]
    AlreadyExists(String),

    #[error("I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub type Result<T> = std::result::Result<T, ShareboxError>;
