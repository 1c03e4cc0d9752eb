use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AlmaError {
    #[error("invalid archive uid: {0}")]
    InvalidUid(String),

    #[error("unrecognized deliverable kind: {0}")]
    InvalidKind(String),

    #[error("invalid artifact selection: {0}")]
    InvalidSelection(String),

    #[error("invalid date (expected YYYY-MM-DD): {0}")]
    InvalidDate(String),

    #[error("destination is required: pass --dest or set paths.dest in the config")]
    MissingDestination,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("archive request failed: {0}")]
    ArchiveHttp(String),

    #[error("archive returned status {status}: {message}")]
    ArchiveStatus { status: u16, message: String },

    #[error("transfer of {filename} interrupted: {message}")]
    #[diagnostic(help("transient; the transfer resumes from the persisted offset on the next run"))]
    TransientTransfer { filename: String, message: String },

    #[error("verification failed for {filename}: {message}")]
    #[diagnostic(help("the partial file is discarded and the artifact is fetched again"))]
    Verification { filename: String, message: String },

    #[error("failed to extract {archive}: {message}")]
    Extraction { archive: String, message: String },

    #[error("unreadable document at {path}: {message}")]
    #[diagnostic(help("the document is left untouched; repair or move it before re-running"))]
    DocumentCorruption { path: PathBuf, message: String },

    #[error("refusing {action}: {reason}")]
    PolicyViolation { action: String, reason: String },

    #[error("ambiguous merge for {mous_uid}: {message}")]
    AmbiguousProvenance { mous_uid: String, message: String },

    #[error("index database error: {0}")]
    Index(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl AlmaError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AlmaError::TransientTransfer { .. } | AlmaError::Verification { .. }
        )
    }

    pub fn transient(filename: &str, message: impl Into<String>) -> Self {
        AlmaError::TransientTransfer {
            filename: filename.to_string(),
            message: message.into(),
        }
    }

    pub fn extraction(archive: &std::path::Path, message: impl Into<String>) -> Self {
        AlmaError::Extraction {
            archive: archive.display().to_string(),
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for AlmaError {
    fn from(err: rusqlite::Error) -> Self {
        AlmaError::Index(err.to_string())
    }
}
