//! Backups and rollback sessions for Cortex bulk edits.
//!
//! Every file a batch is about to change is copied into a per-session
//! directory together with its SHA-256 checksum. Session metadata is written
//! durably so a later process can still roll the batch back.
//!
//! Layout:
//! ```text
//! <backup_root>/
//!   <session id>/
//!     session.json
//!     0000-main.rs.bak
//!     0001-lib.rs.bak
//! ```

pub mod checksum;
pub mod paths;
pub mod record;
pub mod registry;
pub mod session;
pub mod store;

pub use checksum::{file_checksum, sha256_hex};
pub use paths::{BACKUP_DIR_ENV, SESSION_FILE, default_backup_root};
pub use record::BackupRecord;
pub use registry::{SessionRegistry, SharedSession};
pub use session::{Session, SessionState, SessionSummary};
pub use store::BackupStore;

use std::path::PathBuf;
use thiserror::Error;

/// Backup error types.
#[derive(Debug, Error)]
pub enum BackupError {
    /// IO error outside of a specific file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Session metadata could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create directory {path}: {source}")]
    CreateDirFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The backup copy does not match the bytes it was taken from.
    #[error("Backup of {path} does not match the original after copying")]
    CopyMismatch { path: PathBuf },

    #[error("Backup file missing: {0}")]
    BackupMissing(PathBuf),

    #[error("Backup {path} is corrupted: expected {expected}, found {actual}")]
    BackupCorrupted {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

/// Result type for backup operations.
pub type Result<T> = std::result::Result<T, BackupError>;
