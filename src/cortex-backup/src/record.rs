//! Per-file backup records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What a session knows about one file it touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// File the batch changed.
    pub original_path: PathBuf,
    /// Copy of the pre-edit bytes. `None` when the file did not exist.
    pub backup_path: Option<PathBuf>,
    /// Checksum of the pre-edit content. `None` when the file did not exist.
    pub original_checksum: Option<String>,
    /// Checksum of the backup copy, verified right after copying.
    pub backup_checksum: Option<String>,
    pub backup_size_bytes: u64,
    /// The batch created this file; rollback removes it.
    pub was_created: bool,
    /// The batch deleted this file; rollback restores it.
    #[serde(default)]
    pub was_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl BackupRecord {
    /// Record for a file that did not exist before the batch.
    pub fn created(original_path: PathBuf) -> Self {
        Self {
            original_path,
            backup_path: None,
            original_checksum: None,
            backup_checksum: None,
            backup_size_bytes: 0,
            was_created: true,
            was_deleted: false,
            created_at: Utc::now(),
        }
    }

    pub fn has_backup(&self) -> bool {
        self.backup_path.is_some()
    }
}
