//! Rollback sessions.

use crate::record::BackupRecord;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Can be rolled back.
    Active,
    RolledBack,
    /// Past its retention window; backups are being discarded.
    Expired,
}

/// Backups taken for one committed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Directory holding the backup copies and `session.json`.
    pub directory: PathBuf,
    /// Edit sets committed in this session.
    #[serde(default)]
    pub edit_sets: Vec<String>,
    /// One record per touched file, in backup order.
    pub records: Vec<BackupRecord>,
    pub state: SessionState,
}

impl Session {
    /// New active session stored under `root/<id>`.
    pub fn new(root: &Path, description: Option<String>, retention: Duration) -> Self {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        Self {
            directory: root.join(&id),
            id,
            description,
            created_at,
            expires_at: created_at + retention,
            edit_sets: Vec::new(),
            records: Vec::new(),
            state: SessionState::Active,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn record_for(&self, path: &Path) -> Option<&BackupRecord> {
        self.records.iter().find(|r| r.original_path == path)
    }

    /// Flag a backed-up file as deleted by the batch.
    pub fn mark_deleted(&mut self, path: &Path) -> bool {
        match self.records.iter_mut().find(|r| r.original_path == path) {
            Some(record) => {
                record.was_deleted = true;
                true
            }
            None => false,
        }
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.directory.join(crate::paths::SESSION_FILE)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            description: self.description.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            file_count: self.records.len(),
            edit_sets: self.edit_sets.clone(),
            state: self.state,
        }
    }
}

/// Listing entry for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub file_count: usize,
    pub edit_sets: Vec<String>,
    pub state: SessionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_expiry() {
        let session = Session::new(Path::new("/backups"), None, Duration::days(7));
        assert!(session.is_active());
        assert!(!session.is_expired());
        assert!(session.is_expired_at(session.created_at + Duration::days(7)));
        assert_eq!(session.directory, Path::new("/backups").join(&session.id));
        assert!(session.metadata_path().ends_with("session.json"));
    }

    #[test]
    fn test_mark_deleted() {
        let mut session = Session::new(Path::new("/b"), None, Duration::days(1));
        session
            .records
            .push(BackupRecord::created(PathBuf::from("/w/a.txt")));
        assert!(session.mark_deleted(Path::new("/w/a.txt")));
        assert!(!session.mark_deleted(Path::new("/w/b.txt")));
        assert!(session.record_for(Path::new("/w/a.txt")).unwrap().was_deleted);
    }
}
