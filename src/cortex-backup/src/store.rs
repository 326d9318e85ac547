//! On-disk backup store.

use crate::checksum::sha256_hex;
use crate::paths::SESSION_FILE;
use crate::record::BackupRecord;
use crate::session::Session;
use crate::{BackupError, Result};
use chrono::{DateTime, Duration, Utc};
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Copies files into session directories and persists session metadata.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a session and its directory.
    pub async fn begin_session(
        &self,
        description: Option<String>,
        retention: Duration,
    ) -> Result<Session> {
        let session = Session::new(&self.root, description, retention);
        fs::create_dir_all(&session.directory)
            .await
            .map_err(|source| BackupError::CreateDirFailed {
                path: session.directory.clone(),
                source,
            })?;
        debug!(session_id = %session.id, dir = %session.directory.display(), "Backup session started");
        Ok(session)
    }

    /// Back up `path` into `session`, once.
    ///
    /// A second call for a path the session already holds returns the
    /// existing record without copying again, so the first pre-edit content
    /// always wins. A missing file yields a `was_created` record.
    pub async fn snapshot_file(&self, session: &mut Session, path: &Path) -> Result<BackupRecord> {
        if let Some(existing) = session.record_for(path) {
            return Ok(existing.clone());
        }

        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let record = BackupRecord::created(path.to_path_buf());
                session.records.push(record.clone());
                debug!(session_id = %session.id, file = %path.display(), "No pre-edit content; file will be created");
                return Ok(record);
            }
            Err(source) => {
                return Err(BackupError::ReadFailed {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let original_checksum = sha256_hex(&bytes);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let backup_path = session
            .directory
            .join(format!("{:04}-{}.bak", session.records.len(), name));

        write_synced(&backup_path, &bytes).await?;

        let copied = fs::read(&backup_path)
            .await
            .map_err(|source| BackupError::ReadFailed {
                path: backup_path.clone(),
                source,
            })?;
        let backup_checksum = sha256_hex(&copied);
        if backup_checksum != original_checksum {
            warn!(file = %path.display(), "Backup copy checksum mismatch");
            return Err(BackupError::CopyMismatch {
                path: path.to_path_buf(),
            });
        }

        let record = BackupRecord {
            original_path: path.to_path_buf(),
            backup_path: Some(backup_path),
            original_checksum: Some(original_checksum),
            backup_checksum: Some(backup_checksum),
            backup_size_bytes: bytes.len() as u64,
            was_created: false,
            was_deleted: false,
            created_at: Utc::now(),
        };
        session.records.push(record.clone());
        debug!(
            session_id = %session.id,
            file = %path.display(),
            size = record.backup_size_bytes,
            "File backed up"
        );
        Ok(record)
    }

    /// Read a backup copy and check it against its recorded checksum.
    pub async fn read_backup(&self, record: &BackupRecord) -> Result<Vec<u8>> {
        let Some(backup_path) = &record.backup_path else {
            return Err(BackupError::BackupMissing(record.original_path.clone()));
        };
        let bytes = match fs::read(backup_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BackupError::BackupMissing(backup_path.clone()));
            }
            Err(source) => {
                return Err(BackupError::ReadFailed {
                    path: backup_path.clone(),
                    source,
                });
            }
        };
        let actual = sha256_hex(&bytes);
        let expected = record.backup_checksum.clone().unwrap_or_default();
        if actual != expected {
            return Err(BackupError::BackupCorrupted {
                path: backup_path.clone(),
                expected,
                actual,
            });
        }
        Ok(bytes)
    }

    pub async fn verify_backup(&self, record: &BackupRecord) -> Result<()> {
        self.read_backup(record).await.map(|_| ())
    }

    /// Write `session.json` atomically and durably.
    pub async fn save_session(&self, session: &Session) -> Result<()> {
        fs::create_dir_all(&session.directory)
            .await
            .map_err(|source| BackupError::CreateDirFailed {
                path: session.directory.clone(),
                source,
            })?;

        let content = serde_json::to_vec_pretty(session)?;
        let path = session.metadata_path();
        let tmp = session.directory.join(format!("{SESSION_FILE}.tmp"));
        write_synced(&tmp, &content).await?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|source| BackupError::WriteFailed {
                path: path.clone(),
                source,
            })?;

        // Persist the directory entry on Unix.
        #[cfg(unix)]
        {
            if let Ok(dir) = fs::File::open(&session.directory).await {
                let _ = dir.sync_all().await;
            }
        }

        debug!(session_id = %session.id, state = ?session.state, "Session saved");
        Ok(())
    }

    pub async fn load_session(&self, id: &str) -> Result<Session> {
        let path = self.root.join(id).join(SESSION_FILE);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BackupError::SessionNotFound(id.to_string()));
            }
            Err(source) => return Err(BackupError::ReadFailed { path, source }),
        };
        Ok(serde_json::from_slice(&content)?)
    }

    /// Every readable session under the root, newest first. Unreadable
    /// metadata is logged and skipped.
    pub async fn load_sessions(&self) -> Result<Vec<Session>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(BackupError::ReadFailed {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata_path = entry.path().join(SESSION_FILE);
            let content = match fs::read(&metadata_path).await {
                Ok(content) => content,
                Err(_) => continue,
            };
            match serde_json::from_slice::<Session>(&content) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    warn!(path = %metadata_path.display(), error = %e, "Skipping unreadable session metadata");
                }
            }
        }

        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        info!(root = %self.root.display(), count = sessions.len(), "Loaded backup sessions");
        Ok(sessions)
    }

    /// Delete session directories that never got metadata: batches that
    /// crashed mid-apply, failed to persist, or ran without persistence.
    ///
    /// Only uuid-named directories without `session.json`, last modified
    /// before `cutoff` and not claimed by `in_use`, are removed. Returns how
    /// many were removed.
    pub async fn remove_orphans(
        &self,
        cutoff: DateTime<Utc>,
        in_use: impl Fn(&str) -> bool,
    ) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(BackupError::ReadFailed {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(OsStr::to_str) else {
                continue;
            };
            if Uuid::parse_str(name).is_err() || in_use(name) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() || fs::try_exists(path.join(SESSION_FILE)).await? {
                continue;
            }
            let modified: DateTime<Utc> = metadata.modified()?.into();
            if modified >= cutoff {
                continue;
            }
            match fs::remove_dir_all(&path).await {
                Ok(()) => {
                    debug!(dir = %path.display(), "Removed orphaned backup directory");
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(dir = %path.display(), error = %e, "Failed to remove orphaned backup directory");
                }
            }
        }
        if removed > 0 {
            info!(root = %self.root.display(), removed, "Orphaned backup directories removed");
        }
        Ok(removed)
    }

    /// Delete a session directory with everything in it.
    pub async fn remove_session(&self, session: &Session) -> Result<()> {
        // Only ever delete a directory named after the session.
        if session.directory.file_name() != Some(OsStr::new(&session.id)) {
            warn!(
                session_id = %session.id,
                dir = %session.directory.display(),
                "Refusing to remove a directory not named after its session"
            );
            return Ok(());
        }
        match fs::remove_dir_all(&session.directory).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(session_id = %session.id, "Session backups removed");
        Ok(())
    }
}

/// Create or truncate `path`, write `bytes` and fsync.
async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let write = async {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    };
    write.await.map_err(|source| BackupError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use tempfile::tempdir;

    async fn setup() -> (tempfile::TempDir, BackupStore, Session) {
        let dir = tempdir().unwrap();
        let store = BackupStore::new(dir.path().join("backups"));
        let session = store
            .begin_session(Some("test".to_string()), Duration::days(7))
            .await
            .unwrap();
        (dir, store, session)
    }

    #[tokio::test]
    async fn test_snapshot_and_read_back() {
        let (dir, store, mut session) = setup().await;
        let file = dir.path().join("main.rs");
        fs::write(&file, "fn main() {}\n").await.unwrap();

        let record = store.snapshot_file(&mut session, &file).await.unwrap();
        assert!(!record.was_created);
        assert_eq!(record.original_checksum, record.backup_checksum);
        assert_eq!(record.backup_size_bytes, 13);
        let backup = record.backup_path.clone().unwrap();
        assert_eq!(backup.file_name().unwrap(), "0000-main.rs.bak");

        let bytes = store.read_backup(&record).await.unwrap();
        assert_eq!(bytes, b"fn main() {}\n");
    }

    #[tokio::test]
    async fn test_snapshot_is_idempotent() {
        let (dir, store, mut session) = setup().await;
        let file = dir.path().join("a.txt");
        fs::write(&file, "before").await.unwrap();

        let first = store.snapshot_file(&mut session, &file).await.unwrap();
        fs::write(&file, "after").await.unwrap();
        let second = store.snapshot_file(&mut session, &file).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(session.records.len(), 1);
        assert_eq!(store.read_backup(&second).await.unwrap(), b"before");
    }

    #[tokio::test]
    async fn test_snapshot_missing_file() {
        let (dir, store, mut session) = setup().await;
        let record = store
            .snapshot_file(&mut session, &dir.path().join("new.txt"))
            .await
            .unwrap();
        assert!(record.was_created);
        assert!(!record.has_backup());
    }

    #[tokio::test]
    async fn test_corrupted_and_missing_backup() {
        let (dir, store, mut session) = setup().await;
        let file = dir.path().join("a.txt");
        fs::write(&file, "content").await.unwrap();
        let record = store.snapshot_file(&mut session, &file).await.unwrap();
        let backup = record.backup_path.clone().unwrap();

        fs::write(&backup, "tampered").await.unwrap();
        assert!(matches!(
            store.verify_backup(&record).await,
            Err(BackupError::BackupCorrupted { .. })
        ));

        fs::remove_file(&backup).await.unwrap();
        assert!(matches!(
            store.verify_backup(&record).await,
            Err(BackupError::BackupMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_save_load_remove() {
        let (dir, store, mut session) = setup().await;
        let file = dir.path().join("a.txt");
        fs::write(&file, "x").await.unwrap();
        store.snapshot_file(&mut session, &file).await.unwrap();
        session.edit_sets.push("fix-1".to_string());
        store.save_session(&session).await.unwrap();

        let loaded = store.load_session(&session.id).await.unwrap();
        assert_eq!(loaded, session);

        session.state = SessionState::RolledBack;
        store.save_session(&session).await.unwrap();
        let all = store.load_sessions().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, SessionState::RolledBack);

        store.remove_session(&session).await.unwrap();
        assert!(!session.directory.exists());
        assert!(store.load_sessions().await.unwrap().is_empty());
        assert!(matches!(
            store.load_session(&session.id).await,
            Err(BackupError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_orphans() {
        let (_dir, store, session) = setup().await;
        store.save_session(&session).await.unwrap();
        let orphan = store.root().join(Uuid::new_v4().to_string());
        let busy = store.root().join(Uuid::new_v4().to_string());
        let foreign = store.root().join("keep-me");
        for dir in [&orphan, &busy, &foreign] {
            fs::create_dir_all(dir).await.unwrap();
        }
        fs::write(orphan.join("0000-a.txt.bak"), "x").await.unwrap();

        let past = Utc::now() - Duration::hours(1);
        assert_eq!(store.remove_orphans(past, |_| false).await.unwrap(), 0);

        let busy_name = busy.file_name().unwrap().to_str().unwrap().to_string();
        let future = Utc::now() + Duration::hours(1);
        let removed = store
            .remove_orphans(future, |id| id == busy_name)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!orphan.exists());
        assert!(busy.exists());
        assert!(foreign.exists());
        assert!(session.directory.exists());
    }

    #[tokio::test]
    async fn test_load_sessions_skips_garbage() {
        let (_dir, store, session) = setup().await;
        store.save_session(&session).await.unwrap();
        let junk = store.root().join("junk");
        fs::create_dir_all(&junk).await.unwrap();
        fs::write(junk.join(SESSION_FILE), "{not json").await.unwrap();

        let sessions = store.load_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, session.id);
    }
}
