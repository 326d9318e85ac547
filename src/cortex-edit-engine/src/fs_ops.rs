//! File primitives shared by apply and rollback.

use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-path async locks. Two batches, or a batch and a rollback, never write
/// the same file at the same time.
#[derive(Debug, Default)]
pub struct FileLocks {
    locks: DashMap<PathBuf, Arc<AsyncMutex<()>>>,
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical parent plus file name, so a file keeps one key before and
    /// after it exists.
    fn key(path: &Path) -> PathBuf {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return path.to_path_buf();
        };
        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        parent
            .canonicalize()
            .map(|dir| dir.join(name))
            .unwrap_or_else(|_| path.to_path_buf())
    }

    /// Wait for and hold the lock of `path`.
    pub async fn lock(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(Self::key(path))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Forget locks nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Read a file, `None` when it does not exist.
pub async fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write to a temp file in the same directory, fsync, then rename over
/// `path`. Readers never see partial content. An existing file keeps its
/// permissions.
pub async fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        Some(_) => PathBuf::from("."),
        None => {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "Cannot determine parent directory",
            ));
        }
    };

    if !parent.exists() {
        fs::create_dir_all(&parent).await?;
    }

    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        uuid::Uuid::new_v4().simple()
    ));

    let write = async {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(content).await?;
        file.flush().await?;
        file.sync_all().await?;
        match fs::metadata(path).await {
            Ok(meta) => fs::set_permissions(&temp_path, meta.permissions()).await,
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    };
    if let Err(e) = write.await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }

    // Windows refuses to rename onto a file that is briefly held open.
    let mut retries = 5;
    loop {
        #[cfg(windows)]
        if path.exists() {
            let _ = fs::remove_file(path).await;
        }

        match fs::rename(&temp_path, path).await {
            Ok(()) => break,
            Err(_) if retries > 0 => {
                retries -= 1;
                tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Remove a file. A file that is already gone counts as removed.
pub async fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_atomic_write_creates_parents_and_leaves_no_temp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/deeper/file.txt");
        atomic_write(&path, b"content").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"content");

        atomic_write(&path, b"again").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"again");

        let mut entries = fs::read_dir(path.parent().unwrap()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name());
        }
        assert_eq!(names.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_atomic_write_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("run.sh");
        fs::write(&path, "#!/bin/sh\n").await.unwrap();
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .await
            .unwrap();

        atomic_write(&path, b"#!/bin/sh\necho hi\n").await.unwrap();
        let mode = fs::metadata(&path).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_read_optional_and_remove() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        assert_eq!(read_optional(&path).await.unwrap(), None);
        fs::write(&path, "x").await.unwrap();
        assert_eq!(read_optional(&path).await.unwrap(), Some(b"x".to_vec()));
        assert!(remove_if_exists(&path).await.unwrap());
        assert!(!remove_if_exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_key_is_stable_across_creation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("new.txt");
        let spelled = dir.path().join(".").join("new.txt");

        let before = FileLocks::key(&path);
        assert_eq!(FileLocks::key(&spelled), before);
        fs::write(&path, "x").await.unwrap();
        assert_eq!(FileLocks::key(&path), before);
        assert_eq!(FileLocks::key(&spelled), before);
    }

    #[tokio::test]
    async fn test_file_lock_serializes_same_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        let locks = Arc::new(FileLocks::new());

        let guard = locks.lock(&path).await;
        let waiter = {
            let locks = Arc::clone(&locks);
            let path = path.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&path).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();

        locks.prune();
        assert!(locks.is_empty());
    }
}
