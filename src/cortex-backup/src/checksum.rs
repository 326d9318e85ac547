//! SHA-256 checksums.

use crate::{BackupError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}

/// Checksum of a file on disk, or `None` when it does not exist.
pub async fn file_checksum(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(sha256_hex(bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(BackupError::ReadFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_file_checksum_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(file_checksum(&dir.path().join("nope")).await.unwrap(), None);

        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, "abc").await.unwrap();
        assert_eq!(
            file_checksum(&path).await.unwrap(),
            Some(sha256_hex("abc"))
        );
    }
}
