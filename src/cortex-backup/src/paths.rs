//! Where backups live.

use std::path::PathBuf;
use tracing::debug;

/// Application name used for the cache subdirectory.
pub const APP_NAME: &str = "Cortex";

/// Environment override for the backup root.
pub const BACKUP_DIR_ENV: &str = "CORTEX_EDIT_BACKUP_DIR";

/// Subdirectory of the cache dir holding edit backups.
pub const BACKUPS_DIR: &str = "edit-backups";

/// Metadata file inside every session directory.
pub const SESSION_FILE: &str = "session.json";

/// Default backup root.
///
/// Resolution order:
/// 1. `$CORTEX_EDIT_BACKUP_DIR` when set and non-empty
/// 2. `<cache dir>/Cortex/edit-backups`
/// 3. `<temp dir>/Cortex/edit-backups`
pub fn default_backup_root() -> PathBuf {
    if let Ok(val) = std::env::var(BACKUP_DIR_ENV)
        && !val.is_empty()
    {
        let path = PathBuf::from(val);
        debug!(path = %path.display(), "Using CORTEX_EDIT_BACKUP_DIR override");
        return path;
    }

    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
        .join(BACKUPS_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_override() {
        // SAFETY: serialized with every other test touching the variable.
        unsafe { std::env::set_var(BACKUP_DIR_ENV, "/tmp/cortex-edit-test") };
        assert_eq!(default_backup_root(), PathBuf::from("/tmp/cortex-edit-test"));
        unsafe { std::env::remove_var(BACKUP_DIR_ENV) };
    }

    #[test]
    #[serial]
    fn test_default_root_layout() {
        unsafe { std::env::remove_var(BACKUP_DIR_ENV) };
        let root = default_backup_root();
        assert!(root.ends_with(PathBuf::from(APP_NAME).join(BACKUPS_DIR)));
    }
}
