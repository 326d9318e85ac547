//! Engine configuration.

use crate::{EngineError, Result};
use cortex_backup::default_backup_root;
use cortex_edits::ConflictStrategy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Process-wide settings of an [`EditEngine`](crate::EditEngine).
///
/// ```toml
/// backup_root = "/var/cache/cortex/edit-backups"
/// retention_days = 14
/// max_parallelism = 8
/// default_strategy = "prefer_confidence"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding session directories. `None` uses
    /// `$CORTEX_EDIT_BACKUP_DIR` or the platform cache dir.
    #[serde(default)]
    pub backup_root: Option<PathBuf>,
    /// How long a committed batch can be rolled back.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Concurrent file operations. `None` uses the available CPU parallelism.
    #[serde(default)]
    pub max_parallelism: Option<usize>,
    /// Write session metadata to disk so rollback survives a restart.
    #[serde(default = "default_true")]
    pub persist_sessions: bool,
    /// Strategy used when a batch does not name one.
    #[serde(default)]
    pub default_strategy: ConflictStrategy,
    #[serde(default = "default_true")]
    pub validate_after_apply: bool,
    /// Register the delimiter balance check on every new engine.
    #[serde(default = "default_true")]
    pub builtin_validators: bool,
    /// Unchanged lines shown around each hunk of a preview diff.
    #[serde(default = "default_diff_context_lines")]
    pub diff_context_lines: usize,
    /// Buffered events per subscriber before the slowest one lags.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    7
}

fn default_diff_context_lines() -> usize {
    3
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backup_root: None,
            retention_days: default_retention_days(),
            max_parallelism: None,
            persist_sessions: true,
            default_strategy: ConflictStrategy::default(),
            validate_after_apply: true,
            builtin_validators: true,
            diff_context_lines: default_diff_context_lines(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    /// Config rooted at an explicit backup directory.
    pub fn with_backup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.backup_root = Some(root.into());
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| EngineError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn resolved_backup_root(&self) -> PathBuf {
        self.backup_root.clone().unwrap_or_else(default_backup_root)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    /// Parallelism after falling back to the CPU count. Never zero.
    pub fn resolved_parallelism(&self, requested: Option<usize>) -> usize {
        requested
            .or(self.max_parallelism)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|p| p.get())
                    .unwrap_or(4)
            })
            .max(1)
    }
}
