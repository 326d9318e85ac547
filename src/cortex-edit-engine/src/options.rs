//! Per-batch apply options.

use crate::config::EngineConfig;
use cortex_edits::{ConflictStrategy, RiskLevel};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Options for one [`apply`](crate::EditEngine::apply) call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyOptions {
    /// Back up every file before writing. Writes never happen without a
    /// backup when this is set.
    #[serde(default = "default_true")]
    pub create_backup: bool,
    /// Resolve conflicts with `conflict_strategy`. When unset, any conflict
    /// aborts the batch.
    #[serde(default = "default_true")]
    pub resolve_conflicts: bool,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    /// Run the registered validators over every written file.
    #[serde(default = "default_true")]
    pub validate_after_apply: bool,
    /// Stop launching file work after the first per-file failure.
    #[serde(default)]
    pub stop_on_first_error: bool,
    /// Concurrent file operations for this batch.
    #[serde(default)]
    pub max_parallelism: Option<usize>,
    /// Session directory root for this batch instead of the engine's.
    #[serde(default)]
    pub backup_directory: Option<PathBuf>,
    /// Files left untouched even when edit sets target them.
    #[serde(default)]
    pub exclude_files: Vec<PathBuf>,
    /// Abort before any backup when the impact estimate exceeds this level.
    #[serde(default)]
    pub max_risk: Option<RiskLevel>,
    /// Stored on the session.
    #[serde(default)]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            create_backup: true,
            resolve_conflicts: true,
            conflict_strategy: ConflictStrategy::default(),
            validate_after_apply: true,
            stop_on_first_error: false,
            max_parallelism: None,
            backup_directory: None,
            exclude_files: Vec::new(),
            max_risk: None,
            description: None,
        }
    }
}

impl ApplyOptions {
    /// Defaults taken from an engine config.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            conflict_strategy: config.default_strategy,
            validate_after_apply: config.validate_after_apply,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn without_backup(mut self) -> Self {
        self.create_backup = false;
        self
    }

    pub fn without_conflict_resolution(mut self) -> Self {
        self.resolve_conflicts = false;
        self
    }

    pub fn stop_on_first_error(mut self, enabled: bool) -> Self {
        self.stop_on_first_error = enabled;
        self
    }

    pub fn max_parallelism(mut self, limit: usize) -> Self {
        self.max_parallelism = Some(limit);
        self
    }

    pub fn exclude(mut self, path: impl Into<PathBuf>) -> Self {
        self.exclude_files.push(path.into());
        self
    }

    pub fn max_risk(mut self, risk: RiskLevel) -> Self {
        self.max_risk = Some(risk);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn backup_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_directory = Some(dir.into());
        self
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        self.exclude_files.iter().any(|p| p == path)
    }
}
