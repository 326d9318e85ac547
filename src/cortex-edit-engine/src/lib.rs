//! Transactional multi-file edit engine for Cortex.
//!
//! Takes edit sets from analyzers or bulk-edit requests and commits them
//! across a tree of files: preview, conflict resolution, checksummed
//! backups, bounded-concurrency writes, post-write validation, and rollback
//! of a committed batch at any later point within its retention window.
//!
//! ```no_run
//! use cortex_edit_engine::{ApplyOptions, EditEngine, EngineConfig};
//! use cortex_edits::{Edit, EditSet};
//!
//! # async fn demo() -> cortex_edit_engine::Result<()> {
//! let engine = EditEngine::open(EngineConfig::default()).await?;
//! let fix = EditSet::new("rename-foo")
//!     .with_edit(Edit::replace("src/lib.rs", (0, 7), (0, 10), "bar"));
//!
//! let result = engine.apply(&[fix], ApplyOptions::default()).await?;
//! if let Some(session_id) = &result.session_id {
//!     engine.rollback(session_id).await;
//! }
//! # Ok(())
//! # }
//! ```

mod applier;
pub mod config;
pub mod engine;
pub mod events;
pub mod fs_ops;
pub mod options;
pub mod planner;
pub mod result;
mod rollback;

pub use config::EngineConfig;
pub use engine::EditEngine;
pub use events::{EngineEvent, EventBus};
pub use options::ApplyOptions;
pub use result::{
    AbortReason, ApplyPhase, ApplySummary, BatchApplyResult, BatchStatus, FileApplyResult,
    FileOutcome, RollbackFailure, RollbackFailureReason, RollbackResult, RollbackStatus,
    SkipReason,
};

use cortex_backup::BackupError;
use cortex_edits::EditsError;
use std::path::PathBuf;
use thiserror::Error;

/// Engine error types. Per-file failures are values inside results; these
/// are the errors that escape a call.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("Invalid input: {0}")]
    Input(#[from] EditsError),

    #[error("Failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Fail-fast batch in which every attempted file failed. Carries the
    /// full result so no per-file detail is lost.
    #[error("Every attempted file failed ({} files)", .0.summary.failed_files)]
    BatchFailed(Box<BatchApplyResult>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
