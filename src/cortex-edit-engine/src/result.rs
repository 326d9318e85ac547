//! Results of apply and rollback.

use cortex_backup::BackupRecord;
use cortex_edits::{
    Conflict, DroppedEditSet, EditSetId, ImpactEstimate, RejectedEditSet, ResolvedConflict,
    RiskLevel, ValidationIssue,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// States of the batch applier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyPhase {
    Previewing,
    ConflictChecking,
    BackingUp,
    Writing,
    Validating,
    Committed,
    Aborted,
}

/// Overall label of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Every surviving change landed.
    Success,
    /// Some changes landed; others failed, were withheld or were cancelled.
    Partial,
    /// Nothing landed, and a file failed or conflict resolution withheld
    /// every change.
    Failed,
    /// Stopped before any write.
    Aborted,
    /// Nothing to change.
    NothingToDo,
}

impl BatchStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::NothingToDo)
    }
}

/// Why a batch stopped before writing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AbortReason {
    /// Conflicts exist and resolution is disabled, or the strategy aborts.
    Conflicts { count: usize },
    RiskExceeded { risk: RiskLevel, max: RiskLevel },
    /// A file failed during preview with fail-fast on.
    PreviewFailed { path: PathBuf },
    Cancelled,
}

/// Why a file was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Listed in `exclude_files`.
    Excluded,
    /// Every edit set touching it was dropped by conflict resolution.
    ConflictDropped,
    /// The batch was cancelled first.
    Cancelled,
    /// An earlier failure stopped a fail-fast batch.
    Abandoned,
    /// The batch aborted before writing.
    BatchAborted,
}

/// What happened to one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Modified,
    Created,
    Deleted,
    /// The edits left the content as it was.
    Unchanged,
    Skipped { reason: SkipReason },
    Failed { phase: ApplyPhase, error: String },
}

impl FileOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Modified | Self::Created | Self::Deleted)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Per-file result of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileApplyResult {
    pub path: PathBuf,
    pub outcome: FileOutcome,
    pub edit_sets: Vec<EditSetId>,
    pub changes_applied: usize,
    /// Edits targeting the file that were not applied.
    pub changes_skipped: usize,
    pub size_before: Option<u64>,
    pub size_after: Option<u64>,
    pub duration_ms: u64,
    /// Backup taken for this file, when one was made.
    pub backup: Option<BackupRecord>,
}

impl FileApplyResult {
    pub fn new(path: PathBuf, outcome: FileOutcome) -> Self {
        Self {
            path,
            outcome,
            edit_sets: Vec::new(),
            changes_applied: 0,
            changes_skipped: 0,
            size_before: None,
            size_after: None,
            duration_ms: 0,
            backup: None,
        }
    }

    pub fn skipped(path: PathBuf, reason: SkipReason) -> Self {
        Self::new(path, FileOutcome::Skipped { reason })
    }

    pub fn failed(path: PathBuf, phase: ApplyPhase, error: impl Into<String>) -> Self {
        Self::new(
            path,
            FileOutcome::Failed {
                phase,
                error: error.into(),
            },
        )
    }
}

/// Totals over a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub total_files: usize,
    pub modified_files: usize,
    pub unchanged_files: usize,
    pub skipped_files: usize,
    pub failed_files: usize,
    pub changes_applied: usize,
    pub changes_skipped: usize,
    /// Written files per second of wall time.
    pub files_per_second: f64,
}

impl ApplySummary {
    pub fn from_files(files: &[FileApplyResult], duration_ms: u64) -> Self {
        let modified_files = files.iter().filter(|f| f.outcome.is_written()).count();
        let seconds = duration_ms as f64 / 1000.0;
        Self {
            total_files: files.len(),
            modified_files,
            unchanged_files: files
                .iter()
                .filter(|f| f.outcome == FileOutcome::Unchanged)
                .count(),
            skipped_files: files
                .iter()
                .filter(|f| matches!(f.outcome, FileOutcome::Skipped { .. }))
                .count(),
            failed_files: files.iter().filter(|f| f.outcome.is_failed()).count(),
            changes_applied: files.iter().map(|f| f.changes_applied).sum(),
            changes_skipped: files.iter().map(|f| f.changes_skipped).sum(),
            files_per_second: if seconds > 0.0 {
                modified_files as f64 / seconds
            } else {
                modified_files as f64
            },
        }
    }
}

/// Result of one apply call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchApplyResult {
    pub batch_id: String,
    /// Session to pass to rollback. Set when at least one backup was taken.
    pub session_id: Option<String>,
    pub status: BatchStatus,
    /// True for `Success` and `NothingToDo` only.
    pub success: bool,
    /// Last state the applier reached.
    pub phase: ApplyPhase,
    pub abort_reason: Option<AbortReason>,
    pub file_results: Vec<FileApplyResult>,
    pub modified_files: Vec<PathBuf>,
    pub failed_files: Vec<PathBuf>,
    pub skipped_files: Vec<PathBuf>,
    /// Edit sets whose every file landed.
    pub applied_edit_sets: Vec<EditSetId>,
    pub rejected_edit_sets: Vec<RejectedEditSet>,
    pub dropped_edit_sets: Vec<DroppedEditSet>,
    pub conflicts: Vec<Conflict>,
    pub resolutions: Vec<ResolvedConflict>,
    pub unresolved_conflicts: Vec<Conflict>,
    pub validation_issues: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
    pub impact: Option<ImpactEstimate>,
    pub summary: ApplySummary,
    pub duration_ms: u64,
}

/// Label of a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    /// Every file restored; the session is gone.
    Completed,
    /// Some files failed; the session stays active for a retry.
    Partial,
    SessionNotFound,
    SessionExpired,
    /// Stopped between files; the session stays active.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RollbackFailureReason {
    BackupMissing,
    BackupCorrupted { expected: String, actual: String },
    /// The restored file does not hash to the pre-edit checksum.
    VerificationFailed { expected: String, actual: String },
    Io { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackFailure {
    pub path: PathBuf,
    pub reason: RollbackFailureReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub session_id: String,
    pub status: RollbackStatus,
    pub success: bool,
    pub restored_files: Vec<PathBuf>,
    /// Files the batch created, removed again.
    pub deleted_files: Vec<PathBuf>,
    pub failed_files: Vec<RollbackFailure>,
    /// Files not reached before cancellation.
    pub skipped_files: Vec<PathBuf>,
    pub duration_ms: u64,
}

impl RollbackResult {
    pub fn without_session(session_id: &str, status: RollbackStatus) -> Self {
        Self {
            session_id: session_id.to_string(),
            status,
            success: false,
            restored_files: Vec::new(),
            deleted_files: Vec::new(),
            failed_files: Vec::new(),
            skipped_files: Vec::new(),
            duration_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let mut modified = FileApplyResult::new(PathBuf::from("a"), FileOutcome::Modified);
        modified.changes_applied = 2;
        let files = vec![
            modified,
            FileApplyResult::new(PathBuf::from("b"), FileOutcome::Created),
            FileApplyResult::new(PathBuf::from("c"), FileOutcome::Unchanged),
            FileApplyResult::skipped(PathBuf::from("d"), SkipReason::Excluded),
            FileApplyResult::failed(PathBuf::from("e"), ApplyPhase::Writing, "disk full"),
        ];
        let summary = ApplySummary::from_files(&files, 500);
        assert_eq!(summary.total_files, 5);
        assert_eq!(summary.modified_files, 2);
        assert_eq!(summary.unchanged_files, 1);
        assert_eq!(summary.skipped_files, 1);
        assert_eq!(summary.failed_files, 1);
        assert_eq!(summary.changes_applied, 2);
        assert_eq!(summary.files_per_second, 4.0);
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let json = serde_json::to_value(FileOutcome::Skipped {
            reason: SkipReason::Cancelled,
        })
        .unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "cancelled");
        assert!(BatchStatus::NothingToDo.is_success());
        assert!(!BatchStatus::Partial.is_success());
    }
}
