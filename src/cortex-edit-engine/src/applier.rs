//! Batch applier.
//!
//! Drives one batch through
//! `Previewing -> ConflictChecking -> BackingUp -> Writing -> Validating -> Committed`,
//! or to `Aborted` before anything is written. Per-file failures are recorded
//! on the file and never stop sibling files unless the batch is fail-fast.

use crate::engine::EngineInner;
use crate::events::EngineEvent;
use crate::fs_ops::{atomic_write, read_optional, remove_if_exists};
use crate::options::ApplyOptions;
use crate::planner::{FileSource, Plan};
use crate::result::{
    AbortReason, ApplyPhase, ApplySummary, BatchApplyResult, BatchStatus, FileApplyResult,
    FileOutcome, SkipReason,
};
use crate::{EngineError, Result};
use cortex_backup::{BackupRecord, BackupStore, Session, sha256_hex};
use cortex_edits::{
    Conflict, ConflictResolver, ConflictStrategy, DroppedEditSet, EditSet, EditSetId,
    FilePreview, ImpactEstimate, RejectedEditSet, ResolutionOutcome, ResolvedConflict,
    ValidationIssue, Validator,
};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A file that survived preview and will be written.
struct WorkItem {
    preview: FilePreview,
    size_before: Option<u64>,
    changes_skipped: usize,
    backup: Option<BackupRecord>,
}

/// Everything a batch accumulates on its way to a result.
#[derive(Default)]
struct Report {
    file_results: Vec<FileApplyResult>,
    rejected: Vec<RejectedEditSet>,
    dropped: Vec<DroppedEditSet>,
    conflicts: Vec<Conflict>,
    resolutions: Vec<ResolvedConflict>,
    unresolved: Vec<Conflict>,
    issues: Vec<ValidationIssue>,
    warnings: Vec<String>,
    impact: Option<ImpactEstimate>,
    abort_reason: Option<AbortReason>,
    session_id: Option<String>,
    applied: Vec<EditSetId>,
}

pub(crate) struct BatchApplier<'a> {
    inner: &'a EngineInner,
    validators: &'a [Arc<dyn Validator>],
    options: ApplyOptions,
    token: CancellationToken,
    batch_id: String,
    phase: ApplyPhase,
    started: Instant,
}

impl<'a> BatchApplier<'a> {
    pub(crate) fn new(
        inner: &'a EngineInner,
        validators: &'a [Arc<dyn Validator>],
        options: ApplyOptions,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner,
            validators,
            options,
            token,
            batch_id: uuid::Uuid::new_v4().to_string(),
            phase: ApplyPhase::Previewing,
            started: Instant::now(),
        }
    }

    fn enter(&mut self, phase: ApplyPhase) {
        self.phase = phase;
        debug!(batch_id = %self.batch_id, phase = ?phase, "Batch phase");
        self.inner.events.publish(EngineEvent::PhaseChanged {
            batch_id: self.batch_id.clone(),
            phase,
        });
    }

    pub(crate) async fn run(mut self, edit_sets: &[EditSet]) -> Result<BatchApplyResult> {
        info!(
            batch_id = %self.batch_id,
            edit_sets = edit_sets.len(),
            strategy = %self.options.conflict_strategy,
            "Applying edit batch"
        );
        self.inner.events.publish(EngineEvent::BatchStarted {
            batch_id: self.batch_id.clone(),
            edit_sets: edit_sets.len(),
        });
        let parallelism = self
            .inner
            .config
            .resolved_parallelism(self.options.max_parallelism);
        let mut report = Report::default();

        // Previewing
        self.enter(ApplyPhase::Previewing);
        let plan = Plan::build(edit_sets, &self.options, parallelism).await;
        report.rejected = plan.rejected.clone();
        for (path, ids) in &plan.excluded {
            let mut result = FileApplyResult::skipped(path.clone(), SkipReason::Excluded);
            result.edit_sets = ids.clone();
            result.changes_skipped = plan.targeted_count(path);
            report.file_results.push(result);
        }

        let unreadable: Vec<(&PathBuf, &String)> = plan
            .sources
            .iter()
            .filter_map(|(path, source)| match source {
                FileSource::Unreadable(error) => Some((path, error)),
                FileSource::Loaded { .. } => None,
            })
            .collect();
        if self.options.stop_on_first_error
            && let Some((first, _)) = unreadable.first()
        {
            let failed: HashSet<&PathBuf> = unreadable.iter().map(|(p, _)| *p).collect();
            for (path, error) in &unreadable {
                report.file_results.push(FileApplyResult::failed(
                    (*path).clone(),
                    ApplyPhase::Previewing,
                    (*error).clone(),
                ));
            }
            report.abort_reason = Some(AbortReason::PreviewFailed {
                path: (*first).clone(),
            });
            self.skip_remaining(&plan, &failed, &mut report, SkipReason::BatchAborted);
            return self.finish(report);
        }

        // ConflictChecking
        self.enter(ApplyPhase::ConflictChecking);
        let conflicts = plan.conflicts();
        let mut outcome = ResolutionOutcome::default();
        if !conflicts.is_empty() {
            report.conflicts = conflicts.clone();
            if !self.options.resolve_conflicts
                || self.options.conflict_strategy == ConflictStrategy::Abort
            {
                warn!(batch_id = %self.batch_id, conflicts = conflicts.len(), "Aborting batch on conflicts");
                report.unresolved = conflicts.clone();
                report.abort_reason = Some(AbortReason::Conflicts {
                    count: conflicts.len(),
                });
                self.skip_remaining(&plan, &HashSet::new(), &mut report, SkipReason::BatchAborted);
                return self.finish(report);
            }
            outcome = ConflictResolver::resolve_all(&conflicts, self.options.conflict_strategy);
            outcome.cascade_dependencies(&plan.edit_sets);
            debug!(
                batch_id = %self.batch_id,
                resolved = outcome.resolutions.len(),
                unresolved = outcome.unresolved.len(),
                dropped = outcome.dropped.len(),
                "Conflicts resolved"
            );
        }
        report.resolutions = outcome.resolutions.clone();
        report.unresolved = outcome.unresolved.clone();
        report.dropped = outcome.dropped.clone();

        let dropped = outcome.dropped_ids();
        let files = plan.file_edits(&dropped);
        for (path, file_edits) in plan.file_edits(&BTreeSet::new()) {
            if !files.contains_key(&path) {
                let mut result = FileApplyResult::skipped(path.clone(), SkipReason::ConflictDropped);
                result.edit_sets = file_edits.edit_set_ids().into_iter().cloned().collect();
                result.changes_skipped = plan.targeted_count(&path);
                report.file_results.push(result);
            }
        }

        let previews = plan.render(&self.inner.generator, &files);
        let impact = ImpactEstimate::from_previews(&previews);
        report.impact = Some(impact.clone());
        if let Some(max) = self.options.max_risk
            && impact.risk > max
        {
            warn!(batch_id = %self.batch_id, risk = ?impact.risk, max = ?max, "Batch exceeds risk limit");
            report.abort_reason = Some(AbortReason::RiskExceeded {
                risk: impact.risk,
                max,
            });
            self.skip_remaining(&plan, &HashSet::new(), &mut report, SkipReason::BatchAborted);
            return self.finish(report);
        }

        let mut work = Vec::new();
        for preview in previews {
            let surviving = files
                .get(&preview.path)
                .map(|f| f.edits.len() + f.deleted_by.len())
                .unwrap_or(0);
            let changes_skipped = plan.targeted_count(&preview.path).saturating_sub(surviving);
            let size_before = plan.sources.get(&preview.path).and_then(FileSource::size);
            if let Some(error) = &preview.error {
                let mut result =
                    FileApplyResult::failed(preview.path.clone(), ApplyPhase::Previewing, error.clone());
                result.edit_sets = preview.edit_sets.clone();
                result.changes_skipped = plan.targeted_count(&preview.path);
                report.file_results.push(result);
            } else if !preview.would_change {
                let mut result = FileApplyResult::new(preview.path.clone(), FileOutcome::Unchanged);
                result.edit_sets = preview.edit_sets.clone();
                result.changes_skipped = changes_skipped;
                result.size_before = size_before;
                result.size_after = size_before;
                report.file_results.push(result);
            } else {
                work.push(WorkItem {
                    preview,
                    size_before,
                    changes_skipped,
                    backup: None,
                });
            }
        }

        // BackingUp
        let mut halted = false;
        let mut session: Option<(BackupStore, Session)> = None;
        let mut ready = Vec::with_capacity(work.len());
        if self.token.is_cancelled() {
            for item in work {
                report.file_results.push(self.skipped(&item, SkipReason::Cancelled));
            }
        } else if self.options.create_backup && !work.is_empty() {
            self.enter(ApplyPhase::BackingUp);
            let store = match &self.options.backup_directory {
                Some(dir) => BackupStore::new(dir.clone()),
                None => self.inner.store.clone(),
            };
            match store
                .begin_session(self.options.description.clone(), self.inner.config.retention())
                .await
            {
                Ok(mut new_session) => {
                    self.inner.pending.insert(new_session.id.clone());
                    new_session.edit_sets = plan
                        .live()
                        .filter(|(_, set)| !dropped.contains(&set.id))
                        .map(|(_, set)| set.id.to_string())
                        .collect();
                    for mut item in work {
                        if halted {
                            report.file_results.push(self.skipped(&item, SkipReason::Abandoned));
                            continue;
                        }
                        if self.token.is_cancelled() {
                            report.file_results.push(self.skipped(&item, SkipReason::Cancelled));
                            continue;
                        }
                        match store.snapshot_file(&mut new_session, &item.preview.path).await {
                            Ok(record) => {
                                item.backup = Some(record);
                                ready.push(item);
                            }
                            Err(e) => {
                                warn!(batch_id = %self.batch_id, file = %item.preview.path.display(), error = %e, "Backup failed; file will not be written");
                                report.file_results.push(self.failed(&item, ApplyPhase::BackingUp, e.to_string()));
                                halted |= self.options.stop_on_first_error;
                            }
                        }
                    }
                    session = Some((store, new_session));
                }
                Err(e) => {
                    warn!(batch_id = %self.batch_id, error = %e, "Could not start backup session");
                    for item in work {
                        report.file_results.push(self.failed(&item, ApplyPhase::BackingUp, e.to_string()));
                    }
                }
            }
        } else {
            ready = work;
        }

        // Writing
        self.enter(ApplyPhase::Writing);
        let halted = AtomicBool::new(halted);
        let semaphore = Semaphore::new(parallelism);
        let written: Vec<FileApplyResult> = join_all(
            ready
                .iter()
                .map(|item| self.write_file(item, &semaphore, &halted)),
        )
        .await;

        // Validating
        if self.options.validate_after_apply && self.validators.is_empty() {
            debug!(batch_id = %self.batch_id, "No validators registered, skipping validation");
        } else if self.options.validate_after_apply {
            self.enter(ApplyPhase::Validating);
            for (item, result) in ready.iter().zip(&written) {
                if !matches!(result.outcome, FileOutcome::Modified | FileOutcome::Created) {
                    continue;
                }
                for validator in self.validators {
                    let issues = validator.validate(
                        &item.preview.path,
                        &item.preview.original,
                        &item.preview.modified,
                    );
                    for issue in &issues {
                        debug!(file = %issue.path.display(), validator = %issue.validator, message = %issue.message, "Validation issue");
                    }
                    report.issues.extend(issues);
                }
            }
        }
        report.file_results.extend(written);

        // Committed
        if let Some((store, mut session)) = session {
            for result in &report.file_results {
                if result.outcome == FileOutcome::Deleted {
                    session.mark_deleted(&result.path);
                }
            }
            self.commit_session(store, session, &mut report).await;
        }

        report.applied = applied_edit_sets(&plan, &dropped, &report.file_results);
        self.enter(ApplyPhase::Committed);
        self.finish(report)
    }

    async fn commit_session(&self, store: BackupStore, session: Session, report: &mut Report) {
        if session.records.is_empty() {
            if let Err(e) = store.remove_session(&session).await {
                warn!(session_id = %session.id, error = %e, "Failed to remove empty session");
            }
            self.inner.pending.remove(&session.id);
            return;
        }

        if self.inner.config.persist_sessions
            && let Err(e) = store.save_session(&session).await
        {
            warn!(session_id = %session.id, error = %e, "Failed to persist session metadata");
            report.warnings.push(format!(
                "session metadata not persisted, rollback will not survive a restart: {e}"
            ));
        }

        info!(
            session_id = %session.id,
            files = session.records.len(),
            expires_at = %session.expires_at,
            "Backup session created"
        );
        self.inner.events.publish(EngineEvent::SessionCreated {
            session_id: session.id.clone(),
            files: session.records.len(),
        });
        report.session_id = Some(session.id.clone());
        let id = session.id.clone();
        self.inner.registry.insert(session);
        self.inner.pending.remove(&id);
    }

    async fn write_file(
        &self,
        item: &WorkItem,
        semaphore: &Semaphore,
        halted: &AtomicBool,
    ) -> FileApplyResult {
        let _permit = semaphore.acquire().await;
        if self.token.is_cancelled() {
            return self.skipped(item, SkipReason::Cancelled);
        }
        if halted.load(Ordering::SeqCst) {
            return self.skipped(item, SkipReason::Abandoned);
        }

        let started = Instant::now();
        let path = &item.preview.path;
        let written = {
            let _guard = self.inner.locks.lock(path).await;
            commit_file(&item.preview).await
        };

        let mut result = match written {
            Ok(outcome) => {
                debug!(batch_id = %self.batch_id, file = %path.display(), outcome = ?outcome, "File written");
                self.inner.events.publish(EngineEvent::FileWritten {
                    batch_id: self.batch_id.clone(),
                    path: path.clone(),
                });
                let mut result = self.base_result(item, outcome);
                result.changes_applied = item.preview.changes.len();
                result.size_after = if item.preview.deletes_file {
                    None
                } else {
                    Some(item.preview.modified.len() as u64)
                };
                result
            }
            Err(error) => {
                warn!(batch_id = %self.batch_id, file = %path.display(), error = %error, "File write failed");
                if self.options.stop_on_first_error {
                    halted.store(true, Ordering::SeqCst);
                }
                self.inner.events.publish(EngineEvent::FileFailed {
                    batch_id: self.batch_id.clone(),
                    path: path.clone(),
                    error: error.clone(),
                });
                self.failed(item, ApplyPhase::Writing, error)
            }
        };
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    fn base_result(&self, item: &WorkItem, outcome: FileOutcome) -> FileApplyResult {
        let mut result = FileApplyResult::new(item.preview.path.clone(), outcome);
        result.edit_sets = item.preview.edit_sets.clone();
        result.changes_skipped = item.changes_skipped;
        result.size_before = item.size_before;
        result.backup = item.backup.clone();
        result
    }

    fn skipped(&self, item: &WorkItem, reason: SkipReason) -> FileApplyResult {
        let mut result = self.base_result(item, FileOutcome::Skipped { reason });
        result.changes_skipped += item.preview.changes.len();
        result
    }

    fn failed(&self, item: &WorkItem, phase: ApplyPhase, error: impl Into<String>) -> FileApplyResult {
        let mut result = self.base_result(
            item,
            FileOutcome::Failed {
                phase,
                error: error.into(),
            },
        );
        result.changes_skipped += item.preview.changes.len();
        result
    }

    /// Mark every file of the plan without a result yet as skipped.
    fn skip_remaining(
        &self,
        plan: &Plan,
        already: &HashSet<&PathBuf>,
        report: &mut Report,
        reason: SkipReason,
    ) {
        for (path, file_edits) in plan.file_edits(&BTreeSet::new()) {
            if already.contains(&path) {
                continue;
            }
            let mut result = FileApplyResult::skipped(path.clone(), reason);
            result.edit_sets = file_edits.edit_set_ids().into_iter().cloned().collect();
            result.changes_skipped = plan.targeted_count(&path);
            result.size_before = plan.sources.get(&path).and_then(FileSource::size);
            report.file_results.push(result);
        }
    }

    fn finish(mut self, mut report: Report) -> Result<BatchApplyResult> {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        report.file_results.sort_by(|a, b| a.path.cmp(&b.path));

        let written = report
            .file_results
            .iter()
            .filter(|f| f.outcome.is_written())
            .count();
        let failed = report
            .file_results
            .iter()
            .filter(|f| f.outcome.is_failed())
            .count();
        let interrupted = report.file_results.iter().any(|f| {
            matches!(
                f.outcome,
                FileOutcome::Skipped {
                    reason: SkipReason::Cancelled | SkipReason::Abandoned
                }
            )
        });

        if report.abort_reason.is_none() && self.token.is_cancelled() && written == 0 {
            report.abort_reason = Some(AbortReason::Cancelled);
        }

        let status = if report.abort_reason.is_some() {
            BatchStatus::Aborted
        } else if failed == 0
            && !interrupted
            && report.unresolved.is_empty()
            && report.rejected.is_empty()
        {
            if written > 0 {
                BatchStatus::Success
            } else if report.dropped.is_empty() {
                BatchStatus::NothingToDo
            } else {
                BatchStatus::Failed
            }
        } else if written == 0 && (failed > 0 || !report.dropped.is_empty()) {
            BatchStatus::Failed
        } else {
            BatchStatus::Partial
        };
        if status == BatchStatus::Aborted && self.phase != ApplyPhase::Aborted {
            self.enter(ApplyPhase::Aborted);
        }

        let paths_where = |pred: fn(&FileOutcome) -> bool| -> Vec<PathBuf> {
            report
                .file_results
                .iter()
                .filter(|f| pred(&f.outcome))
                .map(|f| f.path.clone())
                .collect()
        };
        let modified_files = paths_where(FileOutcome::is_written);
        let failed_files = paths_where(FileOutcome::is_failed);
        let skipped_files = paths_where(|o| matches!(o, FileOutcome::Skipped { .. }));

        for rejected in &report.rejected {
            report
                .warnings
                .push(format!("edit set {} rejected: {}", rejected.id, rejected.reason));
        }
        for conflict in &report.unresolved {
            report
                .warnings
                .push(format!("unresolved conflict: {}", conflict.describe()));
        }

        let summary = ApplySummary::from_files(&report.file_results, duration_ms);
        info!(
            batch_id = %self.batch_id,
            status = ?status,
            modified = summary.modified_files,
            failed = summary.failed_files,
            skipped = summary.skipped_files,
            duration_ms,
            "Edit batch finished"
        );
        self.inner.events.publish(EngineEvent::BatchFinished {
            batch_id: self.batch_id.clone(),
            status,
            session_id: report.session_id.clone(),
        });

        let result = BatchApplyResult {
            batch_id: self.batch_id.clone(),
            session_id: report.session_id,
            status,
            success: status.is_success(),
            phase: self.phase,
            abort_reason: report.abort_reason,
            file_results: report.file_results,
            modified_files,
            failed_files,
            skipped_files,
            applied_edit_sets: report.applied,
            rejected_edit_sets: report.rejected,
            dropped_edit_sets: report.dropped,
            conflicts: report.conflicts,
            resolutions: report.resolutions,
            unresolved_conflicts: report.unresolved,
            validation_issues: report.issues,
            warnings: report.warnings,
            impact: report.impact,
            summary,
            duration_ms,
        };

        if self.options.stop_on_first_error && failed > 0 && written == 0 {
            return Err(EngineError::BatchFailed(Box::new(result)));
        }
        Ok(result)
    }
}

/// Re-read the file, refuse if it changed since the preview, then write or
/// delete it.
async fn commit_file(preview: &FilePreview) -> std::result::Result<FileOutcome, String> {
    let path: &Path = &preview.path;
    let current = read_optional(path)
        .await
        .map_err(|e| format!("failed to re-read file: {e}"))?;
    let current_checksum = current.as_deref().map(sha256_hex);
    if current_checksum != preview.original_checksum {
        return Err("file modified since preview".to_string());
    }

    if preview.deletes_file {
        remove_if_exists(path)
            .await
            .map_err(|e| format!("failed to delete file: {e}"))?;
        return Ok(FileOutcome::Deleted);
    }

    atomic_write(path, preview.modified.as_bytes())
        .await
        .map_err(|e| format!("failed to write file: {e}"))?;
    Ok(if preview.creates_file {
        FileOutcome::Created
    } else {
        FileOutcome::Modified
    })
}

/// Surviving edit sets whose every file was written or left unchanged.
fn applied_edit_sets(
    plan: &Plan,
    dropped: &BTreeSet<&EditSetId>,
    results: &[FileApplyResult],
) -> Vec<EditSetId> {
    let landed: BTreeMap<&Path, bool> = results
        .iter()
        .map(|r| {
            (
                r.path.as_path(),
                r.outcome.is_written() || r.outcome == FileOutcome::Unchanged,
            )
        })
        .collect();
    plan.live()
        .filter(|(_, set)| !dropped.contains(&set.id))
        .filter(|(_, set)| {
            let files = set.files();
            !files.is_empty()
                && files
                    .iter()
                    .all(|f| landed.get(f).copied().unwrap_or(false))
        })
        .map(|(_, set)| set.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn preview_of(path: &Path, original: &str, modified: &str) -> FilePreview {
        let mut preview = FilePreview::failed(path, "");
        preview.error = None;
        preview.exists = true;
        preview.original = original.to_string();
        preview.modified = modified.to_string();
        preview.would_change = original != modified;
        preview.original_checksum = Some(sha256_hex(original));
        preview
    }

    #[tokio::test]
    async fn test_commit_refuses_file_changed_since_preview() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, "edited elsewhere").await.unwrap();

        let preview = preview_of(&path, "original", "patched");
        let err = commit_file(&preview).await.unwrap_err();
        assert_eq!(err, "file modified since preview");
        assert_eq!(
            tokio::fs::read_to_string(&path).await.unwrap(),
            "edited elsewhere"
        );
    }

    #[tokio::test]
    async fn test_commit_writes_and_deletes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, "original").await.unwrap();

        let preview = preview_of(&path, "original", "patched");
        assert_eq!(commit_file(&preview).await.unwrap(), FileOutcome::Modified);
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "patched");

        let mut delete = preview_of(&path, "patched", "");
        delete.deletes_file = true;
        assert_eq!(commit_file(&delete).await.unwrap(), FileOutcome::Deleted);
        assert!(!path.exists());

        let mut create = preview_of(&path, "", "fresh");
        create.exists = false;
        create.creates_file = true;
        create.original_checksum = None;
        assert_eq!(commit_file(&create).await.unwrap(), FileOutcome::Created);
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "fresh");
    }
}
