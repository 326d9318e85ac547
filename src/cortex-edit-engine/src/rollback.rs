//! Restores the files of a committed session.
//!
//! Rollback holds the session lock for its whole run, so the expiry sweep and
//! a second rollback of the same session wait or skip. A file whose backup is
//! missing or corrupt is reported and left as it is.

use crate::engine::EngineInner;
use crate::events::EngineEvent;
use crate::fs_ops::{atomic_write, read_optional, remove_if_exists};
use crate::result::{RollbackFailure, RollbackFailureReason, RollbackResult, RollbackStatus};
use cortex_backup::{BackupError, BackupRecord, SessionState, sha256_hex};
use futures::future::join_all;
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum RecordOutcome {
    Restored(PathBuf),
    Deleted(PathBuf),
    Failed(RollbackFailure),
    Skipped(PathBuf),
}

impl From<BackupError> for RollbackFailureReason {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::BackupMissing(_) => Self::BackupMissing,
            BackupError::BackupCorrupted {
                expected, actual, ..
            } => Self::BackupCorrupted { expected, actual },
            other => Self::Io {
                message: other.to_string(),
            },
        }
    }
}

pub(crate) async fn rollback_session(
    inner: &EngineInner,
    session_id: &str,
    token: CancellationToken,
) -> RollbackResult {
    let started = Instant::now();
    let Some(shared) = inner.registry.get(session_id) else {
        info!(session_id, "Rollback requested for unknown session");
        return RollbackResult::without_session(session_id, RollbackStatus::SessionNotFound);
    };

    let mut session = shared.lock().await;
    if !session.is_active() {
        return RollbackResult::without_session(session_id, RollbackStatus::SessionNotFound);
    }

    if session.is_expired() {
        session.state = SessionState::Expired;
        inner.registry.remove(session_id);
        if let Err(e) = inner.store.remove_session(&session).await {
            warn!(session_id, error = %e, "Failed to remove expired session");
        }
        info!(session_id, "Rollback refused: session expired");
        inner.events.publish(EngineEvent::SessionExpired {
            session_id: session_id.to_string(),
        });
        return RollbackResult::without_session(session_id, RollbackStatus::SessionExpired);
    }

    info!(session_id, files = session.records.len(), "Rolling back session");
    let parallelism = inner.config.resolved_parallelism(None);
    let semaphore = Semaphore::new(parallelism);
    let outcomes = join_all(
        session
            .records
            .iter()
            .map(|record| restore_record(inner, record, &token, &semaphore)),
    )
    .await;

    let mut result = RollbackResult::without_session(session_id, RollbackStatus::Completed);
    for outcome in outcomes {
        match outcome {
            RecordOutcome::Restored(path) => result.restored_files.push(path),
            RecordOutcome::Deleted(path) => result.deleted_files.push(path),
            RecordOutcome::Failed(failure) => result.failed_files.push(failure),
            RecordOutcome::Skipped(path) => result.skipped_files.push(path),
        }
    }

    result.status = if !result.failed_files.is_empty() {
        RollbackStatus::Partial
    } else if !result.skipped_files.is_empty() {
        RollbackStatus::Cancelled
    } else {
        RollbackStatus::Completed
    };

    if result.status == RollbackStatus::Completed {
        session.state = SessionState::RolledBack;
        inner.registry.remove(session_id);
        if let Err(e) = inner.store.remove_session(&session).await {
            warn!(session_id, error = %e, "Rolled back but failed to remove session backups");
        }
        result.success = true;
    }

    result.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        session_id,
        status = ?result.status,
        restored = result.restored_files.len(),
        deleted = result.deleted_files.len(),
        failed = result.failed_files.len(),
        skipped = result.skipped_files.len(),
        "Rollback finished"
    );
    inner.events.publish(EngineEvent::SessionRolledBack {
        session_id: session_id.to_string(),
        status: result.status,
    });
    result
}

async fn restore_record(
    inner: &EngineInner,
    record: &BackupRecord,
    token: &CancellationToken,
    semaphore: &Semaphore,
) -> RecordOutcome {
    let _permit = semaphore.acquire().await;
    let path = record.original_path.clone();
    if token.is_cancelled() {
        return RecordOutcome::Skipped(path);
    }

    let _guard = inner.locks.lock(&path).await;

    if record.was_created {
        return match remove_if_exists(&path).await {
            Ok(_) => {
                debug!(file = %path.display(), "Removed file created by the batch");
                RecordOutcome::Deleted(path)
            }
            Err(e) => failure(path, RollbackFailureReason::Io {
                message: e.to_string(),
            }),
        };
    }

    let bytes = match inner.store.read_backup(record).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(file = %path.display(), error = %e, "Backup unusable; file left as is");
            return failure(path, e.into());
        }
    };

    if let Err(e) = atomic_write(&path, &bytes).await {
        return failure(path, RollbackFailureReason::Io {
            message: e.to_string(),
        });
    }

    if let Some(expected) = &record.original_checksum {
        let actual = match read_optional(&path).await {
            Ok(Some(content)) => sha256_hex(&content),
            Ok(None) => String::new(),
            Err(e) => {
                return failure(path, RollbackFailureReason::Io {
                    message: e.to_string(),
                });
            }
        };
        if &actual != expected {
            return failure(path, RollbackFailureReason::VerificationFailed {
                expected: expected.clone(),
                actual,
            });
        }
    }

    debug!(file = %path.display(), "Restored file");
    RecordOutcome::Restored(path)
}

fn failure(path: PathBuf, reason: RollbackFailureReason) -> RecordOutcome {
    warn!(file = %path.display(), reason = ?reason, "Rollback of file failed");
    RecordOutcome::Failed(RollbackFailure { path, reason })
}
