//! The edit engine facade.

use crate::applier::BatchApplier;
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use crate::fs_ops::FileLocks;
use crate::options::ApplyOptions;
use crate::planner::Plan;
use crate::result::{BatchApplyResult, RollbackResult};
use crate::rollback::rollback_session;
use crate::Result;
use chrono::Utc;
use cortex_backup::{BackupStore, SessionRegistry, SessionState, SessionSummary};
use cortex_edits::{
    Conflict, ConflictDetector, ConflictResolver, ConflictStrategy, DelimiterBalanceValidator,
    EditSet, PreviewBatchResult, PreviewGenerator, ResolutionOutcome, Validator,
};
use dashmap::DashSet;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State shared by every clone of an [`EditEngine`].
pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) store: BackupStore,
    pub(crate) registry: SessionRegistry,
    pub(crate) locks: FileLocks,
    pub(crate) events: EventBus,
    pub(crate) generator: PreviewGenerator,
    /// Sessions of batches still between BackingUp and Committed.
    pub(crate) pending: DashSet<String>,
}

impl EngineInner {
    /// Remove backup directories left without metadata for longer than the
    /// retention window.
    async fn remove_orphans(&self) -> usize {
        let cutoff = Utc::now() - self.config.retention();
        let in_use = |id: &str| self.registry.contains(id) || self.pending.contains(id);
        match self.store.remove_orphans(cutoff, in_use).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(root = %self.store.root().display(), error = %e, "Failed to sweep orphaned backups");
                0
            }
        }
    }
}

/// Applies edit sets transactionally and rolls committed batches back.
///
/// Clones are cheap and share sessions, file locks and the event bus, so one
/// engine can serve concurrent batches from many tasks.
#[derive(Clone)]
pub struct EditEngine {
    inner: Arc<EngineInner>,
    validators: Arc<[Arc<dyn Validator>]>,
}

impl std::fmt::Debug for EditEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditEngine")
            .field("backup_root", &self.inner.store.root())
            .field("sessions", &self.inner.registry.len())
            .field("validators", &self.validators.len())
            .finish()
    }
}

impl EditEngine {
    /// Engine with an empty session table. Sessions persisted by an earlier
    /// process are not loaded; use [`EditEngine::open`] for that.
    ///
    /// [`DelimiterBalanceValidator`] is registered unless
    /// `builtin_validators` is off.
    pub fn new(config: EngineConfig) -> Self {
        let store = BackupStore::new(config.resolved_backup_root());
        let events = EventBus::new(config.event_capacity);
        let generator = PreviewGenerator::new().with_context_lines(config.diff_context_lines);
        let validators: Vec<Arc<dyn Validator>> = if config.builtin_validators {
            vec![Arc::new(DelimiterBalanceValidator)]
        } else {
            Vec::new()
        };
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                registry: SessionRegistry::new(),
                locks: FileLocks::new(),
                events,
                generator,
                pending: DashSet::new(),
            }),
            validators: validators.into(),
        }
    }

    /// Engine that picks up the active sessions left on disk by earlier
    /// processes, so their batches can still be rolled back. Backup
    /// directories orphaned past the retention window are deleted.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let engine = Self::new(config);
        engine.inner.remove_orphans().await;
        if engine.inner.config.persist_sessions {
            let now = Utc::now();
            for session in engine.inner.store.load_sessions().await? {
                if !session.is_active() {
                    continue;
                }
                if session.is_expired_at(now) {
                    debug!(session_id = %session.id, "Discarding expired session found on disk");
                    if let Err(e) = engine.inner.store.remove_session(&session).await {
                        warn!(session_id = %session.id, error = %e, "Failed to remove expired session");
                    }
                    continue;
                }
                engine.inner.registry.insert(session);
            }
            info!(
                root = %engine.inner.store.root().display(),
                sessions = engine.inner.registry.len(),
                "Edit engine opened"
            );
        }
        Ok(engine)
    }

    /// Register a validator run over every written file.
    pub fn with_validator(mut self, validator: impl Validator + 'static) -> Self {
        let mut validators = self.validators.to_vec();
        validators.push(Arc::new(validator));
        self.validators = validators.into();
        self
    }

    /// Drop every registered validator, built-in ones included.
    pub fn without_validators(mut self) -> Self {
        self.validators = Vec::new().into();
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Apply options seeded from the engine config.
    pub fn default_options(&self) -> ApplyOptions {
        ApplyOptions::from_config(&self.inner.config)
    }

    /// Compute what a batch would do without writing anything.
    ///
    /// Files whose edits collide across edit sets come back as failed
    /// previews; the conflicts themselves are listed on the result.
    pub async fn preview(&self, edit_sets: &[EditSet]) -> PreviewBatchResult {
        let parallelism = self.inner.config.resolved_parallelism(None);
        let plan = Plan::build(edit_sets, &ApplyOptions::default(), parallelism).await;
        let conflicts = plan.conflicts();
        let files = plan.file_edits(&BTreeSet::new());
        let previews = plan.render(&self.inner.generator, &files);
        debug!(
            files = previews.len(),
            conflicts = conflicts.len(),
            rejected = plan.rejected.len(),
            "Batch previewed"
        );
        PreviewBatchResult::new(previews, conflicts, plan.rejected)
    }

    /// Conflicts between the edit sets of a batch, in submission order.
    pub fn detect_conflicts(&self, edit_sets: &[EditSet]) -> Vec<Conflict> {
        ConflictDetector::detect(edit_sets)
    }

    /// Settle `conflicts` with `strategy`, dropping dependents of every loser.
    pub fn resolve_conflicts(
        &self,
        conflicts: &[Conflict],
        strategy: ConflictStrategy,
        edit_sets: &[EditSet],
    ) -> ResolutionOutcome {
        let mut outcome = ConflictResolver::resolve_all(conflicts, strategy);
        outcome.cascade_dependencies(edit_sets);
        outcome
    }

    /// Apply a batch.
    ///
    /// Per-file failures are reported inside the result. `Err` is returned
    /// only for a fail-fast batch in which every attempted file failed.
    pub async fn apply(
        &self,
        edit_sets: &[EditSet],
        options: ApplyOptions,
    ) -> Result<BatchApplyResult> {
        self.apply_with_cancellation(edit_sets, options, CancellationToken::new())
            .await
    }

    /// Like [`EditEngine::apply`], stopping between files once `token` is
    /// cancelled. Files already written stay written and can be rolled back
    /// through the returned session.
    pub async fn apply_with_cancellation(
        &self,
        edit_sets: &[EditSet],
        options: ApplyOptions,
        token: CancellationToken,
    ) -> Result<BatchApplyResult> {
        let result = BatchApplier::new(&self.inner, &self.validators, options, token)
            .run(edit_sets)
            .await;
        self.inner.locks.prune();
        result
    }

    /// Restore every file of a committed session to its pre-batch content.
    pub async fn rollback(&self, session_id: &str) -> RollbackResult {
        self.rollback_with_cancellation(session_id, CancellationToken::new())
            .await
    }

    pub async fn rollback_with_cancellation(
        &self,
        session_id: &str,
        token: CancellationToken,
    ) -> RollbackResult {
        let result = rollback_session(&self.inner, session_id, token).await;
        self.inner.locks.prune();
        result
    }

    /// Active sessions, newest first.
    pub async fn list_sessions(&self, max_count: usize) -> Vec<SessionSummary> {
        self.inner.registry.list(max_count).await
    }

    /// Discard every expired session that is not being rolled back, along
    /// with backup directories orphaned past the retention window. Returns
    /// how many were discarded.
    pub async fn cleanup_expired_sessions(&self) -> usize {
        let orphans = self.inner.remove_orphans().await;
        let expired = self.inner.registry.take_expired(Utc::now());
        for session in &expired {
            if let Err(e) = self.inner.store.remove_session(session).await {
                warn!(session_id = %session.id, error = %e, "Failed to remove expired session");
            }
            self.inner.events.publish(EngineEvent::SessionExpired {
                session_id: session.id.clone(),
            });
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired sessions cleaned up");
        }
        expired.len() + orphans
    }

    /// Discard one session without restoring anything. Returns `false` when
    /// no such session is registered.
    pub async fn cleanup_session(&self, session_id: &str) -> bool {
        let Some(shared) = self.inner.registry.get(session_id) else {
            return false;
        };
        let mut session = shared.lock().await;
        if !self.inner.registry.contains(session_id) {
            // Rolled back or swept while we waited.
            return false;
        }
        session.state = SessionState::Expired;
        self.inner.registry.remove(session_id);
        if let Err(e) = self.inner.store.remove_session(&session).await {
            warn!(session_id, error = %e, "Failed to remove session backups");
        }
        debug!(session_id, "Session discarded");
        true
    }

    /// Run [`EditEngine::cleanup_expired_sessions`] every `interval` until
    /// `token` is cancelled.
    pub fn spawn_expiry_sweeper(&self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Expiry sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        engine.cleanup_expired_sessions().await;
                    }
                }
            }
        })
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }
}
