//! In-memory table of live sessions.
//!
//! Each session sits behind its own async mutex. Rollback holds that lock for
//! its whole run; the expiry sweep only ever `try_lock`s, so a session being
//! rolled back is skipped rather than swept from under it.

use crate::session::{Session, SessionState, SessionSummary};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SharedSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) -> SharedSession {
        let id = session.id.clone();
        let shared = Arc::new(Mutex::new(session));
        self.sessions.insert(id, Arc::clone(&shared));
        shared
    }

    pub fn get(&self, id: &str) -> Option<SharedSession> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: &str) -> Option<SharedSession> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of the handles. DashMap guards are dropped before any await.
    fn handles(&self) -> Vec<SharedSession> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Summaries of active sessions, newest first, at most `max_count`.
    pub async fn list(&self, max_count: usize) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();
        for handle in self.handles() {
            let session = handle.lock().await;
            if session.is_active() {
                summaries.push(session.summary());
            }
        }
        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        summaries.truncate(max_count);
        summaries
    }

    /// Remove every idle session that expired by `now` and return them,
    /// marked `Expired`. Busy sessions are left for the next sweep.
    pub fn take_expired(&self, now: DateTime<Utc>) -> Vec<Session> {
        let mut expired = Vec::new();
        for handle in self.handles() {
            let Ok(mut session) = handle.try_lock() else {
                continue;
            };
            if !session.is_expired_at(now) {
                continue;
            }
            session.state = SessionState::Expired;
            self.sessions.remove(&session.id);
            debug!(session_id = %session.id, "Session expired");
            expired.push(session.clone());
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::path::Path;

    fn session(retention: Duration) -> Session {
        Session::new(Path::new("/backups"), None, retention)
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let registry = SessionRegistry::new();
        let s = session(Duration::days(1));
        let id = s.id.clone();
        registry.insert(s);
        assert!(registry.contains(&id));
        assert_eq!(registry.get(&id).unwrap().lock().await.id, id);
        assert!(registry.remove(&id).is_some());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_list_newest_first_and_active_only() {
        let registry = SessionRegistry::new();
        let mut old = session(Duration::days(1));
        old.created_at -= Duration::hours(1);
        let old_id = old.id.clone();
        let new = session(Duration::days(1));
        let new_id = new.id.clone();
        let mut done = session(Duration::days(1));
        done.state = SessionState::RolledBack;
        registry.insert(old);
        registry.insert(new);
        registry.insert(done);

        let listed = registry.list(10).await;
        let ids: Vec<_> = listed.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec![new_id.clone(), old_id]);
        assert_eq!(registry.list(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_take_expired_skips_locked() {
        let registry = SessionRegistry::new();
        let stale = session(Duration::seconds(-1));
        let stale_id = stale.id.clone();
        let busy = session(Duration::seconds(-1));
        let busy_id = busy.id.clone();
        registry.insert(stale);
        let busy_handle = registry.insert(busy);
        registry.insert(session(Duration::days(1)));

        let guard = busy_handle.lock().await;
        let expired = registry.take_expired(Utc::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale_id);
        assert_eq!(expired[0].state, SessionState::Expired);
        assert!(registry.contains(&busy_id));
        drop(guard);

        let expired = registry.take_expired(Utc::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(registry.len(), 1);
    }
}
