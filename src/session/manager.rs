//! In-memory session store.
//!
//! Sessions are not persisted across restarts; idle sessions are evicted by
//! a periodic sweep driven from the gateway. All mutations are serialised
//! behind an internal lock so callers never observe partial state.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::session::types::{Session, SessionConfig, SessionStatus};

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create_session(&self, config: SessionConfig) -> Session {
        let session = Session::new(config);
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id.clone(), session.clone());
        info!(session_id = %session.id, channel = %session.config.channel_id, "Session created");
        session
    }

    pub async fn get_session(&self, id: &str) -> Option<Session> {
        let sessions = self.sessions.read().await;
        sessions.get(id).cloned()
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        sessions.values().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Removes the session. Idempotent: ending an unknown or already-ended
    /// session returns false.
    pub async fn end_session(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(id).is_some() {
            info!(session_id = %id, "Session ended");
            true
        } else {
            false
        }
    }

    /// Refreshes `last_active_at`. Missing sessions are ignored.
    pub async fn touch_session(&self, id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id) {
            session.touch();
        }
    }

    pub async fn set_status(&self, id: &str, status: SessionStatus) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id) {
            session.status = status;
        }
    }

    /// Applies `update` to the session's metadata counters under the lock.
    pub async fn update_metadata<F>(&self, id: &str, update: F)
    where
        F: FnOnce(&mut crate::session::types::SessionMetadata),
    {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id) {
            update(&mut session.metadata);
            session.touch();
        }
    }

    /// Removes sessions idle longer than `max_idle_ms`. Returns how many
    /// were evicted.
    pub async fn evict_idle(&self, max_idle_ms: i64) -> usize {
        let cutoff = Utc::now() - Duration::milliseconds(max_idle_ms);
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, session| {
            let keep = session.last_active_at >= cutoff;
            if !keep {
                debug!(session_id = %id, "Evicting idle session");
            }
            keep
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!(evicted, "Idle session sweep complete");
        }
        evicted
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get() {
        let manager = SessionManager::new();
        let session = manager
            .create_session(SessionConfig::for_channel("telegram", Some("42".into())))
            .await;
        let fetched = manager.get_session(&session.id).await.unwrap();
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.config.channel_id, "telegram");
    }

    #[tokio::test]
    async fn test_end_session_idempotent() {
        let manager = SessionManager::new();
        let session = manager.create_session(SessionConfig::default()).await;
        assert!(manager.end_session(&session.id).await);
        assert!(!manager.end_session(&session.id).await);
        assert!(manager.get_session(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn test_touch_unknown_does_not_panic() {
        let manager = SessionManager::new();
        manager.touch_session("no-such-session").await;
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let manager = SessionManager::new();
        manager.create_session(SessionConfig::default()).await;
        manager.create_session(SessionConfig::default()).await;
        assert_eq!(manager.list_sessions().await.len(), 2);
        assert_eq!(manager.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_evict_idle_only_removes_stale() {
        let manager = SessionManager::new();
        let stale = manager.create_session(SessionConfig::default()).await;
        {
            // Backdate the stale session past the idle threshold.
            let mut sessions = manager.sessions.write().await;
            sessions.get_mut(&stale.id).unwrap().last_active_at =
                Utc::now() - Duration::minutes(10);
        }
        let fresh = manager.create_session(SessionConfig::default()).await;

        let evicted = manager.evict_idle(60_000).await;
        assert_eq!(evicted, 1);
        assert!(manager.get_session(&stale.id).await.is_none());
        assert!(manager.get_session(&fresh.id).await.is_some());
    }

    #[tokio::test]
    async fn test_no_surviving_session_exceeds_idle_threshold() {
        let manager = SessionManager::new();
        for backdate_min in [0_i64, 2, 5, 30] {
            let s = manager.create_session(SessionConfig::default()).await;
            let mut sessions = manager.sessions.write().await;
            sessions.get_mut(&s.id).unwrap().last_active_at =
                Utc::now() - Duration::minutes(backdate_min);
        }
        let max_idle_ms = 3 * 60 * 1000;
        manager.evict_idle(max_idle_ms).await;
        let now = Utc::now();
        for s in manager.list_sessions().await {
            assert!((now - s.last_active_at).num_milliseconds() <= max_idle_ms);
        }
    }

    #[tokio::test]
    async fn test_metadata_update() {
        let manager = SessionManager::new();
        let session = manager.create_session(SessionConfig::default()).await;
        manager
            .update_metadata(&session.id, |m| {
                m.llm_calls += 1;
                m.tool_invocations += 2;
            })
            .await;
        let fetched = manager.get_session(&session.id).await.unwrap();
        assert_eq!(fetched.metadata.llm_calls, 1);
        assert_eq!(fetched.metadata.tool_invocations, 2);
    }
}
