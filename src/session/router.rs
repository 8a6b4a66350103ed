//! Message-to-session routing.
//!
//! Each inbound message is canonicalised to a route key derived from its
//! `(channel, group, thread, user)` scope. The first message for a key
//! creates a session; later messages reuse it for as long as the session
//! lives. Bindings whose session has been evicted are cleared lazily on the
//! next lookup, so no back-pointer from the session store is needed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::channels::types::InboundMessage;
use crate::session::manager::SessionManager;
use crate::session::types::SessionConfig;

/// Canonical conversation-scope key for an inbound message.
///
/// - group + thread  -> `"{channel}:group:{group}:thread:{thread}"`
/// - group only      -> `"{channel}:group:{group}:user:{user|anonymous}"`
/// - direct          -> `"{channel}:{user|anonymous}"`
pub fn route_key(msg: &InboundMessage) -> String {
    let user = msg.from.user_or_anonymous();
    match (&msg.from.group_id, &msg.from.thread_id) {
        (Some(group), Some(thread)) => {
            format!("{}:group:{}:thread:{}", msg.channel_id, group, thread)
        }
        (Some(group), None) => format!("{}:group:{}:user:{}", msg.channel_id, group, user),
        _ => format!("{}:{}", msg.channel_id, user),
    }
}

#[derive(Debug, Clone)]
pub struct RouteBinding {
    pub session_id: String,
    pub config: SessionConfig,
    pub route_key: String,
}

pub struct MessageRouter {
    sessions: Arc<SessionManager>,
    routes: RwLock<HashMap<String, String>>,
    default_config: SessionConfig,
}

impl MessageRouter {
    pub fn new(sessions: Arc<SessionManager>, default_config: SessionConfig) -> Self {
        Self {
            sessions,
            routes: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    /// Binds the message to a session, creating one on first sight.
    /// Returns `None` when the message carries no channel id.
    pub async fn route(&self, msg: &InboundMessage) -> Option<RouteBinding> {
        if msg.channel_id.is_empty() {
            return None;
        }
        let key = route_key(msg);

        let mut routes = self.routes.write().await;
        if let Some(session_id) = routes.get(&key) {
            if let Some(session) = self.sessions.get_session(session_id).await {
                self.sessions.touch_session(session_id).await;
                return Some(RouteBinding {
                    session_id: session.id,
                    config: session.config,
                    route_key: key,
                });
            }
            // The bound session was evicted: clear the stale entry and fall
            // through to create a fresh one.
            debug!(route_key = %key, stale = %session_id, "Clearing stale route binding");
            routes.remove(&key);
        }

        let mut config = self.default_config.clone();
        config.channel_id = msg.channel_id.clone();
        config.user_id = msg.from.user_id.clone();
        let session = self.sessions.create_session(config.clone()).await;
        routes.insert(key.clone(), session.id.clone());
        Some(RouteBinding {
            session_id: session.id,
            config,
            route_key: key,
        })
    }

    /// Drops the binding for a route key, if any.
    pub async fn unbind(&self, key: &str) {
        self.routes.write().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::types::Sender;

    fn group_message(group: &str, thread: Option<&str>, user: Option<&str>) -> InboundMessage {
        let from = Sender {
            channel_id: "slack".into(),
            user_id: user.map(Into::into),
            group_id: Some(group.into()),
            thread_id: thread.map(Into::into),
            name: None,
        };
        InboundMessage::new("slack", from, "hi")
    }

    #[test]
    fn test_route_key_group_and_thread() {
        let msg = group_message("g9", Some("t3"), Some("u1"));
        assert_eq!(route_key(&msg), "slack:group:g9:thread:t3");
    }

    #[test]
    fn test_route_key_group_only() {
        let msg = group_message("g9", None, Some("u1"));
        assert_eq!(route_key(&msg), "slack:group:g9:user:u1");
        let anon = group_message("g9", None, None);
        assert_eq!(route_key(&anon), "slack:group:g9:user:anonymous");
    }

    #[test]
    fn test_route_key_direct() {
        let msg = InboundMessage::from_user("telegram", "42", "hi");
        assert_eq!(route_key(&msg), "telegram:42");
    }

    #[tokio::test]
    async fn test_route_is_stable_for_same_key() {
        let sessions = Arc::new(SessionManager::new());
        let router = MessageRouter::new(sessions, SessionConfig::default());

        let m1 = InboundMessage::from_user("telegram", "42", "first");
        let m2 = InboundMessage::from_user("telegram", "42", "second");
        let b1 = router.route(&m1).await.unwrap();
        let b2 = router.route(&m2).await.unwrap();
        assert_eq!(b1.session_id, b2.session_id);
    }

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_sessions() {
        let sessions = Arc::new(SessionManager::new());
        let router = MessageRouter::new(sessions, SessionConfig::default());

        let a = router
            .route(&InboundMessage::from_user("telegram", "42", "hi"))
            .await
            .unwrap();
        let b = router
            .route(&InboundMessage::from_user("telegram", "43", "hi"))
            .await
            .unwrap();
        assert_ne!(a.session_id, b.session_id);
    }

    #[tokio::test]
    async fn test_empty_channel_is_unroutable() {
        let sessions = Arc::new(SessionManager::new());
        let router = MessageRouter::new(sessions, SessionConfig::default());
        let mut msg = InboundMessage::from_user("x", "42", "hi");
        msg.channel_id = String::new();
        assert!(router.route(&msg).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_binding_is_cleared_after_eviction() {
        let sessions = Arc::new(SessionManager::new());
        let router = MessageRouter::new(Arc::clone(&sessions), SessionConfig::default());

        let msg = InboundMessage::from_user("telegram", "42", "hi");
        let first = router.route(&msg).await.unwrap();
        sessions.end_session(&first.session_id).await;

        let second = router.route(&msg).await.unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert!(sessions.get_session(&second.session_id).await.is_some());
    }

    #[tokio::test]
    async fn test_new_session_inherits_default_config() {
        let sessions = Arc::new(SessionManager::new());
        let mut default_config = SessionConfig::default();
        default_config.max_iterations = 7;
        let router = MessageRouter::new(sessions, default_config);

        let binding = router
            .route(&InboundMessage::from_user("telegram", "42", "hi"))
            .await
            .unwrap();
        assert_eq!(binding.config.max_iterations, 7);
        assert_eq!(binding.config.channel_id, "telegram");
        assert_eq!(binding.config.user_id.as_deref(), Some("42"));
    }
}
