use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

/// Per-session configuration, inherited from the process-wide default when a
/// session is created by the router.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub channel_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    20
}

impl SessionConfig {
    pub fn for_channel(channel_id: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            user_id,
            model: None,
            max_iterations: default_max_iterations(),
        }
    }
}

/// Usage counters accumulated over the session's lifetime.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub loop_iterations: u64,
    pub llm_calls: u64,
    pub tool_invocations: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub config: SessionConfig,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub metadata: SessionMetadata,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            status: SessionStatus::Active,
            created_at: now,
            last_active_at: now,
            metadata: SessionMetadata::default(),
        }
    }

    pub fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_creation() {
        let session = Session::new(SessionConfig::for_channel("telegram", Some("123".into())));
        assert!(session.is_active());
        assert_eq!(session.config.channel_id, "telegram");
        assert_eq!(session.config.max_iterations, 20);
        assert!(session.created_at <= session.last_active_at);
        assert_eq!(session.metadata.llm_calls, 0);
    }

    #[test]
    fn test_session_ids_unique() {
        let a = Session::new(SessionConfig::default());
        let b = Session::new(SessionConfig::default());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_touch_refreshes_last_active() {
        let mut session = Session::new(SessionConfig::default());
        let before = session.last_active_at;
        session.touch();
        assert!(session.last_active_at >= before);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Active).unwrap();
        assert_eq!(json, "\"active\"");
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_iterations, 20);
        assert!(config.user_id.is_none());
    }
}
