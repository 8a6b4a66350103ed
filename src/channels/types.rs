use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_CONTENT_LENGTH: usize = 16_000;

/// Identity of the message originator within a channel.
///
/// `user_id` identifies a human; `group_id` and `thread_id` identify the
/// topic scope the message belongs to. All parts are optional because not
/// every surface has the concept (a webhook has no thread, a CLI has no
/// group).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sender {
    pub channel_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Sender {
    pub fn user(channel_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    /// The user part of rate-limit and route keys, `anonymous` when absent.
    pub fn user_or_anonymous(&self) -> &str {
        self.user_id.as_deref().unwrap_or("anonymous")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Audio,
    Image,
    Video,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub url: String,
    /// Filled in by the speech-to-text collaborator for audio attachments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

impl Attachment {
    pub fn audio(url: impl Into<String>) -> Self {
        Self {
            kind: AttachmentKind::Audio,
            url: url.into(),
            transcript: None,
        }
    }

    pub fn is_audio(&self) -> bool {
        self.kind == AttachmentKind::Audio
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub channel_id: String,
    pub from: Sender,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        channel_id: impl Into<String>,
        from: Sender,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            from,
            text: Some(text.into()),
            attachments: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Shorthand for a plain direct message from a user.
    pub fn from_user(
        channel_id: impl Into<String>,
        user_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let channel_id = channel_id.into();
        let from = Sender::user(channel_id.clone(), user_id);
        Self::new(channel_id, from, text)
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn has_audio(&self) -> bool {
        self.attachments.iter().any(Attachment::is_audio)
    }

    /// Trims and bounds the message text.
    /// Returns false when there is nothing to process (no text and no audio).
    pub fn sanitize(&mut self) -> bool {
        if let Some(text) = &self.text {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                self.text = None;
            } else if trimmed.chars().count() > MAX_CONTENT_LENGTH {
                tracing::warn!(
                    channel = %self.channel_id,
                    original_length = text.len(),
                    "Message too long, truncating to {}",
                    MAX_CONTENT_LENGTH
                );
                self.text = Some(trimmed.chars().take(MAX_CONTENT_LENGTH).collect());
            } else if trimmed.len() != text.len() {
                self.text = Some(trimmed.to_string());
            }
        }
        self.text.is_some() || self.has_audio()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundFormat {
    #[default]
    Text,
    Markdown,
    Html,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
    pub format: OutboundFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl OutboundMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: OutboundFormat::Text,
            reply_to: None,
        }
    }

    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: OutboundFormat::Markdown,
            reply_to: None,
        }
    }

    pub fn reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }
}

/// Where an outbound message should be delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub channel_id: String,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub thread_id: Option<String>,
}

impl Recipient {
    pub fn of(sender: &Sender) -> Self {
        Self {
            channel_id: sender.channel_id.clone(),
            user_id: sender.user_id.clone(),
            group_id: sender.group_id.clone(),
            thread_id: sender.thread_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_message_creation() {
        let msg = InboundMessage::from_user("telegram", "123456789", "Hello!");
        assert_eq!(msg.channel_id, "telegram");
        assert_eq!(msg.from.user_id.as_deref(), Some("123456789"));
        assert_eq!(msg.text.as_deref(), Some("Hello!"));
        assert!(msg.attachments.is_empty());
        let now = Utc::now();
        assert!(now.signed_duration_since(msg.timestamp).num_seconds() < 5);
    }

    #[test]
    fn test_sanitize_whitespace_only_without_audio() {
        let mut msg = InboundMessage::from_user("telegram", "123", "   ");
        assert!(!msg.sanitize());
        assert!(msg.text.is_none());
    }

    #[test]
    fn test_sanitize_whitespace_with_audio_is_kept() {
        let mut msg = InboundMessage::from_user("telegram", "123", "")
            .with_attachment(Attachment::audio("https://cdn/voice.ogg"));
        assert!(msg.sanitize());
    }

    #[test]
    fn test_sanitize_trims() {
        let mut msg = InboundMessage::from_user("telegram", "123", "  hello  ");
        assert!(msg.sanitize());
        assert_eq!(msg.text.as_deref(), Some("hello"));
    }

    #[test]
    fn test_sanitize_truncates() {
        let long = "a".repeat(MAX_CONTENT_LENGTH + 10);
        let mut msg = InboundMessage::from_user("telegram", "123", long);
        assert!(msg.sanitize());
        assert_eq!(msg.text.unwrap().chars().count(), MAX_CONTENT_LENGTH);
    }

    #[test]
    fn test_user_or_anonymous() {
        let named = Sender::user("webchat", "u1");
        assert_eq!(named.user_or_anonymous(), "u1");
        let anon = Sender {
            channel_id: "webchat".into(),
            ..Default::default()
        };
        assert_eq!(anon.user_or_anonymous(), "anonymous");
    }

    #[test]
    fn test_outbound_message_builders() {
        let msg = OutboundMessage::markdown("**hi**").reply_to("mid_7");
        assert_eq!(msg.format, OutboundFormat::Markdown);
        assert_eq!(msg.reply_to.as_deref(), Some("mid_7"));
    }

    #[test]
    fn test_timestamp_serializes_iso8601_utc() {
        let msg = InboundMessage::from_user("telegram", "123", "Test");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("T"));
        assert!(json.contains("Z"));
    }
}
