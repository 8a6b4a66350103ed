//! Channel fabric: the transport abstraction every conversational surface
//! implements, plus the supervisor and the inbound pipeline.
//!
//! A channel adapter owns one wire protocol (a chat API, a webhook source,
//! a local socket). It delivers inbound messages through the sender handed
//! to [`Channel::start`] and maps outbound messages back onto its wire
//! format, no-oping features its surface cannot express.

pub mod pipeline;
pub mod supervisor;
pub mod types;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::channels::types::{InboundMessage, OutboundMessage, Recipient};

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("channel failed to start: {0}")]
    Start(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("operation not supported by this channel: {0}")]
    Unsupported(&'static str),
}

/// Presence change reported by a channel (typing, online, offline).
#[derive(Debug, Clone)]
pub struct PresenceEvent {
    pub channel_id: String,
    pub user_id: Option<String>,
    pub status: String,
}

/// Handles given to a channel when it starts: where to push inbound
/// messages and presence changes.
#[derive(Clone)]
pub struct ChannelContext {
    pub inbound: mpsc::Sender<InboundMessage>,
    pub presence: mpsc::Sender<PresenceEvent>,
}

#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable identifier, also the `channel_id` on its inbound messages.
    fn id(&self) -> &str;

    /// Connects to the surface and begins delivering inbound messages via
    /// `ctx.inbound`. Must return promptly after setup; long-lived wire
    /// loops belong in spawned tasks.
    async fn start(&self, ctx: ChannelContext) -> Result<(), ChannelError>;

    async fn stop(&self) -> Result<(), ChannelError>;

    /// Delivers an outbound message. Returns the surface's message id when
    /// it has one, so the stream handler can edit the message later.
    async fn send(
        &self,
        recipient: &Recipient,
        message: OutboundMessage,
    ) -> Result<Option<String>, ChannelError>;

    fn is_healthy(&self) -> bool;

    /// Whether [`Channel::edit_message`] works on this surface.
    fn supports_editing(&self) -> bool {
        false
    }

    async fn edit_message(
        &self,
        _recipient: &Recipient,
        _message_id: &str,
        _message: OutboundMessage,
    ) -> Result<(), ChannelError> {
        Err(ChannelError::Unsupported("edit_message"))
    }

    /// Reactions are best-effort; plain-text surfaces silently no-op.
    async fn send_reaction(
        &self,
        _recipient: &Recipient,
        _message_id: &str,
        _reaction: &str,
    ) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Voice reply, for surfaces that can play audio. Default: unsupported.
    async fn send_voice(
        &self,
        _recipient: &Recipient,
        _audio_path: &std::path::Path,
    ) -> Result<(), ChannelError> {
        Err(ChannelError::Unsupported("send_voice"))
    }
}
