//! LLM engine abstraction.
//!
//! An engine turns a conversation context plus tool descriptors into a
//! lazy stream of events: text deltas, tool calls and a terminal completion
//! or error. Concrete transports (provider HTTP APIs, subprocess CLIs) live
//! behind [`Engine`]; the agent loop only sees the event stream, a steer
//! input and a cancel handle.

pub mod mock;
pub mod stream_parser;
pub mod subprocess;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::message::{Message, ToolCall};
use crate::agent::tools::ToolDefinition;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

/// Events yielded by one engine run, in engine-observed order.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Started,
    TextDelta(String),
    ToolCallRequested(ToolCall),
    Completed { answer: String, usage: Usage },
    Error(EngineError),
}

/// Transport and engine failures. `is_retryable` drives the agent loop's
/// retry budget: network trouble and overloaded upstreams are worth a
/// backoff, credential and validation failures are not.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("network error: {0}")]
    Network(String),

    #[error("upstream server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Rate limit on a metered engine: retrying burns budget, surface it.
    #[error("metered rate limit: {0}")]
    MeteredRateLimit(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("request rejected: {0}")]
    Validation(String),

    #[error("engine process exited with status {exit_code}: {stderr}")]
    Subprocess { exit_code: i32, stderr: String, retryable: bool },

    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Network(_) => true,
            EngineError::Server { .. } => true,
            EngineError::RateLimited { .. } => true,
            EngineError::Subprocess { retryable, .. } => *retryable,
            EngineError::MeteredRateLimit(_)
            | EngineError::Auth(_)
            | EngineError::Validation(_)
            | EngineError::Cancelled => false,
        }
    }

    /// Classifies subprocess stderr: credential failures and provider rate
    /// limits get a non-retryable error with the stderr preserved as
    /// user-visible guidance; any other non-zero exit is worth one retry.
    pub fn from_subprocess_exit(exit_code: i32, stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        let auth = ["invalid api key", "unauthorized", "authentication", "credential"];
        let rate = ["rate limit", "quota exceeded", "too many requests"];
        if auth.iter().any(|p| lower.contains(p)) {
            return EngineError::Auth(stderr.trim().to_string());
        }
        if rate.iter().any(|p| lower.contains(p)) {
            return EngineError::MeteredRateLimit(stderr.trim().to_string());
        }
        EngineError::Subprocess {
            exit_code,
            stderr: stderr.trim().to_string(),
            retryable: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub model: Option<String>,
}

/// Handle to one in-flight engine run: a finite, non-restartable event
/// stream (consumer-paced through the bounded channel), an optional steer
/// input and a cancel handle.
#[derive(Debug)]
pub struct EngineRun {
    pub events: mpsc::Receiver<EngineEvent>,
    pub steer: Option<mpsc::Sender<String>>,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    /// Starts a run. Errors returned here are pre-flight failures; errors
    /// mid-run arrive as [`EngineEvent::Error`] on the stream.
    async fn start_run(&self, request: EngineRequest) -> Result<EngineRun, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::Network("timeout".into()).is_retryable());
        assert!(
            EngineError::Server {
                status: 503,
                message: "overloaded".into()
            }
            .is_retryable()
        );
        assert!(EngineError::RateLimited { retry_after_secs: 3 }.is_retryable());
        assert!(!EngineError::Auth("bad key".into()).is_retryable());
        assert!(!EngineError::Validation("schema".into()).is_retryable());
        assert!(!EngineError::MeteredRateLimit("quota".into()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
    }

    #[test]
    fn test_subprocess_auth_pattern_not_retryable() {
        let err = EngineError::from_subprocess_exit(1, "error: Invalid API key provided");
        assert!(matches!(err, EngineError::Auth(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_subprocess_rate_limit_pattern_not_retryable() {
        let err = EngineError::from_subprocess_exit(1, "Rate limit reached for this model");
        assert!(matches!(err, EngineError::MeteredRateLimit(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_subprocess_generic_exit_retryable() {
        let err = EngineError::from_subprocess_exit(137, "killed");
        assert!(err.is_retryable());
    }
}
