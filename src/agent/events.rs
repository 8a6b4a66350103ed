//! Tagged event stream emitted by one agent-loop run.

use serde_json::Value;

use crate::agent::verifier::VerificationResult;
use crate::engine::Usage;

#[derive(Debug, Clone)]
pub enum AgentEvent {
    Started,
    /// Accumulated partial answer so far, updated per engine text delta.
    Text { partial: String },
    ToolStart {
        id: String,
        tool: String,
        args: Value,
    },
    ToolEnd {
        id: String,
        tool: String,
        result: String,
        is_error: bool,
    },
    ToolValidationError {
        tool: String,
        message: String,
    },
    Complete {
        answer: String,
        usage: Usage,
        verification: Option<VerificationResult>,
    },
    Error {
        message: String,
    },
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Complete { .. } | AgentEvent::Error { .. })
    }
}

/// Run lifecycle. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(
            AgentEvent::Complete {
                answer: "x".into(),
                usage: Usage::default(),
                verification: None
            }
            .is_terminal()
        );
        assert!(AgentEvent::Error { message: "m".into() }.is_terminal());
        assert!(!AgentEvent::Started.is_terminal());
        assert!(!AgentEvent::Text { partial: "p".into() }.is_terminal());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RunState::Idle.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
    }
}
