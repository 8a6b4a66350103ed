pub mod agent_loop;
pub mod context;
pub mod events;
pub mod message;
pub mod router;
pub mod tools;
pub mod verifier;

pub use agent_loop::{AgentLoop, AgentLoopHandle, AgentLoopOptions, LoopControl, LoopHooks, NoHooks};
pub use context::{CompactionStrategy, ContextConfig, ContextManager, Summarizer};
pub use events::{AgentEvent, RunState};
pub use message::{ContentBlock, Message, MessageContent, Role, ToolCall};
pub use router::{AgentProfile, AgentRouter, AgentRule, RoutingDecision};
pub use verifier::{
    CompositeVerifier, FormatVerifier, SemanticVerifier, VerificationInput, VerificationOutcome,
    VerificationResult, Verifier,
};
