//! Tool framework: the [`Tool`] trait, the registry the agent loop draws
//! from, and the state-snapshot record used by the verifier.
//!
//! A tool declares its name, description and JSON-Schema parameters,
//! validates arguments before execution, and executes with a cooperative
//! abort signal. Tools that can cheaply describe the state they act on
//! (a file's mtime, a directory listing) expose snapshots so the verifier
//! can confirm that write-class tools actually changed something.

pub mod filesystem;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments for tool '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Tool '{tool}' execution failed: {message}")]
    ExecutionFailed { tool: String, message: String },

    #[error("Permission denied for tool '{tool}': {message}")]
    PermissionDenied { tool: String, message: String },

    #[error("Tool '{tool}' timed out after {duration}s")]
    Timeout { tool: String, duration: u64 },

    #[error("Tool '{tool}' aborted")]
    Aborted { tool: String },
}

impl ToolError {
    pub fn tool_name(&self) -> &str {
        match self {
            ToolError::NotFound(name) => name,
            ToolError::InvalidArguments { tool, .. } => tool,
            ToolError::ExecutionFailed { tool, .. } => tool,
            ToolError::PermissionDenied { tool, .. } => tool,
            ToolError::Timeout { tool, .. } => tool,
            ToolError::Aborted { tool } => tool,
        }
    }
}

pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// Conversation scope a tool executes in.
#[derive(Debug, Clone, Default)]
pub struct ToolExecutionContext {
    pub channel_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

/// Tool descriptor handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Pre/post snapshots captured around one tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

impl StateRecord {
    /// Whether the snapshots show any observable change.
    pub fn has_delta(&self) -> bool {
        match (&self.before, &self.after) {
            (Some(before), Some(after)) => before != after,
            _ => false,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn parameters(&self) -> Value;

    /// Cheap argument validation run before execution. The default accepts
    /// anything; tools with required fields override this.
    fn validate(&self, _args: &Value) -> ToolResult<()> {
        Ok(())
    }

    /// Executes the tool. `abort` is a cooperative signal: long-running
    /// tools should poll or select on it and return [`ToolError::Aborted`].
    async fn execute(
        &self,
        args: Value,
        ctx: &ToolExecutionContext,
        abort: CancellationToken,
    ) -> ToolResult<String>;

    /// Optional snapshot of the state this tool acts on, captured before
    /// and after execution. `None` means the tool has no observable state.
    async fn state_snapshot(&self, _args: &Value) -> Option<Value> {
        None
    }

    /// Whether this tool mutates external state (used by the verifier to
    /// demand a snapshot delta).
    fn is_write_class(&self) -> bool {
        false
    }

    /// Heavyweight tools are dispatched through the worker pool.
    fn heavyweight(&self) -> bool {
        false
    }

    /// Wall-clock budget for one execution.
    fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(120)
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Named set of tool capabilities exposed to a turn.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// A copy of the registry without the excluded tools.
    pub fn excluding<I, S>(&self, excluded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = self.clone();
        for name in excluded {
            out.tools.remove(name.as_ref());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes the input back"
        }
        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        fn validate(&self, args: &Value) -> ToolResult<()> {
            if args.get("text").and_then(Value::as_str).is_none() {
                return Err(ToolError::InvalidArguments {
                    tool: "echo".into(),
                    message: "'text' is required".into(),
                });
            }
            Ok(())
        }
        async fn execute(
            &self,
            args: Value,
            _ctx: &ToolExecutionContext,
            _abort: CancellationToken,
        ) -> ToolResult<String> {
            Ok(args["text"].as_str().unwrap_or_default().to_string())
        }
    }

    #[test]
    fn test_registry_register_and_get() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["echo".to_string()]);
    }

    #[test]
    fn test_excluding_removes_named_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let filtered = registry.excluding(["echo"]);
        assert!(filtered.is_empty());
        // Original untouched.
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_definition_shape() {
        let def = EchoTool.definition();
        assert_eq!(def.name, "echo");
        assert!(def.parameters["required"][0] == json!("text"));
    }

    #[test]
    fn test_validate_rejects_missing_field() {
        let err = EchoTool.validate(&json!({})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
        assert_eq!(err.tool_name(), "echo");
    }

    #[tokio::test]
    async fn test_execute_echo() {
        let result = EchoTool
            .execute(
                json!({"text": "hi"}),
                &ToolExecutionContext::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result, "hi");
    }

    #[test]
    fn test_state_record_delta() {
        let unchanged = StateRecord {
            tool: "t".into(),
            before: Some(json!({"size": 1})),
            after: Some(json!({"size": 1})),
        };
        assert!(!unchanged.has_delta());
        let changed = StateRecord {
            tool: "t".into(),
            before: Some(json!({"size": 1})),
            after: Some(json!({"size": 2})),
        };
        assert!(changed.has_delta());
        let partial = StateRecord {
            tool: "t".into(),
            before: None,
            after: Some(json!({})),
        };
        assert!(!partial.has_delta());
    }
}
