//! Built-in filesystem tools, jailed to a workspace root.
//!
//! `file_read` and `file_write` are the demonstration pair for the tool
//! framework: argument validation, path jailing, and (for the write tool)
//! state snapshots the verifier can diff.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::agent::tools::{Tool, ToolError, ToolExecutionContext, ToolResult};

const MAX_READ_BYTES: u64 = 256 * 1024;

/// Resolves `path` inside the jail, rejecting traversal outside it.
fn resolve_jailed(root: &Path, path: &str) -> ToolResult<PathBuf> {
    let candidate = root.join(path);
    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        use std::path::Component;
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(ToolError::PermissionDenied {
                        tool: "filesystem".into(),
                        message: format!("path escapes workspace: {path}"),
                    });
                }
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    if !normalized.starts_with(root) {
        return Err(ToolError::PermissionDenied {
            tool: "filesystem".into(),
            message: format!("path escapes workspace: {path}"),
        });
    }
    Ok(normalized)
}

fn require_path(tool: &str, args: &Value) -> ToolResult<String> {
    args.get("path")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ToolError::InvalidArguments {
            tool: tool.into(),
            message: "'path' is required".into(),
        })
}

pub struct FileReadTool {
    root: PathBuf,
}

impl FileReadTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file from the workspace"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative path" }
            },
            "required": ["path"]
        })
    }

    fn validate(&self, args: &Value) -> ToolResult<()> {
        require_path(self.name(), args).map(|_| ())
    }

    async fn execute(
        &self,
        args: Value,
        _ctx: &ToolExecutionContext,
        _abort: CancellationToken,
    ) -> ToolResult<String> {
        let path = require_path(self.name(), &args)?;
        let resolved = resolve_jailed(&self.root, &path)?;

        let metadata = tokio::fs::metadata(&resolved).await.map_err(|e| {
            ToolError::ExecutionFailed {
                tool: self.name().into(),
                message: format!("{path}: {e}"),
            }
        })?;
        if metadata.len() > MAX_READ_BYTES {
            return Err(ToolError::ExecutionFailed {
                tool: self.name().into(),
                message: format!("{path} is too large ({} bytes)", metadata.len()),
            });
        }

        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool: self.name().into(),
                message: format!("{path}: {e}"),
            })
    }
}

pub struct FileWriteTool {
    root: PathBuf,
}

impl FileWriteTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn snapshot_path(&self, path: &str) -> Value {
        match resolve_jailed(&self.root, path) {
            Ok(resolved) => match tokio::fs::metadata(&resolved).await {
                Ok(meta) => json!({ "exists": true, "len": meta.len() }),
                Err(_) => json!({ "exists": false }),
            },
            Err(_) => json!({ "exists": false }),
        }
    }
}

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn description(&self) -> &str {
        "Write a UTF-8 text file into the workspace, creating parent directories"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative path" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }

    fn validate(&self, args: &Value) -> ToolResult<()> {
        require_path(self.name(), args)?;
        if args.get("content").and_then(Value::as_str).is_none() {
            return Err(ToolError::InvalidArguments {
                tool: self.name().into(),
                message: "'content' is required".into(),
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
        let path = require_path(self.name(), &args)?;
        let content = args["content"].as_str().unwrap_or_default();
        let resolved = resolve_jailed(&self.root, &path)?;

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::ExecutionFailed {
                    tool: self.name().into(),
                    message: format!("{path}: {e}"),
                })?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool: self.name().into(),
                message: format!("{path}: {e}"),
            })?;
        Ok(format!("Wrote {} bytes to {path}", content.len()))
    }

    async fn state_snapshot(&self, args: &Value) -> Option<Value> {
        let path = args.get("path").and_then(Value::as_str)?;
        Some(self.snapshot_path(path).await)
    }

    fn is_write_class(&self) -> bool {
        true
    }
}
