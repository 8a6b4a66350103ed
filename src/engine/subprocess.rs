//! Subprocess engine adapter.
//!
//! Runs an external command per engine call: the request (messages plus
//! tool descriptors) is written to the child's stdin as JSON, free-form
//! text streams back on stdout with `<tool_call>` frames embedded, and
//! stderr is kept for error classification on non-zero exit. Credential
//! and rate-limit patterns on stderr surface as non-retryable errors with
//! the stderr text as user-visible guidance.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::message::ToolCall;
use crate::engine::stream_parser::{ParsedChunk, ToolCallStreamParser};
use crate::engine::{Engine, EngineError, EngineEvent, EngineRequest, EngineRun, Usage};

const STDOUT_CHUNK: usize = 4096;

pub struct SubprocessEngine {
    program: String,
    args: Vec<String>,
}

impl SubprocessEngine {
    /// `command` is split on whitespace: program first, arguments after.
    pub fn new(command: &str) -> Result<Self, EngineError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let Some(program) = parts.next() else {
            return Err(EngineError::Validation(
                "subprocess command is empty".into(),
            ));
        };
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl Engine for SubprocessEngine {
    fn name(&self) -> &str {
        "subprocess"
    }

    async fn start_run(&self, request: EngineRequest) -> Result<EngineRun, EngineError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Network(format!("failed to spawn engine: {e}")))?;

        let stdin_payload = serde_json::json!({
            "messages": request.messages,
            "tools": request.tools,
            "model": request.model,
        })
        .to_string();

        let (tx, rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let cancel_task = cancel.clone();

        tokio::spawn(async move {
            let _ = tx.send(EngineEvent::Started).await;

            if let Some(mut stdin) = child.stdin.take() {
                if let Err(e) = stdin.write_all(stdin_payload.as_bytes()).await {
                    debug!(error = %e, "Could not write request to engine stdin");
                }
                drop(stdin);
            }

            let mut stdout = child.stdout.take().expect("stdout piped");
            let mut stderr = child.stderr.take().expect("stderr piped");
            let stderr_task = tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            });

            let mut parser = ToolCallStreamParser::new();
            let mut answer = String::new();
            let mut buf = vec![0u8; STDOUT_CHUNK];
            let mut carry = Vec::new();

            loop {
                let read = tokio::select! {
                    _ = cancel_task.cancelled() => {
                        let _ = child.kill().await;
                        let _ = tx.send(EngineEvent::Error(EngineError::Cancelled)).await;
                        return;
                    }
                    read = stdout.read(&mut buf) => read,
                };
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        // Carry incomplete UTF-8 tails across reads.
                        carry.extend_from_slice(&buf[..n]);
                        let valid_up_to = match std::str::from_utf8(&carry) {
                            Ok(_) => carry.len(),
                            Err(e) => e.valid_up_to(),
                        };
                        let chunk = String::from_utf8_lossy(&carry[..valid_up_to]).into_owned();
                        carry.drain(..valid_up_to);
                        emit_chunks(&tx, parser.push(&chunk), &mut answer).await;
                    }
                    Err(e) => {
                        let _ = tx
                            .send(EngineEvent::Error(EngineError::Network(format!(
                                "engine stdout read failed: {e}"
                            ))))
                            .await;
                        return;
                    }
                }
            }
            if !carry.is_empty() {
                let tail = String::from_utf8_lossy(&carry).into_owned();
                emit_chunks(&tx, parser.push(&tail), &mut answer).await;
            }
            emit_chunks(&tx, parser.finish(), &mut answer).await;

            let status = child.wait().await;
            let stderr_text = stderr_task.await.unwrap_or_default();
            match status {
                Ok(status) if status.success() => {
                    let _ = tx
                        .send(EngineEvent::Completed {
                            answer: answer.trim().to_string(),
                            usage: Usage::default(),
                        })
                        .await;
                }
                Ok(status) => {
                    let code = status.code().unwrap_or(-1);
                    warn!(code, "Engine subprocess failed");
                    let _ = tx
                        .send(EngineEvent::Error(EngineError::from_subprocess_exit(
                            code,
                            &stderr_text,
                        )))
                        .await;
                }
                Err(e) => {
                    let _ = tx
                        .send(EngineEvent::Error(EngineError::Network(format!(
                            "engine wait failed: {e}"
                        ))))
                        .await;
                }
            }
        });

        Ok(EngineRun {
            events: rx,
            steer: None,
            cancel,
        })
    }
}

async fn emit_chunks(
    tx: &mpsc::Sender<EngineEvent>,
    chunks: Vec<ParsedChunk>,
    answer: &mut String,
) {
    for chunk in chunks {
        match chunk {
            ParsedChunk::Text(text) => {
                if !text.is_empty() {
                    answer.push_str(&text);
                    let _ = tx.send(EngineEvent::TextDelta(text)).await;
                }
            }
            ParsedChunk::ToolCall { tool, args } => {
                let id = format!("tc_{}", uuid::Uuid::new_v4().simple());
                let _ = tx
                    .send(EngineEvent::ToolCallRequested(ToolCall::new(id, tool, args)))
                    .await;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn collect(engine: &SubprocessEngine) -> Vec<EngineEvent> {
        let mut run = engine.start_run(EngineRequest::default()).await.unwrap();
        let mut events = Vec::new();
        while let Some(event) = run.events.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_plain_text_completes() {
        let engine = SubprocessEngine::new("echo hello from the engine").unwrap();
        let events = collect(&engine).await;
        assert!(matches!(
            events.last(),
            Some(EngineEvent::Completed { answer, .. }) if answer.contains("hello from the engine")
        ));
    }

    #[tokio::test]
    async fn test_tool_call_frame_parsed() {
        let sh = SubprocessEngine {
            program: "sh".into(),
            args: vec![
                "-c".into(),
                r#"printf 'before <tool_call>{"tool":"file_read","args":{"path":"x"}}</tool_call> after'"#.into(),
            ],
        };
        let events = collect(&sh).await;
        let tool_calls: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::ToolCallRequested(tc) => Some(tc.name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(tool_calls, vec!["file_read"]);
        assert!(matches!(events.last(), Some(EngineEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn test_nonzero_exit_classified() {
        let sh = SubprocessEngine {
            program: "sh".into(),
            args: vec![
                "-c".into(),
                "echo 'invalid api key' >&2; exit 1".into(),
            ],
        };
        let events = collect(&sh).await;
        assert!(matches!(
            events.last(),
            Some(EngineEvent::Error(EngineError::Auth(_)))
        ));
    }

    #[tokio::test]
    async fn test_generic_failure_is_retryable() {
        let sh = SubprocessEngine {
            program: "sh".into(),
            args: vec!["-c".into(), "echo transient >&2; exit 7".into()],
        };
        let events = collect(&sh).await;
        match events.last() {
            Some(EngineEvent::Error(e)) => assert!(e.is_retryable()),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let sh = SubprocessEngine {
            program: "sh".into(),
            args: vec!["-c".into(), "sleep 30".into()],
        };
        let mut run = sh.start_run(EngineRequest::default()).await.unwrap();
        // Consume Started, then cancel.
        let first = run.events.recv().await;
        assert!(matches!(first, Some(EngineEvent::Started)));
        run.cancel.cancel();

        let mut cancelled = false;
        while let Some(event) = run.events.recv().await {
            if matches!(event, EngineEvent::Error(EngineError::Cancelled)) {
                cancelled = true;
            }
        }
        assert!(cancelled);
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        assert!(SubprocessEngine::new("   ").is_err());
    }
}
