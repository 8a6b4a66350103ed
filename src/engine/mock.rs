//! Scripted engine for tests.
//!
//! Each `start_run` consumes the next scripted item: a turn (a sequence of
//! events replayed onto the stream) or a pre-flight failure. When the
//! script is exhausted the default turn plays, so a loop under test never
//! hangs waiting for an unscripted call.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::message::ToolCall;
use crate::engine::{Engine, EngineError, EngineEvent, EngineRequest, EngineRun, Usage};

enum ScriptItem {
    Turn(Vec<EngineEvent>),
    /// Events followed by an open stream that only closes on cancel.
    Hang(Vec<EngineEvent>),
    Fail(EngineError),
}

pub struct MockEngine {
    script: Mutex<VecDeque<ScriptItem>>,
    default_turn: Mutex<Vec<EngineEvent>>,
    requests: Mutex<Vec<EngineRequest>>,
    calls: AtomicUsize,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_turn: Mutex::new(text_turn("", Usage::default())),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queues a turn that streams `answer` as one delta then completes.
    pub fn push_text_turn(&self, answer: &str) {
        self.push_turn(text_turn(answer, Usage::new(10, 20)));
    }

    /// Queues a turn that requests one tool call then completes.
    pub fn push_tool_turn(&self, id: &str, tool: &str, args: Value) {
        self.push_turn(vec![
            EngineEvent::Started,
            EngineEvent::ToolCallRequested(ToolCall::new(id, tool, args)),
            EngineEvent::Completed {
                answer: String::new(),
                usage: Usage::new(10, 5),
            },
        ]);
    }

    pub fn push_turn(&self, events: Vec<EngineEvent>) {
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptItem::Turn(events));
    }

    /// Queues a turn whose stream stays open after `events` until the run
    /// is cancelled. For cancellation tests.
    pub fn push_hanging_turn(&self, events: Vec<EngineEvent>) {
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptItem::Hang(events));
    }

    /// Queues a pre-flight failure for the next call.
    pub fn push_failure(&self, error: EngineError) {
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptItem::Fail(error));
    }

    /// Replayed whenever the script runs dry. Useful for "tool call every
    /// turn" loops.
    pub fn set_default_turn(&self, events: Vec<EngineEvent>) {
        *self.default_turn.lock().unwrap() = events;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<EngineRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<EngineRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn text_turn(answer: &str, usage: Usage) -> Vec<EngineEvent> {
    let mut events = vec![EngineEvent::Started];
    if !answer.is_empty() {
        events.push(EngineEvent::TextDelta(answer.to_string()));
    }
    events.push(EngineEvent::Completed {
        answer: answer.to_string(),
        usage,
    });
    events
}

#[async_trait]
impl Engine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn start_run(&self, request: EngineRequest) -> Result<EngineRun, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        let item = self.script.lock().unwrap().pop_front();
        let (events, hang) = match item {
            Some(ScriptItem::Fail(error)) => return Err(error),
            Some(ScriptItem::Turn(events)) => (events, false),
            Some(ScriptItem::Hang(events)) => (events, true),
            None => (self.default_turn.lock().unwrap().clone(), false),
        };

        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let cancel_child = cancel.clone();
        tokio::spawn(async move {
            for event in events {
                tokio::select! {
                    _ = cancel_child.cancelled() => return,
                    result = tx.send(event) => {
                        if result.is_err() {
                            return;
                        }
                    }
                }
            }
            if hang {
                // Keep the stream open until the consumer cancels.
                cancel_child.cancelled().await;
            }
        });

        Ok(EngineRun {
            events: rx,
            steer: None,
            cancel,
        })
    }
}
