//! The bounded iterative LLM <-> tool execution loop.
//!
//! One run drives a single user turn to completion: call the engine with
//! the current context, execute the tool calls it returns, feed the results
//! back, and repeat until the engine answers in plain text, an error
//! exhausts the retry budget, or the iteration cap trips. The run holds the
//! conversation context exclusively for its whole duration (the caller
//! hands over an owned lock guard), so message append order within one
//! session is total.
//!
//! Consumers read the run through [`AgentLoopHandle::next_event`]; the
//! event channel is bounded, so a slow consumer backpressures the loop.
//! Steering messages injected through [`LoopControl::steer`] are appended
//! to the context as user messages and picked up by the current run without
//! a restart. Cancellation aborts the in-flight engine call and any active
//! tool cooperatively.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedMutexGuard, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::context::ContextManager;
use crate::agent::events::{AgentEvent, RunState};
use crate::agent::message::{Message, Role, ToolCall};
use crate::agent::tools::{StateRecord, Tool, ToolError, ToolExecutionContext, ToolRegistry};
use crate::agent::verifier::{VerificationInput, Verifier};
use crate::engine::{Engine, EngineError, EngineEvent, EngineRequest, EngineRun, Usage};
use crate::session::SessionManager;
use crate::utils::backoff::Backoff;
use crate::utils::security::SecurityPolicy;
use crate::utils::workerpool::{PoolError, WorkerPool};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const STEER_CHANNEL_CAPACITY: usize = 16;

#[derive(Clone)]
pub struct AgentLoopOptions {
    pub max_iterations: u32,
    pub max_retries: u32,
    pub enable_state_snapshots: bool,
    pub security: SecurityPolicy,
    pub model: Option<String>,
}

impl Default for AgentLoopOptions {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_retries: 2,
            enable_state_snapshots: false,
            security: SecurityPolicy::default(),
            model: None,
        }
    }
}

/// Hooks around one run, e.g. auto-recalling memories before the first
/// engine call. Default implementations do nothing.
#[async_trait]
pub trait LoopHooks: Send + Sync {
    async fn on_before_first_run(&self, _ctx: &mut ContextManager) {}
    async fn on_after_complete(&self, _ctx: &mut ContextManager, _answer: &str) {}
}

pub struct NoHooks;

#[async_trait]
impl LoopHooks for NoHooks {}

/// Shareable control surface of a live run: steer input, cancel handle,
/// state probe. Cloned into the pipeline's in-flight map.
#[derive(Clone)]
pub struct LoopControl {
    steer_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    state: watch::Receiver<RunState>,
}

impl LoopControl {
    /// Injects a steering message. Returns false once the loop terminated.
    pub fn steer(&self, text: impl Into<String>) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        self.steer_tx.try_send(text.into()).is_ok()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }
}

pub struct AgentLoopHandle {
    events: mpsc::Receiver<AgentEvent>,
    control: LoopControl,
    task: JoinHandle<()>,
}

impl AgentLoopHandle {
    pub fn control(&self) -> LoopControl {
        self.control.clone()
    }

    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    /// Consumes the run to completion, collecting every event.
    pub async fn drain(mut self) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let _ = self.task.await;
        events
    }
}

pub struct AgentLoop {
    engine: Arc<dyn Engine>,
    tools: ToolRegistry,
    sessions: Arc<SessionManager>,
    options: AgentLoopOptions,
    verifier: Option<Arc<dyn Verifier>>,
    hooks: Arc<dyn LoopHooks>,
    worker_pool: Option<Arc<WorkerPool<Result<String, ToolError>>>>,
}

impl AgentLoop {
    pub fn new(
        engine: Arc<dyn Engine>,
        tools: ToolRegistry,
        sessions: Arc<SessionManager>,
        options: AgentLoopOptions,
    ) -> Self {
        Self {
            engine,
            tools,
            sessions,
            options,
            verifier: None,
            hooks: Arc::new(NoHooks),
            worker_pool: None,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn LoopHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_worker_pool(mut self, pool: Arc<WorkerPool<Result<String, ToolError>>>) -> Self {
        self.worker_pool = Some(pool);
        self
    }

    /// Starts one run. The caller passes the exclusively-held context; the
    /// guard is released when the run terminates.
    pub fn start(
        self: Arc<Self>,
        session_id: String,
        context: OwnedMutexGuard<ContextManager>,
    ) -> AgentLoopHandle {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (steer_tx, steer_rx) = mpsc::channel(STEER_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(RunState::Idle);
        let cancel = CancellationToken::new();

        let control = LoopControl {
            steer_tx,
            cancel: cancel.clone(),
            state: state_rx,
        };

        let task = tokio::spawn(async move {
            let mut driver = RunDriver {
                loop_ref: self,
                session_id,
                ctx: context,
                events: events_tx,
                steer: steer_rx,
                cancel,
                state: state_tx,
                records: Vec::new(),
                tool_invocations: 0,
                tool_errors: 0,
            };
            driver.drive().await;
        });

        AgentLoopHandle {
            events: events_rx,
            control,
            task,
        }
    }
}

enum StreamOutcome {
    Completed {
        text: String,
        tool_calls: Vec<ToolCall>,
        answer: String,
        usage: Usage,
    },
    Failed(EngineError),
    Cancelled,
}

struct RunDriver {
    loop_ref: Arc<AgentLoop>,
    session_id: String,
    ctx: OwnedMutexGuard<ContextManager>,
    events: mpsc::Sender<AgentEvent>,
    steer: mpsc::Receiver<String>,
    cancel: CancellationToken,
    state: watch::Sender<RunState>,
    records: Vec<StateRecord>,
    tool_invocations: u64,
    tool_errors: u64,
}

impl RunDriver {
    async fn drive(&mut self) {
        let _ = self.state.send(RunState::Running);
        self.emit(AgentEvent::Started).await;

        let hooks = Arc::clone(&self.loop_ref.hooks);
        hooks.on_before_first_run(&mut self.ctx).await;

        let mut iterations: u32 = 0;
        let mut retries: u32 = 0;
        let mut backoff = Backoff::engine();
        let mut llm_calls: u64 = 0;

        loop {
            if iterations >= self.loop_ref.options.max_iterations {
                warn!(
                    session_id = %self.session_id,
                    iterations,
                    "Iteration cap reached, terminating run"
                );
                self.finish_failed(iterations, llm_calls, "maximum iterations exceeded")
                    .await;
                return;
            }

            self.drain_steering().await;

            let request = EngineRequest {
                messages: self.ctx.get_messages(),
                tools: self.loop_ref.tools.definitions(),
                model: self.loop_ref.options.model.clone(),
            };

            let engine = Arc::clone(&self.loop_ref.engine);
            let started = tokio::select! {
                _ = self.cancel.cancelled() => None,
                run = engine.start_run(request) => Some(run),
            };
            let Some(started) = started else {
                self.finish_cancelled(iterations, llm_calls).await;
                return;
            };

            let run = match started {
                Ok(run) => run,
                Err(e) if e.is_retryable() && retries < self.loop_ref.options.max_retries => {
                    retries += 1;
                    if !self.sleep_backoff(&mut backoff, retries, &e).await {
                        self.finish_cancelled(iterations, llm_calls).await;
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    self.finish_failed(iterations, llm_calls, &e.to_string()).await;
                    return;
                }
            };

            llm_calls += 1;
            let outcome = self.consume_engine_stream(run).await;

            let (text, tool_calls, answer, usage) = match outcome {
                StreamOutcome::Cancelled => {
                    self.finish_cancelled(iterations, llm_calls).await;
                    return;
                }
                StreamOutcome::Failed(e)
                    if e.is_retryable() && retries < self.loop_ref.options.max_retries =>
                {
                    retries += 1;
                    if !self.sleep_backoff(&mut backoff, retries, &e).await {
                        self.finish_cancelled(iterations, llm_calls).await;
                        return;
                    }
                    continue;
                }
                StreamOutcome::Failed(e) => {
                    self.finish_failed(iterations, llm_calls, &e.to_string()).await;
                    return;
                }
                StreamOutcome::Completed {
                    text,
                    tool_calls,
                    answer,
                    usage,
                } => (text, tool_calls, answer, usage),
            };

            iterations += 1;
            retries = 0;
            backoff.reset();

            if tool_calls.is_empty() {
                self.ctx.add_message(Message::assistant(answer.clone())).await;

                let verification = match &self.loop_ref.verifier {
                    Some(verifier) => {
                        let input = self.verification_input(&answer);
                        Some(verifier.verify(&input).await)
                    }
                    None => None,
                };

                hooks.on_after_complete(&mut self.ctx, &answer).await;

                info!(
                    session_id = %self.session_id,
                    iterations,
                    llm_calls,
                    tool_invocations = self.tool_invocations,
                    "Run complete"
                );
                self.write_metadata(iterations, llm_calls, 0).await;
                let _ = self.state.send(RunState::Completed);
                self.emit(AgentEvent::Complete {
                    answer,
                    usage,
                    verification,
                })
                .await;
                return;
            }

            // Tool phase: record the assistant message with its calls, then
            // execute each call and feed the results back.
            self.ctx
                .add_message(Message::assistant(text).with_tool_calls(tool_calls.clone()))
                .await;
            for tool_call in tool_calls {
                if self.cancel.is_cancelled() {
                    self.finish_cancelled(iterations, llm_calls).await;
                    return;
                }
                self.handle_tool_call(tool_call).await;
            }
        }
    }

    /// Pulls engine events until the stream ends, relaying text deltas and
    /// collecting tool calls. Steering received mid-stream is forwarded to
    /// the engine when it accepts steer input, and appended to the context
    /// for the next iteration either way.
    async fn consume_engine_stream(&mut self, mut run: EngineRun) -> StreamOutcome {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut pending_steer = Vec::new();
        let events_tx = self.events.clone();

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    run.cancel.cancel();
                    break StreamOutcome::Cancelled;
                }
                Some(steer) = self.steer.recv() => {
                    if let Some(steer_tx) = &run.steer {
                        let _ = steer_tx.try_send(steer.clone());
                    }
                    pending_steer.push(steer);
                }
                event = run.events.recv() => match event {
                    None => {
                        break StreamOutcome::Failed(EngineError::Network(
                            "engine stream ended without completion".into(),
                        ));
                    }
                    Some(EngineEvent::Started) => {}
                    Some(EngineEvent::TextDelta(delta)) => {
                        text.push_str(&delta);
                        let _ = events_tx
                            .send(AgentEvent::Text {
                                partial: text.clone(),
                            })
                            .await;
                    }
                    Some(EngineEvent::ToolCallRequested(tc)) => {
                        tool_calls.push(tc);
                    }
                    Some(EngineEvent::Completed { answer, usage }) => {
                        break StreamOutcome::Completed {
                            text,
                            tool_calls,
                            answer,
                            usage,
                        };
                    }
                    Some(EngineEvent::Error(e)) => {
                        break StreamOutcome::Failed(e);
                    }
                }
            }
        };

        for steer in pending_steer {
            debug!(session_id = %self.session_id, "Steering message appended to context");
            self.ctx.add_message(Message::user(steer)).await;
        }
        outcome
    }

    async fn handle_tool_call(&mut self, tool_call: ToolCall) {
        let Some(tool) = self.loop_ref.tools.get(&tool_call.name) else {
            let message = format!("unknown tool '{}'", tool_call.name);
            self.emit(AgentEvent::ToolValidationError {
                tool: tool_call.name.clone(),
                message,
            })
            .await;
            self.tool_errors += 1;
            let result = format!("Error: unknown tool '{}'", tool_call.name);
            self.ctx
                .add_message(Message::tool_result(tool_call.id, result))
                .await;
            return;
        };

        if let Err(e) = tool.validate(&tool_call.args) {
            self.emit(AgentEvent::ToolValidationError {
                tool: tool_call.name.clone(),
                message: e.to_string(),
            })
            .await;
            self.tool_errors += 1;
            self.ctx
                .add_message(Message::tool_result(tool_call.id, format!("Error: {e}")))
                .await;
            return;
        }

        if let Err(reason) = self.loop_ref.options.security.check_tool_call(
            &tool_call.name,
            tool.is_write_class(),
            &tool_call.args,
        ) {
            debug!(
                session_id = %self.session_id,
                tool = %tool_call.name,
                %reason,
                "Security policy denied tool call"
            );
            self.emit(AgentEvent::ToolStart {
                id: tool_call.id.clone(),
                tool: tool_call.name.clone(),
                args: tool_call.args.clone(),
            })
            .await;
            let result = format!("Error: security policy denied: {reason}");
            self.emit(AgentEvent::ToolEnd {
                id: tool_call.id.clone(),
                tool: tool_call.name.clone(),
                result: result.clone(),
                is_error: true,
            })
            .await;
            self.tool_errors += 1;
            self.ctx
                .add_message(Message::tool_result(tool_call.id, result))
                .await;
            return;
        }

        let snapshots_enabled = self.loop_ref.options.enable_state_snapshots;
        let before = if snapshots_enabled {
            tool.state_snapshot(&tool_call.args).await
        } else {
            None
        };

        self.emit(AgentEvent::ToolStart {
            id: tool_call.id.clone(),
            tool: tool_call.name.clone(),
            args: tool_call.args.clone(),
        })
        .await;

        let result = self.execute_tool(&tool, &tool_call).await;
        self.tool_invocations += 1;

        if snapshots_enabled && before.is_some() {
            let after = tool.state_snapshot(&tool_call.args).await;
            self.records.push(StateRecord {
                tool: tool_call.name.clone(),
                before,
                after,
            });
        }

        let (result_text, is_error) = match result {
            Ok(output) => (output, false),
            Err(e) => {
                self.tool_errors += 1;
                (format!("Error: {e}"), true)
            }
        };

        self.emit(AgentEvent::ToolEnd {
            id: tool_call.id.clone(),
            tool: tool_call.name.clone(),
            result: result_text.clone(),
            is_error,
        })
        .await;
        self.ctx
            .add_message(Message::tool_result(tool_call.id, result_text))
            .await;
    }

    /// Executes one validated tool call with abort, timeout, and (for
    /// heavyweight tools) worker-pool dispatch.
    async fn execute_tool(
        &self,
        tool: &Arc<dyn Tool>,
        tool_call: &ToolCall,
    ) -> Result<String, ToolError> {
        let exec_ctx = ToolExecutionContext {
            channel_id: None,
            user_id: None,
            session_id: Some(self.session_id.clone()),
        };
        let abort = self.cancel.child_token();
        let timeout = tool.timeout();

        if tool.heavyweight() {
            if let Some(pool) = &self.loop_ref.worker_pool {
                let tool = Arc::clone(tool);
                let args = tool_call.args.clone();
                let pool_ctx = exec_ctx.clone();
                let pool_abort = abort.clone();
                let name = tool_call.name.clone();
                let fut = Box::pin(async move { tool.execute(args, &pool_ctx, pool_abort).await });
                return match pool.run_with_timeout(fut, timeout).await {
                    Ok(result) => result,
                    Err(PoolError::Timeout(d)) => Err(ToolError::Timeout {
                        tool: name,
                        duration: d.as_secs(),
                    }),
                    Err(e) => Err(ToolError::ExecutionFailed {
                        tool: name,
                        message: e.to_string(),
                    }),
                };
            }
        }

        let execution = tool.execute(tool_call.args.clone(), &exec_ctx, abort.clone());
        tokio::select! {
            _ = self.cancel.cancelled() => {
                abort.cancel();
                Err(ToolError::Aborted {
                    tool: tool_call.name.clone(),
                })
            }
            result = tokio::time::timeout(timeout, execution) => match result {
                Ok(r) => r,
                Err(_) => Err(ToolError::Timeout {
                    tool: tool_call.name.clone(),
                    duration: timeout.as_secs(),
                }),
            },
        }
    }

    fn verification_input(&self, answer: &str) -> VerificationInput {
        let task = self
            .ctx
            .get_messages()
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_text())
            .unwrap_or_default();
        VerificationInput {
            task,
            answer: answer.to_string(),
            tool_invocations: self.tool_invocations,
            tool_errors: self.tool_errors,
            state_records: self.records.clone(),
        }
    }

    async fn drain_steering(&mut self) {
        while let Ok(steer) = self.steer.try_recv() {
            debug!(session_id = %self.session_id, "Steering message appended to context");
            self.ctx.add_message(Message::user(steer)).await;
        }
    }

    /// Sleeps out the backoff delay; returns false when cancelled mid-wait.
    async fn sleep_backoff(&self, backoff: &mut Backoff, retry: u32, error: &EngineError) -> bool {
        let delay = backoff.next_delay();
        warn!(
            session_id = %self.session_id,
            retry,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Engine call failed, retrying with backoff"
        );
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn finish_failed(&mut self, iterations: u32, llm_calls: u64, message: &str) {
        self.write_metadata(iterations, llm_calls, 1).await;
        let _ = self.state.send(RunState::Failed);
        self.emit(AgentEvent::Error {
            message: message.to_string(),
        })
        .await;
    }

    async fn finish_cancelled(&mut self, iterations: u32, llm_calls: u64) {
        debug!(session_id = %self.session_id, "Run cancelled");
        self.write_metadata(iterations, llm_calls, 1).await;
        let _ = self.state.send(RunState::Cancelled);
        self.emit(AgentEvent::Error {
            message: "run cancelled".to_string(),
        })
        .await;
    }

    async fn write_metadata(&self, iterations: u32, llm_calls: u64, errors: u64) {
        let tool_invocations = self.tool_invocations;
        let tool_errors = self.tool_errors;
        self.loop_ref
            .sessions
            .update_metadata(&self.session_id, |m| {
                m.loop_iterations += iterations as u64;
                m.llm_calls += llm_calls;
                m.tool_invocations += tool_invocations;
                m.errors += errors + tool_errors;
            })
            .await;
    }

    async fn emit(&self, event: AgentEvent) {
        // A dropped consumer must not wedge the run mid-turn: context
        // integrity still requires finishing the current phase.
        let _ = self.events.send(event).await;
    }
}
