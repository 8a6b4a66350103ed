//! Fan-in inbound pipeline.
//!
//! Every message delivered by a channel adapter flows through here: empty
//! drop, per-user rate limiting, permission-prompt forwarding into a live
//! loop, voice transcription, routing, tool-set construction, one agent
//! loop run, and response streaming back to the originating channel. Each
//! message owns an independent task end-to-end; an in-flight counter lets
//! shutdown drain gracefully.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, trace, warn};

use crate::agent::agent_loop::{
    AgentLoop, AgentLoopOptions, LoopControl, LoopHooks, NoHooks,
};
use crate::agent::context::{ContextConfig, ContextManager};
use crate::agent::events::AgentEvent;
use crate::agent::message::Message;
use crate::agent::router::{AgentRouter, RoutingDecision};
use crate::agent::tools::{ToolError, ToolRegistry};
use crate::agent::verifier::Verifier;
use crate::channels::Channel;
use crate::channels::types::{InboundMessage, OutboundMessage, Recipient};
use crate::engine::Engine;
use crate::media::{SpeechToText, TextToSpeech};
use crate::session::{MessageRouter, SessionManager};
use crate::utils::ratelimit::SlidingWindowLimiter;
use crate::utils::security::{AutonomyLevel, SecurityPolicy};
use crate::utils::workerpool::WorkerPool;

const RATE_LIMIT_APOLOGY: &str =
    "You're sending messages faster than I can handle. Give me a minute and try again.";
const BUSY_NOTICE: &str =
    "I'm still working on your previous message. I'll be with you shortly.";
const ERROR_APOLOGY: &str =
    "Sorry, something went wrong while handling that. Please try again.";

/// Tools excluded for every turn regardless of configuration.
const ALWAYS_EXCLUDED: &[&str] = &["delegate", "browser"];
/// Additional exclusions when autonomy is readonly.
const READONLY_EXCLUDED: &[&str] = &["bash", "file_write", "file_edit", "delegate", "browser"];

/// Streamed text that looks like the engine waiting for a yes/no.
const PERMISSION_PROMPT_PATTERN: &str = r"\[y/n\]|\(y/n\)|\[yes/no\]|do you want to";

/// Minimum growth of the partial answer before another in-place edit.
const PARTIAL_EDIT_MIN_DELTA: usize = 48;

#[derive(Clone)]
pub struct PipelineConfig {
    pub default_system_prompt: String,
    pub autonomy: AutonomyLevel,
    pub mesh_enabled: bool,
    pub enable_state_snapshots: bool,
    pub context: ContextConfig,
    pub security: SecurityPolicy,
    pub max_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_system_prompt: "You are a helpful personal assistant.".to_string(),
            autonomy: AutonomyLevel::default(),
            mesh_enabled: false,
            enable_state_snapshots: false,
            context: ContextConfig::default(),
            security: SecurityPolicy::default(),
            max_retries: 2,
        }
    }
}

struct InFlightLoop {
    session_id: String,
    control: LoopControl,
    permission_pending: Arc<AtomicBool>,
}

pub struct InboundPipeline {
    engine: Arc<dyn Engine>,
    tools: ToolRegistry,
    sessions: Arc<SessionManager>,
    message_router: Arc<MessageRouter>,
    agent_router: Arc<AgentRouter>,
    channels: RwLock<HashMap<String, Arc<dyn Channel>>>,
    contexts: Mutex<HashMap<String, Arc<Mutex<ContextManager>>>>,
    in_flight: Mutex<HashMap<String, InFlightLoop>>,
    limiter: SlidingWindowLimiter,
    in_flight_count: Arc<AtomicUsize>,
    drain_notify: Arc<Notify>,
    permission_prompt: Regex,
    stt: Option<Arc<dyn SpeechToText>>,
    tts: Option<Arc<dyn TextToSpeech>>,
    hooks: Arc<dyn LoopHooks>,
    verifier: Option<Arc<dyn Verifier>>,
    worker_pool: Option<Arc<WorkerPool<Result<String, ToolError>>>>,
    config: PipelineConfig,
}

impl InboundPipeline {
    pub fn new(
        engine: Arc<dyn Engine>,
        tools: ToolRegistry,
        sessions: Arc<SessionManager>,
        message_router: Arc<MessageRouter>,
        agent_router: Arc<AgentRouter>,
        config: PipelineConfig,
    ) -> Self {
        let permission_prompt = RegexBuilder::new(PERMISSION_PROMPT_PATTERN)
            .case_insensitive(true)
            .build()
            .expect("permission prompt pattern is valid");
        Self {
            engine,
            tools,
            sessions,
            message_router,
            agent_router,
            channels: RwLock::new(HashMap::new()),
            contexts: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            limiter: SlidingWindowLimiter::per_user_default(),
            in_flight_count: Arc::new(AtomicUsize::new(0)),
            drain_notify: Arc::new(Notify::new()),
            permission_prompt,
            stt: None,
            tts: None,
            hooks: Arc::new(NoHooks),
            verifier: None,
            worker_pool: None,
            config,
        }
    }

    pub fn with_speech_to_text(mut self, stt: Arc<dyn SpeechToText>) -> Self {
        self.stt = Some(stt);
        self
    }

    pub fn with_text_to_speech(mut self, tts: Arc<dyn TextToSpeech>) -> Self {
        self.tts = Some(tts);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn LoopHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_worker_pool(mut self, pool: Arc<WorkerPool<Result<String, ToolError>>>) -> Self {
        self.worker_pool = Some(pool);
        self
    }

    pub async fn register_channel(&self, channel: Arc<dyn Channel>) {
        let id = channel.id().to_string();
        self.channels.write().await.insert(id.clone(), channel);
        info!(channel = %id, "Channel registered with pipeline");
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight_count.load(Ordering::SeqCst)
    }

    /// Waits until all in-flight loops finished, up to `timeout`.
    /// Returns true when fully drained.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight_count() > 0 {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or_default();
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.drain_notify.notified()).await;
        }
        true
    }

    /// Injects a steering message into the live loop owning `session_id`.
    pub async fn steer_session(&self, session_id: &str, text: &str) -> bool {
        let in_flight = self.in_flight.lock().await;
        for entry in in_flight.values() {
            if entry.session_id == session_id && !entry.control.state().is_terminal() {
                return entry.control.steer(text);
            }
        }
        false
    }

    /// Cancels the live loop owning `session_id`, if any.
    pub async fn cancel_session(&self, session_id: &str) -> bool {
        let in_flight = self.in_flight.lock().await;
        for entry in in_flight.values() {
            if entry.session_id == session_id && !entry.control.state().is_terminal() {
                entry.control.cancel();
                return true;
            }
        }
        false
    }

    /// Spawns an independent task that owns the whole turn.
    pub fn dispatch(self: &Arc<Self>, msg: InboundMessage) {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            pipeline.handle_inbound(msg).await;
        });
    }

    /// Processes one inbound message end-to-end.
    pub async fn handle_inbound(self: &Arc<Self>, mut msg: InboundMessage) {
        if !msg.sanitize() {
            trace!(channel = %msg.channel_id, "Dropping empty message");
            return;
        }

        let user_key = format!("{}:{}", msg.channel_id, msg.from.user_or_anonymous());

        if !self.limiter.check(&user_key) {
            debug!(key = %user_key, "Rate limit exceeded, bouncing");
            self.send_text(&msg, RATE_LIMIT_APOLOGY).await;
            return;
        }

        // A live loop for this user either absorbs the message as steering
        // (when it is waiting on a permission prompt) or stays undisturbed.
        if let Some(outcome) = self.try_forward_to_live_loop(&user_key, &msg).await {
            match outcome {
                ForwardOutcome::Steered => return,
                ForwardOutcome::Busy => {
                    self.send_text(&msg, BUSY_NOTICE).await;
                    return;
                }
            }
        }

        let _guard = InFlightGuard::enter(
            Arc::clone(&self.in_flight_count),
            Arc::clone(&self.drain_notify),
        );

        let was_voice = msg.has_audio();
        if let Err(reason) = self.resolve_voice(&mut msg).await {
            debug!(channel = %msg.channel_id, %reason, "Voice message dropped");
            return;
        }

        let Some(binding) = self.message_router.route(&msg).await else {
            warn!("Message without channel id, unroutable");
            return;
        };
        let decision = self
            .agent_router
            .route(&msg, &self.config.default_system_prompt);
        debug!(
            session_id = %binding.session_id,
            agent = %decision.agent_name,
            route_key = %binding.route_key,
            "Inbound message routed"
        );

        let context = self.context_for(&binding.route_key).await;
        let mut ctx_guard = match context.try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                // Another loop holds this conversation exclusively.
                self.send_text(&msg, BUSY_NOTICE).await;
                return;
            }
        };

        if let Some(prompt) = &decision.system_prompt {
            ctx_guard.set_system_prompt(prompt.clone());
        }
        ctx_guard
            .add_message(Message::user(msg.text.clone().unwrap_or_default()))
            .await;

        let tools = self.tools_for_turn(&decision);
        let options = AgentLoopOptions {
            max_iterations: decision.max_iterations,
            max_retries: self.config.max_retries,
            enable_state_snapshots: self.config.enable_state_snapshots,
            security: self.config.security.clone(),
            model: decision.model.clone().or_else(|| binding.config.model.clone()),
        };

        let mut agent_loop = AgentLoop::new(
            Arc::clone(&self.engine),
            tools,
            Arc::clone(&self.sessions),
            options,
        )
        .with_hooks(Arc::clone(&self.hooks));
        if let Some(verifier) = &self.verifier {
            agent_loop = agent_loop.with_verifier(Arc::clone(verifier));
        }
        if let Some(pool) = &self.worker_pool {
            agent_loop = agent_loop.with_worker_pool(Arc::clone(pool));
        }

        let mut handle = Arc::new(agent_loop).start(binding.session_id.clone(), ctx_guard);

        let permission_pending = Arc::new(AtomicBool::new(false));
        {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.insert(
                user_key.clone(),
                InFlightLoop {
                    session_id: binding.session_id.clone(),
                    control: handle.control(),
                    permission_pending: Arc::clone(&permission_pending),
                },
            );
        }

        let channel = self.channels.read().await.get(&msg.channel_id).cloned();
        let mut stream = StreamHandler::new(channel.clone(), Recipient::of(&msg.from), msg.id.clone());

        let mut final_answer: Option<String> = None;
        while let Some(event) = handle.next_event().await {
            match event {
                AgentEvent::Text { partial } => {
                    if self.permission_prompt.is_match(&partial) {
                        permission_pending.store(true, Ordering::SeqCst);
                    }
                    stream.on_partial(&partial).await;
                }
                AgentEvent::Complete { answer, .. } => {
                    stream.on_complete(&answer).await;
                    final_answer = Some(answer);
                }
                AgentEvent::Error { message } => {
                    debug!(session_id = %binding.session_id, %message, "Turn failed");
                    stream.on_error(ERROR_APOLOGY).await;
                }
                _ => {}
            }
        }

        // Voice in, voice out.
        if was_voice {
            if let (Some(answer), Some(tts), Some(channel)) =
                (&final_answer, &self.tts, &channel)
            {
                match tts.synthesize(answer).await {
                    Ok(path) => {
                        if let Err(e) = channel.send_voice(&Recipient::of(&msg.from), &path).await {
                            debug!(error = %e, "Voice reply not delivered");
                        }
                    }
                    Err(e) => debug!(error = %e, "Text-to-speech failed"),
                }
            }
        }

        let mut in_flight = self.in_flight.lock().await;
        if in_flight
            .get(&user_key)
            .is_some_and(|e| e.session_id == binding.session_id)
        {
            in_flight.remove(&user_key);
        }
    }

    async fn try_forward_to_live_loop(
        &self,
        user_key: &str,
        msg: &InboundMessage,
    ) -> Option<ForwardOutcome> {
        let in_flight = self.in_flight.lock().await;
        let entry = in_flight.get(user_key)?;
        if entry.control.state().is_terminal() {
            return None;
        }
        if entry.permission_pending.load(Ordering::SeqCst) {
            if let Some(text) = &msg.text {
                debug!(key = %user_key, "Forwarding message into pending permission prompt");
                entry.permission_pending.store(false, Ordering::SeqCst);
                entry.control.steer(text.clone());
                return Some(ForwardOutcome::Steered);
            }
        }
        Some(ForwardOutcome::Busy)
    }

    /// Resolves audio attachments to text. Errors only when the message has
    /// no usable text at all afterwards.
    async fn resolve_voice(&self, msg: &mut InboundMessage) -> Result<(), String> {
        if !msg.has_audio() {
            return Ok(());
        }
        let Some(stt) = &self.stt else {
            return if msg.text.is_some() {
                Ok(())
            } else {
                Err("no speech-to-text collaborator wired".into())
            };
        };
        for attachment in msg.attachments.iter_mut().filter(|a| a.is_audio()) {
            if attachment.transcript.is_none() {
                match stt.transcribe(&attachment.url).await {
                    Ok(text) => attachment.transcript = Some(text),
                    Err(e) => debug!(error = %e, "Transcription failed"),
                }
            }
        }
        if msg.text.is_none() {
            msg.text = msg
                .attachments
                .iter()
                .find_map(|a| a.transcript.clone())
                .filter(|t| !t.trim().is_empty());
        }
        if msg.text.is_some() {
            Ok(())
        } else {
            Err("voice message could not be transcribed".into())
        }
    }

    async fn context_for(&self, route_key: &str) -> Arc<Mutex<ContextManager>> {
        let mut contexts = self.contexts.lock().await;
        contexts
            .entry(route_key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ContextManager::new(self.config.context.clone())))
            })
            .clone()
    }

    /// Builds the per-turn tool set from autonomy, standing exclusions, the
    /// routing decision, and the mesh flag.
    fn tools_for_turn(&self, decision: &RoutingDecision) -> ToolRegistry {
        let mut excluded: Vec<String> =
            ALWAYS_EXCLUDED.iter().map(|s| s.to_string()).collect();
        if self.config.autonomy == AutonomyLevel::Readonly {
            excluded.extend(READONLY_EXCLUDED.iter().map(|s| s.to_string()));
        }
        excluded.extend(decision.tool_exclude.iter().cloned());
        if !self.config.mesh_enabled {
            excluded.push("mesh".to_string());
        }
        self.tools.excluding(excluded)
    }

    async fn send_text(&self, msg: &InboundMessage, text: &str) {
        let channels = self.channels.read().await;
        if let Some(channel) = channels.get(&msg.channel_id) {
            let outbound = OutboundMessage::new(text).reply_to(msg.id.clone());
            if let Err(e) = channel.send(&Recipient::of(&msg.from), outbound).await {
                warn!(channel = %msg.channel_id, error = %e, "Failed to send notice");
            }
        }
    }
}

enum ForwardOutcome {
    Steered,
    Busy,
}

/// Increments the in-flight counter for its lifetime.
struct InFlightGuard {
    count: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl InFlightGuard {
    fn enter(count: Arc<AtomicUsize>, notify: Arc<Notify>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self { count, notify }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Owns the edit-or-send decision for one streamed response.
///
/// On surfaces that can edit messages the partial answer is streamed into a
/// single message updated in place; elsewhere only the final answer is
/// sent. Errors always produce exactly one bounded apology.
struct StreamHandler {
    channel: Option<Arc<dyn Channel>>,
    recipient: Recipient,
    reply_to: String,
    message_id: Option<String>,
    last_edit_len: usize,
    errored: bool,
}

impl StreamHandler {
    fn new(channel: Option<Arc<dyn Channel>>, recipient: Recipient, reply_to: String) -> Self {
        Self {
            channel,
            recipient,
            reply_to,
            message_id: None,
            last_edit_len: 0,
            errored: false,
        }
    }

    async fn on_partial(&mut self, partial: &str) {
        let Some(channel) = &self.channel else { return };
        if !channel.supports_editing() {
            return;
        }
        if partial.len().saturating_sub(self.last_edit_len) < PARTIAL_EDIT_MIN_DELTA
            && self.message_id.is_some()
        {
            return;
        }
        self.last_edit_len = partial.len();
        match &self.message_id {
            None => {
                let outbound =
                    OutboundMessage::new(partial.to_string()).reply_to(self.reply_to.clone());
                if let Ok(id) = channel.send(&self.recipient, outbound).await {
                    self.message_id = id;
                }
            }
            Some(id) => {
                let outbound = OutboundMessage::new(partial.to_string());
                if let Err(e) = channel.edit_message(&self.recipient, id, outbound).await {
                    debug!(error = %e, "In-place edit failed, keeping last content");
                }
            }
        }
    }

    async fn on_complete(&mut self, answer: &str) {
        let Some(channel) = &self.channel else { return };
        let outbound = OutboundMessage::markdown(answer.to_string());
        match &self.message_id {
            Some(id) if channel.supports_editing() => {
                if channel
                    .edit_message(&self.recipient, id, outbound)
                    .await
                    .is_err()
                {
                    let retry = OutboundMessage::markdown(answer.to_string());
                    let _ = channel.send(&self.recipient, retry).await;
                }
            }
            _ => {
                let _ = channel
                    .send(&self.recipient, outbound.reply_to(self.reply_to.clone()))
                    .await;
            }
        }
    }

    async fn on_error(&mut self, apology: &str) {
        if self.errored {
            return;
        }
        self.errored = true;
        let Some(channel) = &self.channel else { return };
        let _ = channel
            .send(&self.recipient, OutboundMessage::new(apology.to_string()))
            .await;
    }
}
