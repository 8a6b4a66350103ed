//! Bounded conversation context with tool-pair-aware compaction.
//!
//! The context holds the ordered message list presented to the engine on
//! each call. The system prompt is stored separately and prepended on
//! export. A running token estimate (~4 chars per token) is maintained on
//! every add; when it crosses `max_tokens * compaction_threshold`, or the
//! message count exceeds `max_messages`, the configured compaction strategy
//! runs. Compaction treats an assistant message with tool calls and every
//! tool message answering it as one atomic unit, so a tool call is never
//! separated from its result.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::message::{Message, Role};

/// External summariser used by the `Summarize` and `Sliding` strategies.
/// Without one wired, both degrade to `DropOldest`.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStrategy {
    #[default]
    DropOldest,
    Summarize,
    Sliding,
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub max_tokens: usize,
    pub max_messages: usize,
    /// Fraction of `max_tokens` at which compaction triggers.
    pub compaction_threshold: f64,
    /// Fraction of `max_tokens` compaction shrinks down to.
    pub compaction_target: f64,
    /// Fraction of `max_tokens` the `Sliding` strategy keeps verbatim.
    pub keep_ratio: f64,
    pub strategy: CompactionStrategy,
    /// Keep the first user message (the task description).
    pub preserve_first_user: bool,
    /// Keep the N most recent tool-call groups.
    pub preserve_recent_tool_pairs: usize,
    /// Roles never dropped by compaction.
    pub pinned_roles: Vec<Role>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100_000,
            max_messages: 200,
            compaction_threshold: 0.8,
            compaction_target: 0.5,
            keep_ratio: 0.5,
            strategy: CompactionStrategy::DropOldest,
            preserve_first_user: true,
            preserve_recent_tool_pairs: 2,
            pinned_roles: Vec::new(),
        }
    }
}

pub struct ContextManager {
    system_prompt: Option<String>,
    messages: Vec<Message>,
    token_estimate: usize,
    config: ContextConfig,
    summarizer: Option<Box<dyn Summarizer>>,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            system_prompt: None,
            messages: Vec::new(),
            token_estimate: 0,
            config,
            summarizer: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Box<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn token_estimate(&self) -> usize {
        self.token_estimate
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Replaces the stored system prompt and recomputes the estimate.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = Some(prompt.into());
        self.recompute_estimate();
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    /// Appends a message, then compacts when either bound is exceeded.
    pub async fn add_message(&mut self, message: Message) {
        self.token_estimate += message.estimate_tokens();
        self.messages.push(message);

        let token_trigger =
            self.token_estimate as f64 > self.config.max_tokens as f64 * self.config.compaction_threshold;
        let count_trigger = self.messages.len() > self.config.max_messages;
        if token_trigger || count_trigger {
            self.compact().await;
        }
    }

    /// Defensive copy of the conversation with the system prompt prepended.
    pub fn get_messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            out.push(Message::system(prompt.clone()));
        }
        out.extend(self.messages.iter().cloned());
        out
    }

    /// Drops the conversation but keeps the system prompt.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.recompute_estimate();
    }

    /// Runs the configured compaction strategy now.
    pub async fn compact(&mut self) {
        let strategy = if self.summarizer.is_none()
            && self.config.strategy != CompactionStrategy::DropOldest
        {
            debug!("No summariser wired, degrading to drop_oldest");
            CompactionStrategy::DropOldest
        } else {
            self.config.strategy
        };

        let before_tokens = self.token_estimate;
        let before_messages = self.messages.len();

        match strategy {
            CompactionStrategy::DropOldest => {
                self.drop_oldest_units(self.target_tokens());
            }
            CompactionStrategy::Summarize => {
                let dropped = self.drop_oldest_units(self.target_tokens());
                self.insert_summary(&dropped).await;
            }
            CompactionStrategy::Sliding => {
                let window = (self.config.max_tokens as f64 * self.config.keep_ratio) as usize;
                let dropped = self.drop_oldest_units(window);
                self.insert_summary(&dropped).await;
            }
        }
        self.recompute_estimate();

        debug!(
            before_tokens,
            after_tokens = self.token_estimate,
            before_messages,
            after_messages = self.messages.len(),
            ?strategy,
            "Context compacted"
        );
    }

    fn target_tokens(&self) -> usize {
        (self.config.max_tokens as f64 * self.config.compaction_target) as usize
    }

    async fn insert_summary(&mut self, dropped: &[Message]) {
        if dropped.is_empty() {
            return;
        }
        let Some(summarizer) = &self.summarizer else {
            return;
        };
        match summarizer.summarize(dropped).await {
            Ok(summary) => {
                let text = format!("[Conversation summary] {summary}");
                self.messages.insert(0, Message::system(text));
            }
            Err(e) => {
                debug!(error = %e, "Summariser failed, dropped prefix is lost");
            }
        }
    }

    /// Removes whole units oldest-first until both bounds hold, skipping
    /// protected units. Returns the dropped messages in original order.
    fn drop_oldest_units(&mut self, target_tokens: usize) -> Vec<Message> {
        let units = self.build_units();
        let protected = self.protected_units(&units);

        let mut drop_unit = vec![false; units.len()];
        let mut tokens = self.messages_token_estimate();
        let mut remaining_msgs = self.messages.len();

        for (i, unit) in units.iter().enumerate() {
            let over_tokens = tokens > target_tokens;
            let over_count = remaining_msgs > self.config.max_messages;
            if !over_tokens && !over_count {
                break;
            }
            if protected[i] {
                continue;
            }
            // Never drop the newest unit: an empty context cannot answer.
            if i == units.len() - 1 {
                break;
            }
            drop_unit[i] = true;
            tokens = tokens.saturating_sub(unit.tokens);
            remaining_msgs -= unit.indices.len();
        }

        let mut drop_msg = vec![false; self.messages.len()];
        for (i, unit) in units.iter().enumerate() {
            if drop_unit[i] {
                for &idx in &unit.indices {
                    drop_msg[idx] = true;
                }
            }
        }

        let mut dropped = Vec::new();
        let mut kept = Vec::with_capacity(self.messages.len());
        for (idx, msg) in self.messages.drain(..).enumerate() {
            if drop_msg[idx] {
                dropped.push(msg);
            } else {
                kept.push(msg);
            }
        }
        self.messages = kept;
        dropped
    }

    /// Groups messages into atomic units. An assistant message with tool
    /// calls absorbs every tool message answering one of its ids, wherever
    /// that result appears; all other messages are single-message units.
    fn build_units(&self) -> Vec<Unit> {
        use std::collections::HashMap;

        let mut units: Vec<Unit> = Vec::new();
        // tool_call_id -> unit index
        let mut owner: HashMap<&str, usize> = HashMap::new();

        for (idx, msg) in self.messages.iter().enumerate() {
            if msg.role == Role::Tool {
                if let Some(unit_idx) = msg
                    .tool_call_id
                    .as_deref()
                    .and_then(|id| owner.get(id).copied())
                {
                    units[unit_idx].indices.push(idx);
                    units[unit_idx].tokens += msg.estimate_tokens();
                    continue;
                }
            }
            let unit_idx = units.len();
            let is_group = msg.has_tool_calls();
            units.push(Unit {
                indices: vec![idx],
                tokens: msg.estimate_tokens(),
                is_tool_group: is_group,
                role: msg.role,
            });
            if let Some(tool_calls) = &msg.tool_calls {
                for tc in tool_calls {
                    owner.insert(tc.id.as_str(), unit_idx);
                }
            }
        }
        units
    }

    fn protected_units(&self, units: &[Unit]) -> Vec<bool> {
        let mut protected = vec![false; units.len()];

        if self.config.preserve_first_user {
            if let Some(i) = units.iter().position(|u| u.role == Role::User) {
                protected[i] = true;
            }
        }
        for (i, unit) in units.iter().enumerate() {
            if self.config.pinned_roles.contains(&unit.role) {
                protected[i] = true;
            }
        }
        if self.config.preserve_recent_tool_pairs > 0 {
            let mut seen = 0;
            for (i, unit) in units.iter().enumerate().rev() {
                if unit.is_tool_group {
                    protected[i] = true;
                    seen += 1;
                    if seen >= self.config.preserve_recent_tool_pairs {
                        break;
                    }
                }
            }
        }
        protected
    }

    fn messages_token_estimate(&self) -> usize {
        self.messages.iter().map(Message::estimate_tokens).sum()
    }

    fn recompute_estimate(&mut self) {
        let system = self.system_prompt.as_ref().map_or(0, |p| p.len() / 4);
        self.token_estimate = system + self.messages_token_estimate();
    }
}

struct Unit {
    indices: Vec<usize>,
    tokens: usize,
    is_tool_group: bool,
    role: Role,
}

/// Checks the tool-pair invariant: every assistant tool-call id is answered
/// by a later tool message in the same list.
#[cfg(test)]
pub fn tool_pairs_intact(messages: &[Message]) -> bool {
    for (i, msg) in messages.iter().enumerate() {
        if let Some(tool_calls) = &msg.tool_calls {
            for tc in tool_calls {
                let answered = messages[i + 1..].iter().any(|m| {
                    m.role == Role::Tool && m.tool_call_id.as_deref() == Some(tc.id.as_str())
                });
                if !answered {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::message::ToolCall;
    use serde_json::json;

    fn tool_turn(call_id: &str, result: &str) -> (Message, Message) {
        let assistant = Message::assistant("").with_tool_calls(vec![ToolCall::new(
            call_id,
            "file_read",
            json!({"path": "README.md"}),
        )]);
        let tool = Message::tool_result(call_id, result);
        (assistant, tool)
    }

    fn small_config(max_tokens: usize) -> ContextConfig {
        ContextConfig {
            max_tokens,
            max_messages: 100,
            compaction_threshold: 0.8,
            compaction_target: 0.2,
            preserve_recent_tool_pairs: 0,
            preserve_first_user: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_system_prompt_prepended_on_export() {
        let mut ctx = ContextManager::new(ContextConfig::default());
        ctx.set_system_prompt("You are helpful.");
        ctx.add_message(Message::user("hi")).await;

        let messages = ctx.get_messages();
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content.as_text(), "You are helpful.");
        assert_eq!(messages[1].content.as_text(), "hi");
    }

    #[tokio::test]
    async fn test_clear_keeps_system_prompt() {
        let mut ctx = ContextManager::new(ContextConfig::default());
        ctx.set_system_prompt("p");
        ctx.add_message(Message::user("hi")).await;
        ctx.clear();

        let messages = ctx.get_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content.as_text(), "p");
    }

    #[tokio::test]
    async fn test_get_messages_is_defensive_copy() {
        let mut ctx = ContextManager::new(ContextConfig::default());
        ctx.add_message(Message::user("hi")).await;
        let mut copy = ctx.get_messages();
        copy.clear();
        assert_eq!(ctx.get_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_count_cap_trips_strictly_above() {
        let mut config = ContextConfig::default();
        config.max_messages = 3;
        config.preserve_first_user = false;
        let mut ctx = ContextManager::new(config);

        for i in 0..3 {
            ctx.add_message(Message::user(format!("m{i}"))).await;
        }
        // At equality: no compaction.
        assert_eq!(ctx.message_count(), 3);

        ctx.add_message(Message::user("m3")).await;
        assert!(ctx.message_count() <= 3);
    }

    #[tokio::test]
    async fn test_drop_oldest_never_splits_tool_pair() {
        let mut ctx = ContextManager::new(small_config(200));

        ctx.add_message(Message::user("x".repeat(200))).await;
        let (a1, t1) = tool_turn("tc_old", &"R".repeat(100));
        ctx.add_message(a1).await;
        ctx.add_message(t1).await;
        ctx.add_message(Message::user("y".repeat(200))).await;
        ctx.add_message(Message::assistant("z".repeat(200))).await;

        ctx.compact().await;

        let messages = ctx.get_messages();
        assert!(tool_pairs_intact(&messages));
        let has_assistant_call = messages.iter().any(|m| m.has_tool_calls());
        let has_tool_result = messages
            .iter()
            .any(|m| m.tool_call_id.as_deref() == Some("tc_old"));
        // Both halves of the pair share one fate.
        assert_eq!(has_assistant_call, has_tool_result);
    }

    #[tokio::test]
    async fn test_multi_result_group_is_atomic() {
        let mut ctx = ContextManager::new(small_config(100));

        let assistant = Message::assistant("").with_tool_calls(vec![
            ToolCall::new("tc_1", "file_read", json!({"path": "a"})),
            ToolCall::new("tc_2", "file_read", json!({"path": "b"})),
        ]);
        ctx.add_message(Message::user("task".repeat(40))).await;
        ctx.add_message(assistant).await;
        ctx.add_message(Message::tool_result("tc_1", "A".repeat(120))).await;
        ctx.add_message(Message::tool_result("tc_2", "B".repeat(120))).await;
        ctx.add_message(Message::assistant("done".repeat(60))).await;

        ctx.compact().await;

        let messages = ctx.get_messages();
        assert!(tool_pairs_intact(&messages));
        let results: Vec<_> = messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        let calls = messages.iter().filter(|m| m.has_tool_calls()).count();
        // Either the whole group survived (1 assistant + 2 results) or none.
        assert!(
            (calls == 1 && results.len() == 2) || (calls == 0 && results.is_empty()),
            "group split: {calls} calls, {} results",
            results.len()
        );
    }

    #[tokio::test]
    async fn test_preserve_first_user_message() {
        let mut config = small_config(200);
        config.preserve_first_user = true;
        let mut ctx = ContextManager::new(config);

        ctx.add_message(Message::user("the original task description"))
            .await;
        for i in 0..20 {
            ctx.add_message(Message::assistant(format!("{i}").repeat(80)))
                .await;
        }

        let messages = ctx.get_messages();
        assert_eq!(
            messages.first().map(|m| m.content.as_text()),
            Some("the original task description".to_string())
        );
    }

    #[tokio::test]
    async fn test_preserve_recent_tool_pairs() {
        let mut config = small_config(200);
        config.preserve_recent_tool_pairs = 1;
        let mut ctx = ContextManager::new(config);

        let (a1, t1) = tool_turn("tc_1", &"R".repeat(200));
        ctx.add_message(a1).await;
        ctx.add_message(t1).await;
        let (a2, t2) = tool_turn("tc_2", &"S".repeat(200));
        ctx.add_message(a2).await;
        ctx.add_message(t2).await;
        ctx.add_message(Message::assistant("fin".repeat(100))).await;

        ctx.compact().await;

        let messages = ctx.get_messages();
        assert!(tool_pairs_intact(&messages));
        assert!(
            messages
                .iter()
                .any(|m| m.tool_call_id.as_deref() == Some("tc_2")),
            "most recent tool pair must survive"
        );
    }

    #[tokio::test]
    async fn test_summarize_inserts_tagged_summary() {
        struct FixedSummarizer;
        #[async_trait]
        impl Summarizer for FixedSummarizer {
            async fn summarize(&self, _messages: &[Message]) -> anyhow::Result<String> {
                Ok("they talked about files".to_string())
            }
        }

        let mut config = small_config(100);
        config.strategy = CompactionStrategy::Summarize;
        let mut ctx = ContextManager::new(config).with_summarizer(Box::new(FixedSummarizer));

        for i in 0..10 {
            ctx.add_message(Message::user(format!("{i}").repeat(80))).await;
        }

        let messages = ctx.get_messages();
        let summary = messages
            .iter()
            .find(|m| m.content.as_text().starts_with("[Conversation summary]"));
        assert!(summary.is_some());
        assert_eq!(summary.unwrap().role, Role::System);
    }

    #[tokio::test]
    async fn test_summarize_without_summarizer_degrades() {
        let mut config = small_config(100);
        config.strategy = CompactionStrategy::Summarize;
        let mut ctx = ContextManager::new(config);

        for i in 0..10 {
            ctx.add_message(Message::user(format!("{i}").repeat(80))).await;
        }

        let messages = ctx.get_messages();
        assert!(
            !messages
                .iter()
                .any(|m| m.content.as_text().starts_with("[Conversation summary]"))
        );
        assert!(ctx.token_estimate() <= 100);
    }

    #[tokio::test]
    async fn test_token_estimate_tracks_add_and_compact() {
        let mut ctx = ContextManager::new(ContextConfig::default());
        assert_eq!(ctx.token_estimate(), 0);
        ctx.add_message(Message::user("x".repeat(400))).await;
        assert_eq!(ctx.token_estimate(), 100);
        ctx.clear();
        assert_eq!(ctx.token_estimate(), 0);
    }

    #[tokio::test]
    async fn test_random_histories_keep_pairs_intact() {
        // Deterministic pseudo-random walk over add/compact sequences.
        let mut seed = 0x2545_F491u32;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };

        let mut ctx = ContextManager::new(small_config(300));
        let mut call_counter = 0;
        for _ in 0..200 {
            match next() % 4 {
                0 => ctx.add_message(Message::user("u".repeat((next() % 300) as usize))).await,
                1 => ctx.add_message(Message::assistant("a".repeat((next() % 300) as usize))).await,
                2 => {
                    call_counter += 1;
                    let id = format!("tc_{call_counter}");
                    let (a, t) = tool_turn(&id, &"r".repeat((next() % 300) as usize));
                    ctx.add_message(a).await;
                    ctx.add_message(t).await;
                }
                _ => ctx.compact().await,
            }
            assert!(tool_pairs_intact(&ctx.get_messages()));
        }
    }
}
