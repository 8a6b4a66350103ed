//! Memory backend seam and the auto-recall loop hook.
//!
//! The storage engine behind [`MemoryBackend`] is external; the in-memory
//! implementation here exists for tests and single-process setups. Recall
//! ranks entries by naive word overlap with the query, most recent first on
//! ties.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::agent::agent_loop::LoopHooks;
use crate::agent::context::ContextManager;
use crate::agent::message::Message;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl MemoryEntry {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            created_at: Utc::now(),
            tags: Vec::new(),
        }
    }
}

#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn store(&self, entry: MemoryEntry) -> anyhow::Result<()>;
    async fn recall(&self, query: &str, limit: usize) -> anyhow::Result<Vec<MemoryEntry>>;
    async fn close(&self) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct InMemoryBackend {
    entries: RwLock<Vec<MemoryEntry>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn overlap_score(query: &str, content: &str) -> usize {
    let content_lower = content.to_lowercase();
    query
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.len() >= 3 && content_lower.contains(*w))
        .count()
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    async fn store(&self, entry: MemoryEntry) -> anyhow::Result<()> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn recall(&self, query: &str, limit: usize) -> anyhow::Result<Vec<MemoryEntry>> {
        let entries = self.entries.read().await;
        let mut scored: Vec<(usize, &MemoryEntry)> = entries
            .iter()
            .map(|e| (overlap_score(query, &e.content), e))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.created_at.cmp(&a.1.created_at)));
        Ok(scored.into_iter().take(limit).map(|(_, e)| e.clone()).collect())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Loop hook that recalls memories relevant to the latest user message and
/// prepends them as a system message before the first engine call.
pub struct MemoryRecallHooks {
    backend: std::sync::Arc<dyn MemoryBackend>,
    limit: usize,
}

impl MemoryRecallHooks {
    pub fn new(backend: std::sync::Arc<dyn MemoryBackend>) -> Self {
        Self { backend, limit: 5 }
    }
}

#[async_trait]
impl LoopHooks for MemoryRecallHooks {
    async fn on_before_first_run(&self, ctx: &mut ContextManager) {
        let query = ctx
            .get_messages()
            .iter()
            .rev()
            .find(|m| m.role == crate::agent::message::Role::User)
            .map(|m| m.content.as_text());
        let Some(query) = query else {
            return;
        };
        match self.backend.recall(&query, self.limit).await {
            Ok(entries) if !entries.is_empty() => {
                let listing = entries
                    .iter()
                    .map(|e| format!("- {}", e.content))
                    .collect::<Vec<_>>()
                    .join("\n");
                debug!(count = entries.len(), "Recalled memories for turn");
                ctx.add_message(Message::system(format!("Relevant memories:\n{listing}")))
                    .await;
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Memory recall failed, continuing without"),
        }
    }
}
