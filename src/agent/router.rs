//! Config-driven agent selection.
//!
//! Routing rules are evaluated in order against each inbound message; the
//! first rule whose channel pattern admits the channel id and whose text
//! pattern admits the message text selects the named agent profile. Rules
//! naming agents that do not exist are warned about at startup and skipped
//! silently at runtime, so a config typo degrades to the default agent
//! instead of failing a live message.

use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::channels::types::InboundMessage;

pub const DEFAULT_AGENT_NAME: &str = "default";
pub const DEFAULT_MAX_ITERATIONS: u32 = 20;

#[derive(Error, Debug)]
pub enum AgentRouterError {
    #[error("rule {index}: invalid channel pattern '{pattern}': {source}")]
    InvalidChannelPattern {
        index: usize,
        pattern: String,
        source: regex::Error,
    },
    #[error("rule {index}: invalid match pattern '{pattern}': {source}")]
    InvalidMatchPattern {
        index: usize,
        pattern: String,
        source: regex::Error,
    },
}

/// One routing rule from config: channel glob (`*` wildcard) plus a text
/// regex, selecting a named agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRule {
    pub channel: String,
    #[serde(rename = "match")]
    pub pattern: String,
    pub agent: String,
}

/// A named agent profile from config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub tool_exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub agent_name: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub max_iterations: u32,
    pub tool_exclude: Vec<String>,
}

impl RoutingDecision {
    fn default_with(system_prompt: Option<String>) -> Self {
        Self {
            agent_name: DEFAULT_AGENT_NAME.to_string(),
            system_prompt,
            model: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tool_exclude: Vec::new(),
        }
    }
}

struct CompiledRule {
    channel: Regex,
    pattern: Regex,
    agent: String,
}

pub struct AgentRouter {
    rules: Vec<CompiledRule>,
    agents: HashMap<String, AgentProfile>,
}

impl AgentRouter {
    /// Compiles all rule patterns up front. Rules referencing undefined
    /// agents are kept (they are skipped at route time) but warned about.
    pub fn new(
        rules: Vec<AgentRule>,
        agents: HashMap<String, AgentProfile>,
    ) -> Result<Self, AgentRouterError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for (index, rule) in rules.into_iter().enumerate() {
            if !agents.contains_key(&rule.agent) {
                warn!(
                    rule = index,
                    agent = %rule.agent,
                    "Routing rule references undefined agent, it will never match"
                );
            }
            let channel = compile_channel_pattern(&rule.channel).map_err(|source| {
                AgentRouterError::InvalidChannelPattern {
                    index,
                    pattern: rule.channel.clone(),
                    source,
                }
            })?;
            let pattern = RegexBuilder::new(&rule.pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| AgentRouterError::InvalidMatchPattern {
                    index,
                    pattern: rule.pattern.clone(),
                    source,
                })?;
            compiled.push(CompiledRule {
                channel,
                pattern,
                agent: rule.agent,
            });
        }
        Ok(Self {
            rules: compiled,
            agents,
        })
    }

    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            agents: HashMap::new(),
        }
    }

    /// First matching rule with a defined agent wins; otherwise the default
    /// decision carrying the provided default system prompt.
    pub fn route(&self, msg: &InboundMessage, default_system_prompt: &str) -> RoutingDecision {
        let text = msg.text.as_deref().unwrap_or("");
        for rule in &self.rules {
            if !rule.channel.is_match(&msg.channel_id) {
                continue;
            }
            if !rule.pattern.is_match(text) {
                continue;
            }
            let Some(profile) = self.agents.get(&rule.agent) else {
                continue;
            };
            return RoutingDecision {
                agent_name: rule.agent.clone(),
                system_prompt: profile
                    .system_prompt
                    .clone()
                    .or_else(|| Some(default_system_prompt.to_string())),
                model: profile.model.clone(),
                max_iterations: profile.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
                tool_exclude: profile.tool_exclude.clone(),
            };
        }
        RoutingDecision::default_with(Some(default_system_prompt.to_string()))
    }
}

/// `*` matches any channel; otherwise the pattern is a literal with `*`
/// wildcards, compiled to a case-insensitive anchored regex.
fn compile_channel_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    RegexBuilder::new(&format!("^{escaped}$"))
        .case_insensitive(true)
        .build()
}
