//! Post-turn verification.
//!
//! After the loop emits its final answer, a verifier labels the turn
//! `success`, `partial` or `failure` without modifying it. The format
//! verifier is pure rule evaluation; the semantic verifier spends one
//! extra engine call; the composite runs both and keeps the worse outcome.
//! Verification is observational: the loop reports the result through its
//! event stream and never retries because of it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::tools::StateRecord;
use crate::engine::{Engine, EngineEvent, EngineRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationOutcome {
    Success,
    Partial,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationIssue {
    pub severity: IssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub outcome: VerificationOutcome,
    pub confidence: f64,
    pub reasoning: String,
    pub issues: Vec<VerificationIssue>,
    pub suggestions: Vec<String>,
}

impl VerificationResult {
    fn from_issues(issues: Vec<VerificationIssue>, reasoning: String, confidence: f64) -> Self {
        let outcome = if issues.iter().any(|i| i.severity == IssueSeverity::Error) {
            VerificationOutcome::Failure
        } else if issues.iter().any(|i| i.severity == IssueSeverity::Warning) {
            VerificationOutcome::Partial
        } else {
            VerificationOutcome::Success
        };
        Self {
            outcome,
            confidence,
            reasoning,
            issues,
            suggestions: Vec::new(),
        }
    }
}

/// Everything the verifier may inspect about one completed turn.
#[derive(Debug, Clone, Default)]
pub struct VerificationInput {
    /// The task description (first user message of the turn).
    pub task: String,
    pub answer: String,
    pub tool_invocations: u64,
    pub tool_errors: u64,
    pub state_records: Vec<StateRecord>,
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, input: &VerificationInput) -> VerificationResult;
}

/// Rule-based verification with no extra LLM call.
pub struct FormatVerifier {
    /// Turns whose tool-error ratio reaches this are flagged.
    pub max_tool_error_ratio: f64,
    /// Minimum word length for the answer-references-task rule.
    pub long_word_len: usize,
}

impl Default for FormatVerifier {
    fn default() -> Self {
        Self {
            max_tool_error_ratio: 0.5,
            long_word_len: 6,
        }
    }
}

impl FormatVerifier {
    fn run_rules(&self, input: &VerificationInput) -> Vec<VerificationIssue> {
        let mut issues = Vec::new();

        if input.answer.trim().is_empty() {
            issues.push(VerificationIssue {
                severity: IssueSeverity::Error,
                message: "answer is empty".into(),
            });
        }

        if input.answer.trim_start().starts_with("Error:") {
            issues.push(VerificationIssue {
                severity: IssueSeverity::Error,
                message: "answer begins with an error marker".into(),
            });
        }

        if input.tool_invocations > 0 {
            let ratio = input.tool_errors as f64 / input.tool_invocations as f64;
            if ratio >= self.max_tool_error_ratio {
                issues.push(VerificationIssue {
                    severity: IssueSeverity::Warning,
                    message: format!(
                        "{:.0}% of tool calls failed ({}/{})",
                        ratio * 100.0,
                        input.tool_errors,
                        input.tool_invocations
                    ),
                });
            }
        }

        // The answer should touch at least one substantial word of the task.
        let long_words: Vec<&str> = input
            .task
            .split_whitespace()
            .filter(|w| w.chars().count() >= self.long_word_len)
            .collect();
        if !long_words.is_empty() {
            let answer_lower = input.answer.to_lowercase();
            let referenced = long_words
                .iter()
                .any(|w| answer_lower.contains(&w.to_lowercase()));
            if !referenced {
                issues.push(VerificationIssue {
                    severity: IssueSeverity::Warning,
                    message: "answer does not reference the task".into(),
                });
            }
        }

        // Write-class tools that ran but left no observable delta.
        for record in &input.state_records {
            if record.before.is_some() && !record.has_delta() {
                issues.push(VerificationIssue {
                    severity: IssueSeverity::Warning,
                    message: format!("tool '{}' reported no state change", record.tool),
                });
            }
        }

        issues
    }
}

#[async_trait]
impl Verifier for FormatVerifier {
    async fn verify(&self, input: &VerificationInput) -> VerificationResult {
        let issues = self.run_rules(input);
        let confidence = if issues.is_empty() { 0.9 } else { 0.7 };
        VerificationResult::from_issues(issues, "format rules".into(), confidence)
    }
}

/// One extra engine call asking for a success judgement.
pub struct SemanticVerifier {
    engine: std::sync::Arc<dyn Engine>,
}

impl SemanticVerifier {
    pub fn new(engine: std::sync::Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    async fn judge(&self, input: &VerificationInput) -> Option<String> {
        use crate::agent::message::Message;

        let prompt = format!(
            "Task:\n{}\n\nAnswer:\n{}\n\nReply with exactly one word: success, partial or failure.",
            input.task, input.answer
        );
        let request = EngineRequest {
            messages: vec![Message::user(prompt)],
            tools: Vec::new(),
            model: None,
        };
        let mut run = self.engine.start_run(request).await.ok()?;
        while let Some(event) = run.events.recv().await {
            if let EngineEvent::Completed { answer, .. } = event {
                return Some(answer);
            }
        }
        None
    }
}

#[async_trait]
impl Verifier for SemanticVerifier {
    async fn verify(&self, input: &VerificationInput) -> VerificationResult {
        let Some(judgement) = self.judge(input).await else {
            debug!("Semantic verifier got no judgement, reporting partial");
            return VerificationResult {
                outcome: VerificationOutcome::Partial,
                confidence: 0.3,
                reasoning: "semantic judge unavailable".into(),
                issues: Vec::new(),
                suggestions: Vec::new(),
            };
        };
        let lower = judgement.to_lowercase();
        let outcome = if lower.contains("success") {
            VerificationOutcome::Success
        } else if lower.contains("failure") {
            VerificationOutcome::Failure
        } else {
            VerificationOutcome::Partial
        };
        VerificationResult {
            outcome,
            confidence: 0.6,
            reasoning: judgement,
            issues: Vec::new(),
            suggestions: Vec::new(),
        }
    }
}

/// Runs both verifiers and keeps the worse outcome with merged issues.
pub struct CompositeVerifier {
    format: FormatVerifier,
    semantic: SemanticVerifier,
}

impl CompositeVerifier {
    pub fn new(format: FormatVerifier, semantic: SemanticVerifier) -> Self {
        Self { format, semantic }
    }
}

#[async_trait]
impl Verifier for CompositeVerifier {
    async fn verify(&self, input: &VerificationInput) -> VerificationResult {
        let format = self.format.verify(input).await;
        let semantic = self.semantic.verify(input).await;

        let outcome = worse(format.outcome, semantic.outcome);
        let mut issues = format.issues;
        issues.extend(semantic.issues);
        VerificationResult {
            outcome,
            confidence: format.confidence.min(semantic.confidence),
            reasoning: format!("{}; {}", format.reasoning, semantic.reasoning),
            issues,
            suggestions: Vec::new(),
        }
    }
}

fn worse(a: VerificationOutcome, b: VerificationOutcome) -> VerificationOutcome {
    use VerificationOutcome::*;
    match (a, b) {
        (Failure, _) | (_, Failure) => Failure,
        (Partial, _) | (_, Partial) => Partial,
        _ => Success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clean_input() -> VerificationInput {
        VerificationInput {
            task: "summarize the README file".into(),
            answer: "The README explains how to install the gateway.".into(),
            tool_invocations: 2,
            tool_errors: 0,
            state_records: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_clean_turn_is_success() {
        let result = FormatVerifier::default().verify(&clean_input()).await;
        assert_eq!(result.outcome, VerificationOutcome::Success);
        assert!(result.issues.is_empty());
        assert!(result.confidence > 0.5);
    }

    #[tokio::test]
    async fn test_empty_answer_is_failure() {
        let mut input = clean_input();
        input.answer = "   ".into();
        let result = FormatVerifier::default().verify(&input).await;
        assert_eq!(result.outcome, VerificationOutcome::Failure);
    }

    #[tokio::test]
    async fn test_error_prefix_is_failure() {
        let mut input = clean_input();
        input.answer = "Error: could not reach the engine".into();
        let result = FormatVerifier::default().verify(&input).await;
        assert_eq!(result.outcome, VerificationOutcome::Failure);
    }

    #[tokio::test]
    async fn test_high_tool_error_ratio_is_partial() {
        let mut input = clean_input();
        input.tool_invocations = 4;
        input.tool_errors = 2;
        let result = FormatVerifier::default().verify(&input).await;
        assert_eq!(result.outcome, VerificationOutcome::Partial);
    }

    #[tokio::test]
    async fn test_unreferenced_task_is_partial() {
        let mut input = clean_input();
        input.answer = "All done!".into();
        let result = FormatVerifier::default().verify(&input).await;
        assert_eq!(result.outcome, VerificationOutcome::Partial);
        assert!(
            result
                .issues
                .iter()
                .any(|i| i.message.contains("reference"))
        );
    }

    #[tokio::test]
    async fn test_write_tool_without_delta_is_partial() {
        let mut input = clean_input();
        input.state_records.push(StateRecord {
            tool: "file_write".into(),
            before: Some(json!({"exists": true, "len": 3})),
            after: Some(json!({"exists": true, "len": 3})),
        });
        let result = FormatVerifier::default().verify(&input).await;
        assert_eq!(result.outcome, VerificationOutcome::Partial);
    }

    #[tokio::test]
    async fn test_semantic_verifier_reads_judgement() {
        use crate::engine::mock::MockEngine;

        let engine = MockEngine::new();
        engine.push_text_turn("failure: the answer ignores the task");
        let verifier = SemanticVerifier::new(std::sync::Arc::new(engine));
        let result = verifier.verify(&clean_input()).await;
        assert_eq!(result.outcome, VerificationOutcome::Failure);
    }

    #[tokio::test]
    async fn test_composite_keeps_worse_outcome() {
        use crate::engine::mock::MockEngine;

        let engine = MockEngine::new();
        engine.push_text_turn("success");
        let composite = CompositeVerifier::new(
            FormatVerifier::default(),
            SemanticVerifier::new(std::sync::Arc::new(engine)),
        );
        let mut input = clean_input();
        input.answer = "Error: nope".into();
        let result = composite.verify(&input).await;
        assert_eq!(result.outcome, VerificationOutcome::Failure);
    }

    #[test]
    fn test_worse_ordering() {
        use VerificationOutcome::*;
        assert_eq!(worse(Success, Partial), Partial);
        assert_eq!(worse(Partial, Failure), Failure);
        assert_eq!(worse(Success, Success), Success);
    }
}
