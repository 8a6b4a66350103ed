//! Speech collaborators used by the inbound pipeline.
//!
//! The actual transcription/synthesis engines are external; the pipeline
//! only needs these seams. Voice notes are resolved to text before routing
//! and, when enabled, the reply to a voice message is synthesised back to
//! audio.

use std::path::PathBuf;

use async_trait::async_trait;

#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, url: &str) -> anyhow::Result<String>;
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesises `text` and returns the path of the audio artifact.
    async fn synthesize(&self, text: &str) -> anyhow::Result<PathBuf>;
}
