//! Capabilities the pipeline consumes: where events come from, where actions
//! go, and who judges content.
//!
//! Implementations live in `channels` (transport) and `llm` (analyzer).
//! Every call may suspend; the dispatcher never holds a lock across one.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::{ActionError, AnalyzerError, SourceError};
use crate::pipeline::types::{
    ChatId, ChatMessage, ClassificationResult, Entity, Event, SendOptions, Sender,
};

/// Push stream of source events.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Upstream provider of chat events and entity lookups.
#[async_trait]
pub trait Source: Send + Sync {
    /// Resolve a user-supplied identifier (`@name`, numeric id, link).
    async fn get_entity(&self, identifier: &str) -> Result<Entity, SourceError>;

    /// Up to `limit` recent messages of `source`, newest first.
    async fn iterate_history(
        &self,
        source: ChatId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, SourceError>;

    /// Start delivering NewMessage / Edited / Deleted events.
    async fn subscribe(&self) -> Result<EventStream, SourceError>;
}

/// Outbound side effects. Failures are transient and never fatal to a rule.
#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn send(
        &self,
        target: ChatId,
        text: &str,
        options: SendOptions,
    ) -> Result<(), ActionError>;

    async fn forward(&self, destination: ChatId, original: &ChatMessage)
    -> Result<(), ActionError>;

    async fn delete(&self, target: ChatId, message_ids: &[i64]) -> Result<(), ActionError>;
}

/// Text classification and summarization.
#[async_trait]
pub trait ContentAnalyzer: Send + Sync {
    /// Short provider/model label for logs and report headers.
    fn name(&self) -> &str;

    async fn classify(
        &self,
        text: &str,
        sender: &Sender,
    ) -> Result<ClassificationResult, AnalyzerError>;

    /// Summarize `text`, optionally steered by `prompt`.
    async fn summarize(&self, text: &str, prompt: Option<&str>) -> Result<String, AnalyzerError>;
}
