//! chatwatch: rule-driven monitoring and moderation for chat streams.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
