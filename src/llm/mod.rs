//! LLM integration.
//!
//! Supports:
//! - **Anthropic**: Direct API access via rig-core
//! - **OpenAI**: Direct API access via rig-core
//!
//! Both back a [`RigAnalyzer`], the crate's `ContentAnalyzer`.

pub mod analyzer;

pub use analyzer::{RigAnalyzer, parse_classification};

use std::str::FromStr;
use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::error::AnalyzerError;
use crate::pipeline::traits::ContentAnalyzer;

use analyzer::{CLASSIFY_MAX_TOKENS, CLASSIFY_PREAMBLE, SUMMARIZE_MAX_TOKENS, SUMMARIZE_PREAMBLE};

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    pub fn name(&self) -> &'static str {
        match self {
            LlmBackend::Anthropic => "anthropic",
            LlmBackend::OpenAi => "openai",
        }
    }

    /// Model used when none is configured.
    pub fn default_model(&self) -> &'static str {
        match self {
            LlmBackend::Anthropic => "claude-sonnet-4-20250514",
            LlmBackend::OpenAi => "gpt-4o",
        }
    }
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(LlmBackend::Anthropic),
            "openai" | "open_ai" => Ok(LlmBackend::OpenAi),
            other => Err(format!("unknown backend '{other}' (expected anthropic or openai)")),
        }
    }
}

/// Configuration for creating an analyzer.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Create the content analyzer from configuration.
///
/// Must be called from within a Tokio runtime: building a rig agent spawns
/// its tool server task.
pub fn create_analyzer(config: &LlmConfig) -> Result<Arc<dyn ContentAnalyzer>, AnalyzerError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_analyzer(config),
        LlmBackend::OpenAi => create_openai_analyzer(config),
    }
}

fn create_anthropic_analyzer(config: &LlmConfig) -> Result<Arc<dyn ContentAnalyzer>, AnalyzerError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            AnalyzerError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let classifier = client
        .agent(config.model.as_str())
        .preamble(CLASSIFY_PREAMBLE)
        .max_tokens(CLASSIFY_MAX_TOKENS)
        .build();
    let summarizer = client
        .agent(config.model.as_str())
        .preamble(SUMMARIZE_PREAMBLE)
        .max_tokens(SUMMARIZE_MAX_TOKENS)
        .build();

    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigAnalyzer::new(
        classifier,
        summarizer,
        "anthropic",
        &config.model,
    )))
}

fn create_openai_analyzer(config: &LlmConfig) -> Result<Arc<dyn ContentAnalyzer>, AnalyzerError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            AnalyzerError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            }
        })?;

    let classifier = client
        .agent(config.model.as_str())
        .preamble(CLASSIFY_PREAMBLE)
        .max_tokens(CLASSIFY_MAX_TOKENS)
        .build();
    let summarizer = client
        .agent(config.model.as_str())
        .preamble(SUMMARIZE_PREAMBLE)
        .max_tokens(SUMMARIZE_MAX_TOKENS)
        .build();

    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigAnalyzer::new(
        classifier,
        summarizer,
        "openai",
        &config.model,
    )))
}
