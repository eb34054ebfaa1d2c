//! `ContentAnalyzer` backed by a rig-core agent.

use async_trait::async_trait;
use rig::agent::Agent;
use rig::completion::{CompletionModel, Prompt};
use serde::Deserialize;

use crate::error::AnalyzerError;
use crate::pipeline::report::DEFAULT_REPORT_PROMPT;
use crate::pipeline::traits::ContentAnalyzer;
use crate::pipeline::types::{ClassificationResult, Sender};

/// System prompt for spam classification.
pub const CLASSIFY_PREAMBLE: &str = r#"You are a chat moderation classifier. You receive one chat message and metadata about its sender.

Decide whether the message is spam: unsolicited advertising, scams, phishing links, crypto or investment schemes, bot-generated promotion, or mass-posted invitations.

Respond with ONLY a JSON object:
{"is_spam": true|false, "confidence": 0.0-1.0, "reason": "one short sentence"}

Use high confidence only when the message is clearly spam. Ordinary conversation, questions, and news are never spam."#;

/// System prompt for summaries and assessments.
pub const SUMMARIZE_PREAMBLE: &str = "You are an intelligence analyst. Be concise, factual, \
and structured. Quote sparingly and never invent content that is not in the log.";

pub const CLASSIFY_MAX_TOKENS: u64 = 256;
pub const SUMMARIZE_MAX_TOKENS: u64 = 4096;

/// Spam classifier and summarizer over one LLM model.
pub struct RigAnalyzer<M: CompletionModel> {
    classifier: Agent<M>,
    summarizer: Agent<M>,
    provider: String,
    label: String,
}

impl<M: CompletionModel> RigAnalyzer<M> {
    pub fn new(classifier: Agent<M>, summarizer: Agent<M>, provider: &str, model: &str) -> Self {
        Self {
            classifier,
            summarizer,
            provider: provider.to_string(),
            label: format!("{provider}/{model}"),
        }
    }

    fn request_failed(&self, e: impl std::fmt::Display) -> AnalyzerError {
        AnalyzerError::RequestFailed {
            provider: self.provider.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl<M> ContentAnalyzer for RigAnalyzer<M>
where
    M: CompletionModel + 'static,
{
    fn name(&self) -> &str {
        &self.label
    }

    async fn classify(
        &self,
        text: &str,
        sender: &Sender,
    ) -> Result<ClassificationResult, AnalyzerError> {
        let prompt = build_classify_prompt(text, sender);
        let raw = self
            .classifier
            .prompt(prompt.as_str())
            .await
            .map_err(|e| self.request_failed(e))?;
        parse_classification(&raw).map_err(|reason| AnalyzerError::InvalidResponse {
            provider: self.provider.clone(),
            reason,
        })
    }

    async fn summarize(&self, text: &str, prompt: Option<&str>) -> Result<String, AnalyzerError> {
        let request = build_summary_prompt(text, prompt);
        let summary = self
            .summarizer
            .prompt(request.as_str())
            .await
            .map_err(|e| self.request_failed(e))?;
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(AnalyzerError::EmptyResponse {
                provider: self.provider.clone(),
            });
        }
        Ok(summary.to_string())
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_classify_prompt(text: &str, sender: &Sender) -> String {
    let sender_line = match sender {
        Sender::Present {
            id,
            username,
            first_name,
            is_bot,
        } => format!(
            "id={id}, username={}, name={}, bot={is_bot}",
            username.as_deref().unwrap_or("-"),
            first_name.as_deref().unwrap_or("-"),
        ),
        Sender::Absent => "unknown (anonymous or channel post)".to_string(),
    };
    format!("Sender: {sender_line}\n\nMessage:\n{text}")
}

/// Prompt followed by the text between log markers.
pub fn build_summary_prompt(text: &str, prompt: Option<&str>) -> String {
    format!(
        "{}\n\n--- LOG START ---\n{}\n--- LOG END ---",
        prompt.unwrap_or(DEFAULT_REPORT_PROMPT),
        text
    )
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    is_spam: bool,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    reason: String,
}

/// Parse the classifier's JSON reply. Confidence is clamped to [0, 1].
pub fn parse_classification(raw: &str) -> Result<ClassificationResult, String> {
    let json_str = extract_json_object(raw);
    let response: ClassifyResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let confidence = if response.confidence.is_nan() {
        0.0
    } else {
        response.confidence.clamp(0.0, 1.0)
    };

    Ok(ClassificationResult {
        is_spam: response.is_spam,
        confidence,
        reason: response.reason,
    })
}

/// Extract a JSON object from a response that may be wrapped in markdown.
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    // Already a JSON object
    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    // Wrapped in markdown code block
    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let after = &trimmed[start + fence.len()..];
            if let Some(end) = after.find("```") {
                let inner = after[..end].trim();
                if inner.starts_with('{') {
                    return inner.to_string();
                }
            }
        }
    }

    // Try to find object bounds
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
