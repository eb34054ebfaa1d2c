//! Intelligence reports: on-demand analysis, multi-source comparison, and
//! the body of scheduled report rules.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Error, EvalError, SourceError};
use crate::pipeline::alerts::{AlertConfig, send_chunked};
use crate::pipeline::traits::{ActionSink, ContentAnalyzer, Source};
use crate::pipeline::types::{ChatId, ChatMessage, Entity, SendOptions};

/// Default analysis prompt for history reports.
pub const DEFAULT_REPORT_PROMPT: &str = "Analyze the following chat history. \
Identify the main topics, key decisions made, and the general sentiment. \
If specific dates or deadlines are mentioned, highlight them. \
Provide a sentiment score (0-100) and identify key entities (people, organizations, locations).";

/// Appended when a report asks for structured entities.
pub const ENTITY_EXTRACTION_INSTRUCTION: &str = "IMPORTANT: At the end, provide a structured entity list in this format:\n\
=== ENTITIES ===\n\
People: [list]\n\
Organizations: [list]\n\
Locations: [list]\n\
Keywords: [list]\n\
Dates: [list]\n\
Sentiment Score: [0-100]";

/// Instructions for comparing several sources.
pub const COMPARISON_PROMPT: &str = "You are analyzing multiple chat channels. \
Compare and contrast them, highlighting:\n\
1. Common themes and differences\n\
2. Sentiment comparison\n\
3. Key players appearing across channels\n\
4. Coordination or conflicts between channels\n\
5. Strategic recommendations";

/// Sources a comparison needs.
const MIN_COMPARE_SOURCES: usize = 2;

/// Prompt options for a history report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportOptions {
    /// Replaces [`DEFAULT_REPORT_PROMPT`] when set.
    pub prompt: Option<String>,
    pub extract_entities: bool,
}

impl ReportOptions {
    pub fn build_prompt(&self) -> String {
        let mut prompt = self
            .prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_REPORT_PROMPT.to_string());
        if self.extract_entities {
            prompt.push_str("\n\n");
            prompt.push_str(ENTITY_EXTRACTION_INSTRUCTION);
        }
        prompt
    }
}

/// Render history (newest first, as the source returns it) as a
/// chronological transcript. Messages without text are skipped.
pub fn transcript(history: &[ChatMessage]) -> String {
    history
        .iter()
        .rev()
        .filter_map(ChatMessage::log_line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Builds reports and sends them to the operator chat.
#[derive(Clone)]
pub struct Reporter {
    source: Arc<dyn Source>,
    analyzer: Arc<dyn ContentAnalyzer>,
    sink: Arc<dyn ActionSink>,
    operator_chat: ChatId,
    alerts: AlertConfig,
}

impl Reporter {
    pub fn new(
        source: Arc<dyn Source>,
        analyzer: Arc<dyn ContentAnalyzer>,
        sink: Arc<dyn ActionSink>,
        operator_chat: ChatId,
        alerts: AlertConfig,
    ) -> Self {
        Self {
            source,
            analyzer,
            sink,
            operator_chat,
            alerts,
        }
    }

    /// Resolve `identifier`, summarize its last `limit` messages, and send
    /// the report. Returns the number of parts sent.
    pub async fn analyze(
        &self,
        identifier: &str,
        limit: usize,
        options: &ReportOptions,
    ) -> crate::error::Result<usize> {
        let entity = self.source.get_entity(identifier).await?;
        let text = self.fetch_transcript(&entity, limit).await?;
        let body = self.summarize(&text, &options.build_prompt()).await;
        let report = format_report(&entity, limit, self.analyzer.name(), &body);
        Ok(self.deliver(&report).await?)
    }

    /// Report on an already resolved source. Used by scheduled reports.
    pub async fn report_on(
        &self,
        entity: &Entity,
        limit: usize,
        options: &ReportOptions,
    ) -> Result<usize, EvalError> {
        let text = self.fetch_transcript(entity, limit).await?;
        let body = self.summarize(&text, &options.build_prompt()).await;
        let report = format_report(entity, limit, self.analyzer.name(), &body);
        Ok(self.deliver(&report).await?)
    }

    /// Compare the recent history of several sources.
    ///
    /// Sources that fail to resolve or have no text are skipped; at least two
    /// must remain.
    pub async fn compare(&self, identifiers: &[&str], limit: usize) -> crate::error::Result<usize> {
        if identifiers.len() < MIN_COMPARE_SOURCES {
            return Err(Error::NotEnoughSources {
                needed: MIN_COMPARE_SOURCES,
                got: identifiers.len(),
            });
        }

        let mut sections = Vec::new();
        for identifier in identifiers {
            let entity = match self.source.get_entity(identifier).await {
                Ok(entity) => entity,
                Err(e) => {
                    warn!(identifier = %identifier, error = %e, "Skipping source in comparison");
                    continue;
                }
            };
            match self.fetch_transcript(&entity, limit).await {
                Ok(text) => sections.push((entity.title, text)),
                Err(e) => {
                    warn!(source = %entity.title, error = %e, "Skipping source in comparison");
                }
            }
        }

        if sections.len() < MIN_COMPARE_SOURCES {
            return Err(Error::NotEnoughSources {
                needed: MIN_COMPARE_SOURCES,
                got: sections.len(),
            });
        }

        let combined = sections
            .iter()
            .enumerate()
            .map(|(i, (title, text))| format!("=== CHANNEL {}: {} ===\n{}", i + 1, title, text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let body = self.summarize(&combined, COMPARISON_PROMPT).await;

        let titles: Vec<&str> = sections.iter().map(|(t, _)| t.as_str()).collect();
        let report = format!(
            "🛡️ *COMPARATIVE INTELLIGENCE*\n*Channels:* {}\n*Scope:* {} messages per channel\n*Model:* {}\n\n{}",
            titles.join(", "),
            limit,
            self.analyzer.name(),
            body
        );
        Ok(self.deliver(&report).await?)
    }

    async fn fetch_transcript(&self, entity: &Entity, limit: usize) -> Result<String, SourceError> {
        info!(source = %entity.title, limit, "Fetching history");
        let history = self.source.iterate_history(entity.id, limit).await?;
        let text = transcript(&history);
        if text.is_empty() {
            return Err(SourceError::EmptyHistory {
                title: entity.title.clone(),
            });
        }
        Ok(text)
    }

    /// Analyzer output, or the failure text in its place.
    async fn summarize(&self, text: &str, prompt: &str) -> String {
        match self.analyzer.summarize(text, Some(prompt)).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "Report summarization failed");
                format!("⚠️ *Intelligence Failure:* {}", e)
            }
        }
    }

    async fn deliver(&self, report: &str) -> Result<usize, crate::error::ActionError> {
        send_chunked(
            self.sink.as_ref(),
            self.operator_chat,
            report,
            SendOptions::markdown(),
            &self.alerts,
        )
        .await
    }
}

fn format_report(entity: &Entity, limit: usize, model: &str, body: &str) -> String {
    format!(
        "🛡️ *INTELLIGENCE REPORT*\n*Source:* {}\n*Scope:* Last {} messages\n*Model:* {}\n\n{}",
        entity.title, limit, model, body
    )
}
