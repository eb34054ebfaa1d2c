//! Per-kind rule evaluation.
//!
//! [`evaluate`] is the one entry point: it matches on the rule kind, checks
//! the rule's predicate against the event, and performs the rule's action.
//! Match and action counters are recorded here; the dispatcher records
//! errors for whatever comes back as `Err` (or panics).

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::EvalError;
use crate::pipeline::alerts::{
    AlertConfig, delete_alert, edit_alert, moderation_audit, send_chunked, watch_alert,
};
use crate::pipeline::report::{ReportOptions, Reporter};
use crate::pipeline::rules::{Rule, RuleKind};
use crate::pipeline::traits::{ActionSink, ContentAnalyzer};
use crate::pipeline::types::{ChatId, ChatMessage, Event, EventKind, SendOptions};

/// Prompt for the short assessment attached to watch alerts.
pub const WATCH_ASSESSMENT_PROMPT: &str =
    "Quick intelligence assessment of this new message. Is it significant?";

/// What one evaluation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Predicate did not match.
    NoMatch,
    /// Matched, but the rule is configured not to act.
    Matched,
    /// Matched and the action went through.
    Acted,
}

/// Shared, read-only collaborators for evaluations.
pub struct EvalContext {
    pub sink: Arc<dyn ActionSink>,
    pub analyzer: Arc<dyn ContentAnalyzer>,
    pub reporter: Reporter,
    pub operator_chat: ChatId,
    pub alerts: AlertConfig,
}

impl EvalContext {
    async fn alert_operator(&self, text: &str) -> Result<usize, EvalError> {
        Ok(send_chunked(
            self.sink.as_ref(),
            self.operator_chat,
            text,
            SendOptions::markdown(),
            &self.alerts,
        )
        .await?)
    }
}

/// Evaluate one rule against one event.
///
/// `edit_ordinal` is the message's total edit count after this edit was
/// recorded; only meaningful for `Edited` events.
pub async fn evaluate(
    rule: &Rule,
    event: &Event,
    edit_ordinal: Option<u64>,
    ctx: &EvalContext,
) -> Result<Outcome, EvalError> {
    match (&rule.kind, &event.kind) {
        (
            RuleKind::Forward {
                destination,
                filter,
            },
            EventKind::NewMessage(message),
        ) => {
            if filter.evaluate(message).is_none() {
                return Ok(Outcome::NoMatch);
            }
            ctx.sink.forward(destination.id, message).await?;
            rule.counters.record_match();
            rule.counters.record_action();
            debug!(rule_id = %rule.id, message_id = message.id, destination = %destination.title, "Forwarded");
            Ok(Outcome::Acted)
        }

        (
            RuleKind::Moderate {
                ban_threshold,
                delete_spam,
            },
            EventKind::NewMessage(message),
        ) => moderate(rule, message, *ban_threshold, *delete_spam, ctx).await,

        (RuleKind::Watch { filter }, EventKind::NewMessage(message)) => {
            if message.text.as_deref().is_none_or(str::is_empty) {
                return Ok(Outcome::NoMatch);
            }
            let Some(matched) = filter.evaluate(message) else {
                return Ok(Outcome::NoMatch);
            };
            rule.counters.record_match();

            let line = message
                .log_line()
                .unwrap_or_else(|| message.text_or_empty().to_string());
            let assessment = match ctx
                .analyzer
                .summarize(&line, Some(WATCH_ASSESSMENT_PROMPT))
                .await
            {
                Ok(summary) => summary,
                Err(e) => e.to_string(),
            };

            let alert = watch_alert(&rule.source.title, message, &matched, &assessment);
            ctx.alert_operator(&alert).await?;
            rule.counters.record_action();
            Ok(Outcome::Acted)
        }

        (RuleKind::EventMonitor(state), EventKind::Edited(message)) if state.watch_edits => {
            state.record_edit();
            rule.counters.record_match();
            let ordinal = edit_ordinal.unwrap_or(1);
            let alert = edit_alert(&rule.source.title, message, ordinal, event.timestamp);
            ctx.alert_operator(&alert).await?;
            rule.counters.record_action();
            Ok(Outcome::Acted)
        }

        (RuleKind::EventMonitor(state), EventKind::Deleted { message_ids })
            if state.watch_deletes =>
        {
            state.record_deletes(message_ids.len());
            rule.counters.record_match();
            let alert = delete_alert(&rule.source.title, message_ids, event.timestamp);
            ctx.alert_operator(&alert).await?;
            rule.counters.record_action();
            Ok(Outcome::Acted)
        }

        (
            RuleKind::ScheduledReport {
                limit,
                prompt,
                extract_entities,
                ..
            },
            EventKind::Tick { rule_id },
        ) if *rule_id == rule.id => {
            rule.counters.record_match();
            let options = ReportOptions {
                prompt: prompt.clone(),
                extract_entities: *extract_entities,
            };
            ctx.reporter.report_on(&rule.source, *limit, &options).await?;
            rule.counters.record_action();
            info!(rule_id = %rule.id, source = %rule.source.title, "Scheduled report sent");
            Ok(Outcome::Acted)
        }

        _ => Ok(Outcome::NoMatch),
    }
}

/// Classify first, delete only on a confident spam verdict. A classifier
/// error is returned before any delete is considered.
async fn moderate(
    rule: &Rule,
    message: &ChatMessage,
    ban_threshold: f32,
    delete_spam: bool,
    ctx: &EvalContext,
) -> Result<Outcome, EvalError> {
    let Some(text) = message.text.as_deref().filter(|t| !t.trim().is_empty()) else {
        return Ok(Outcome::NoMatch);
    };

    let verdict = ctx.analyzer.classify(text, &message.sender).await?;
    if !verdict.is_spam || verdict.confidence < ban_threshold {
        debug!(
            rule_id = %rule.id,
            message_id = message.id,
            confidence = verdict.confidence,
            "Not spam"
        );
        return Ok(Outcome::NoMatch);
    }
    rule.counters.record_match();

    if !delete_spam {
        info!(
            rule_id = %rule.id,
            message_id = message.id,
            confidence = verdict.confidence,
            reason = %verdict.reason,
            "Spam detected (report only)"
        );
        return Ok(Outcome::Matched);
    }

    ctx.sink.delete(message.chat_id, &[message.id]).await?;
    rule.counters.record_action();
    info!(
        rule_id = %rule.id,
        message_id = message.id,
        confidence = verdict.confidence,
        "Spam deleted"
    );

    let audit = moderation_audit(&rule.source.title, message, &verdict);
    ctx.alert_operator(&audit).await?;
    Ok(Outcome::Acted)
}
