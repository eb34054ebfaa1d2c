//! Rule model: what an operator installs and what the dispatcher evaluates.
//!
//! A rule is a tagged value (kind + immutable filter + action parameters)
//! plus atomic counters. Everything except the counters is frozen at
//! install time, so evaluations can share a rule through an `Arc` without
//! locking.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::InstallError;
use crate::pipeline::scheduler::{Cadence, CadenceSpec};
use crate::pipeline::types::{ChatMessage, Entity, EventKind, RuleId};

/// Default confidence required before a spam verdict can delete.
pub const DEFAULT_BAN_THRESHOLD: f32 = 0.8;

/// Default number of messages a scheduled report summarizes.
pub const DEFAULT_REPORT_LIMIT: usize = 50;

// ── Install request ─────────────────────────────────────────────────

/// An install request, as read from the rules file or built by a caller.
///
/// `source` and `destination` are unresolved identifiers; the dispatcher
/// resolves them through the source before building a [`Rule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleSpec {
    Forward {
        source: String,
        destination: String,
        #[serde(default)]
        keywords: Vec<String>,
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        media_only: bool,
    },
    Moderate {
        source: String,
        #[serde(default = "default_ban_threshold")]
        ban_threshold: f32,
        #[serde(default = "default_true")]
        delete_spam: bool,
    },
    Watch {
        source: String,
        #[serde(default)]
        keywords: Vec<String>,
        #[serde(default)]
        pattern: Option<String>,
    },
    EventMonitor {
        source: String,
        #[serde(default = "default_true")]
        watch_edits: bool,
        #[serde(default = "default_true")]
        watch_deletes: bool,
        #[serde(default)]
        watch_online: bool,
    },
    ScheduledReport {
        source: String,
        cadence: CadenceSpec,
        #[serde(default = "default_report_limit")]
        limit: usize,
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        extract_entities: bool,
    },
}

fn default_ban_threshold() -> f32 {
    DEFAULT_BAN_THRESHOLD
}

fn default_true() -> bool {
    true
}

fn default_report_limit() -> usize {
    DEFAULT_REPORT_LIMIT
}

impl RuleSpec {
    /// Identifier of the watched source.
    pub fn source(&self) -> &str {
        match self {
            RuleSpec::Forward { source, .. }
            | RuleSpec::Moderate { source, .. }
            | RuleSpec::Watch { source, .. }
            | RuleSpec::EventMonitor { source, .. }
            | RuleSpec::ScheduledReport { source, .. } => source,
        }
    }

    /// Identifier of the forward destination, if this kind has one.
    pub fn destination(&self) -> Option<&str> {
        match self {
            RuleSpec::Forward { destination, .. } => Some(destination),
            _ => None,
        }
    }
}

// ── Filters ─────────────────────────────────────────────────────────

/// Keyword / regex / media predicate shared by Forward and Watch rules.
#[derive(Debug, Clone)]
pub struct MessageFilter {
    /// Lowercased, trimmed, non-empty keywords.
    keywords: Vec<String>,
    pattern: Option<Regex>,
    media_only: bool,
}

impl MessageFilter {
    pub fn new(
        keywords: &[String],
        pattern: Option<&str>,
        media_only: bool,
    ) -> Result<Self, InstallError> {
        let keywords = keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        let pattern = pattern
            .map(|p| {
                Regex::new(p).map_err(|e| InstallError::InvalidPattern {
                    pattern: p.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;
        Ok(Self {
            keywords,
            pattern,
            media_only,
        })
    }

    /// Filter that matches every message.
    pub fn match_all() -> Self {
        Self {
            keywords: Vec::new(),
            pattern: None,
            media_only: false,
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Keywords contained in `text` (case-insensitive substring match).
    pub fn matched_keywords(&self, text: &str) -> Vec<&str> {
        let lower = text.to_lowercase();
        self.keywords
            .iter()
            .filter(|k| lower.contains(k.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Evaluate against a message.
    ///
    /// Returns `None` on no match, otherwise the keywords that hit (empty
    /// when no keywords are configured).
    pub fn evaluate(&self, message: &ChatMessage) -> Option<Vec<&str>> {
        if self.media_only && !message.has_media {
            return None;
        }

        let matched = if self.keywords.is_empty() {
            Vec::new()
        } else {
            let hits = self.matched_keywords(message.text.as_deref()?);
            if hits.is_empty() {
                return None;
            }
            hits
        };

        if let Some(ref re) = self.pattern
            && !re.is_match(message.text.as_deref()?)
        {
            return None;
        }

        Some(matched)
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.keywords.is_empty() {
            parts.push("all messages".to_string());
        } else {
            parts.push(format!("keywords: {}", self.keywords.join(", ")));
        }
        if let Some(ref re) = self.pattern {
            parts.push(format!("pattern: {}", re.as_str()));
        }
        if self.media_only {
            parts.push("media only".to_string());
        }
        parts.join("; ")
    }
}

// ── Counters ────────────────────────────────────────────────────────

/// Per-rule counters. The only mutable part of a rule.
#[derive(Debug, Default)]
pub struct RuleCounters {
    matches: AtomicU64,
    actions: AtomicU64,
    errors: AtomicU64,
}

impl RuleCounters {
    pub fn record_match(&self) {
        self.matches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_action(&self) {
        self.actions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn matches(&self) -> u64 {
        self.matches.load(Ordering::Relaxed)
    }

    pub fn actions(&self) -> u64 {
        self.actions.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// EventMonitor flags and its edit/delete tallies.
#[derive(Debug, Default)]
pub struct MonitorState {
    pub watch_edits: bool,
    pub watch_deletes: bool,
    /// Accepted for completeness; the event model has no presence events.
    pub watch_online: bool,
    edit_count: AtomicU64,
    delete_count: AtomicU64,
}

impl MonitorState {
    pub fn new(watch_edits: bool, watch_deletes: bool, watch_online: bool) -> Self {
        Self {
            watch_edits,
            watch_deletes,
            watch_online,
            ..Default::default()
        }
    }

    pub fn record_edit(&self) -> u64 {
        self.edit_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_deletes(&self, n: usize) -> u64 {
        self.delete_count.fetch_add(n as u64, Ordering::Relaxed) + n as u64
    }

    pub fn edit_count(&self) -> u64 {
        self.edit_count.load(Ordering::Relaxed)
    }

    pub fn delete_count(&self) -> u64 {
        self.delete_count.load(Ordering::Relaxed)
    }
}

// ── Rule ────────────────────────────────────────────────────────────

/// Kind-specific configuration of an installed rule.
#[derive(Debug)]
pub enum RuleKind {
    Forward {
        destination: Entity,
        filter: MessageFilter,
    },
    Moderate {
        ban_threshold: f32,
        delete_spam: bool,
    },
    Watch {
        filter: MessageFilter,
    },
    EventMonitor(MonitorState),
    ScheduledReport {
        cadence: Cadence,
        limit: usize,
        prompt: Option<String>,
        extract_entities: bool,
    },
}

impl RuleKind {
    /// Short label for logging and status.
    pub fn label(&self) -> &'static str {
        match self {
            RuleKind::Forward { .. } => "forward",
            RuleKind::Moderate { .. } => "moderate",
            RuleKind::Watch { .. } => "watch",
            RuleKind::EventMonitor(_) => "event_monitor",
            RuleKind::ScheduledReport { .. } => "scheduled_report",
        }
    }
}

/// An installed rule bound to one source.
#[derive(Debug)]
pub struct Rule {
    pub id: RuleId,
    pub source: Entity,
    pub kind: RuleKind,
    pub created_at: DateTime<Utc>,
    pub counters: RuleCounters,
}

impl Rule {
    /// Build a rule from a spec whose identifiers were already resolved.
    pub fn build(
        spec: &RuleSpec,
        source: Entity,
        destination: Option<Entity>,
    ) -> Result<Self, InstallError> {
        let kind = match spec {
            RuleSpec::Forward {
                keywords,
                pattern,
                media_only,
                destination: identifier,
                ..
            } => RuleKind::Forward {
                destination: destination.ok_or_else(|| {
                    InstallError::SourceUnavailable(crate::error::SourceError::Unavailable {
                        identifier: identifier.clone(),
                        reason: "destination not resolved".into(),
                    })
                })?,
                filter: MessageFilter::new(keywords, pattern.as_deref(), *media_only)?,
            },
            RuleSpec::Moderate {
                ban_threshold,
                delete_spam,
                ..
            } => {
                if !(0.0..=1.0).contains(ban_threshold) {
                    return Err(InstallError::InvalidThreshold(*ban_threshold));
                }
                RuleKind::Moderate {
                    ban_threshold: *ban_threshold,
                    delete_spam: *delete_spam,
                }
            }
            RuleSpec::Watch {
                keywords, pattern, ..
            } => RuleKind::Watch {
                filter: MessageFilter::new(keywords, pattern.as_deref(), false)?,
            },
            RuleSpec::EventMonitor {
                watch_edits,
                watch_deletes,
                watch_online,
                ..
            } => RuleKind::EventMonitor(MonitorState::new(
                *watch_edits,
                *watch_deletes,
                *watch_online,
            )),
            RuleSpec::ScheduledReport {
                cadence,
                limit,
                prompt,
                extract_entities,
                ..
            } => {
                if *limit == 0 {
                    return Err(InstallError::InvalidLimit);
                }
                RuleKind::ScheduledReport {
                    cadence: Cadence::from_spec(cadence)?,
                    limit: *limit,
                    prompt: prompt.clone().filter(|p| !p.trim().is_empty()),
                    extract_entities: *extract_entities,
                }
            }
        };

        Ok(Self {
            id: Uuid::new_v4(),
            source,
            kind,
            created_at: Utc::now(),
            counters: RuleCounters::default(),
        })
    }

    /// Whether this rule evaluates events of the given kind.
    ///
    /// New messages go to forward/moderate/watch rules, edits and deletes to
    /// monitors that watch them, and a tick only to the report rule it names.
    pub fn handles(&self, event: &EventKind) -> bool {
        match (event, &self.kind) {
            (
                EventKind::NewMessage(_),
                RuleKind::Forward { .. } | RuleKind::Moderate { .. } | RuleKind::Watch { .. },
            ) => true,
            (EventKind::Edited(_), RuleKind::EventMonitor(state)) => state.watch_edits,
            (EventKind::Deleted { .. }, RuleKind::EventMonitor(state)) => state.watch_deletes,
            (EventKind::Tick { rule_id }, RuleKind::ScheduledReport { .. }) => *rule_id == self.id,
            _ => false,
        }
    }

    /// One-line description for status listings.
    pub fn describe(&self) -> String {
        match &self.kind {
            RuleKind::Forward {
                destination,
                filter,
            } => format!("→ {} ({})", destination.title, filter.describe()),
            RuleKind::Moderate {
                ban_threshold,
                delete_spam,
            } => format!(
                "threshold {:.2}, {}",
                ban_threshold,
                if *delete_spam { "delete spam" } else { "report only" }
            ),
            RuleKind::Watch { filter } => filter.describe(),
            RuleKind::EventMonitor(state) => {
                let mut watched = Vec::new();
                if state.watch_edits {
                    watched.push("edits");
                }
                if state.watch_deletes {
                    watched.push("deletes");
                }
                if state.watch_online {
                    watched.push("online");
                }
                format!(
                    "watching {} ({} edits, {} deletes seen)",
                    watched.join(", "),
                    state.edit_count(),
                    state.delete_count()
                )
            }
            RuleKind::ScheduledReport { cadence, limit, .. } => {
                format!("{} report of last {} messages", cadence, limit)
            }
        }
    }

    pub fn status(&self) -> RuleStatus {
        RuleStatus {
            id: self.id,
            kind: self.kind.label(),
            source: self.source.title.clone(),
            created_at: self.created_at,
            match_count: self.counters.matches(),
            action_count: self.counters.actions(),
            error_count: self.counters.errors(),
            description: self.describe(),
        }
    }
}

/// Point-in-time view of a rule for operators.
#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    pub id: RuleId,
    pub kind: &'static str,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub match_count: u64,
    pub action_count: u64,
    pub error_count: u64,
    pub description: String,
}
