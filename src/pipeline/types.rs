//! Shared types for the event pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Chat identifier as used by the transport (users, groups, channels).
pub type ChatId = i64;

/// Process-wide unique rule identifier.
pub type RuleId = Uuid;

// ── Sender ──────────────────────────────────────────────────────────

/// Who sent a message, if the transport knows.
///
/// Channel posts and anonymous admins carry no sender at all, so absence is
/// a first-class variant rather than a bag of optional fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Sender {
    Present {
        id: i64,
        username: Option<String>,
        first_name: Option<String>,
        is_bot: bool,
    },
    Absent,
}

impl Sender {
    /// Human-readable name for alerts and history dumps.
    pub fn display_name(&self) -> &str {
        match self {
            Sender::Present {
                first_name: Some(name),
                ..
            } => name,
            Sender::Present {
                username: Some(name),
                ..
            } => name,
            _ => "Unknown",
        }
    }

    pub fn id(&self) -> Option<i64> {
        match self {
            Sender::Present { id, .. } => Some(*id),
            Sender::Absent => None,
        }
    }
}

// ── Messages & events ───────────────────────────────────────────────

/// A chat message as delivered by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message id, unique within its chat.
    pub id: i64,
    /// Chat the message lives in.
    pub chat_id: ChatId,
    pub sender: Sender,
    pub text: Option<String>,
    pub has_media: bool,
    pub date: DateTime<Utc>,
}

impl ChatMessage {
    /// Text content, or the empty string for media-only messages.
    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    /// `[YYYY-mm-dd HH:MM] sender: text` line used in history dumps.
    pub fn log_line(&self) -> Option<String> {
        let text = self.text.as_deref().filter(|t| !t.is_empty())?;
        Some(format!(
            "[{}] {}: {}",
            self.date.format("%Y-%m-%d %H:%M"),
            self.sender.display_name(),
            text
        ))
    }
}

/// One inbound event. Source events and scheduler ticks share this type so
/// they can travel through the same queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub source_id: ChatId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    NewMessage(ChatMessage),
    Edited(ChatMessage),
    /// Only ids: the transport never hands back prior content.
    Deleted { message_ids: Vec<i64> },
    /// Synthetic event from the scheduler for one report rule.
    Tick { rule_id: RuleId },
}

impl Event {
    pub fn new_message(message: ChatMessage) -> Self {
        Self {
            source_id: message.chat_id,
            timestamp: message.date,
            kind: EventKind::NewMessage(message),
        }
    }

    pub fn edited(message: ChatMessage, edited_at: DateTime<Utc>) -> Self {
        Self {
            source_id: message.chat_id,
            timestamp: edited_at,
            kind: EventKind::Edited(message),
        }
    }

    pub fn deleted(source_id: ChatId, message_ids: Vec<i64>, at: DateTime<Utc>) -> Self {
        Self {
            source_id,
            timestamp: at,
            kind: EventKind::Deleted { message_ids },
        }
    }

    pub fn tick(source_id: ChatId, rule_id: RuleId, at: DateTime<Utc>) -> Self {
        Self {
            source_id,
            timestamp: at,
            kind: EventKind::Tick { rule_id },
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self.kind {
            EventKind::NewMessage(_) => "new_message",
            EventKind::Edited(_) => "edited",
            EventKind::Deleted { .. } => "deleted",
            EventKind::Tick { .. } => "tick",
        }
    }
}

// ── Entities ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Private,
    Group,
    Supergroup,
    Channel,
    Other,
}

impl EntityKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "private" => Self::Private,
            "group" => Self::Group,
            "supergroup" => Self::Supergroup,
            "channel" => Self::Channel,
            _ => Self::Other,
        }
    }
}

/// A resolved chat entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: ChatId,
    pub title: String,
    pub kind: EntityKind,
}

// ── Outbound formatting ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    #[default]
    Plain,
    Markdown,
    Html,
}

/// Formatting options for `ActionSink::send`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub parse_mode: ParseMode,
    pub disable_preview: bool,
}

impl SendOptions {
    pub fn markdown() -> Self {
        Self {
            parse_mode: ParseMode::Markdown,
            disable_preview: true,
        }
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Spam verdict from the content analyzer. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub is_spam: bool,
    pub confidence: f32,
    #[serde(default)]
    pub reason: String,
}

impl ClassificationResult {
    /// Verdict used when classification fails: never spam.
    pub fn not_spam(reason: impl Into<String>) -> Self {
        Self {
            is_spam: false,
            confidence: 0.0,
            reason: reason.into(),
        }
    }
}
