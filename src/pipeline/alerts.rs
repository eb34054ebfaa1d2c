//! Operator-facing alert text and the chunked sender.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ActionError;
use crate::pipeline::traits::ActionSink;
use crate::pipeline::types::{ChatId, ChatMessage, ClassificationResult, SendOptions};

/// Longest part sent in one message, in chars.
pub const DEFAULT_ALERT_CAP: usize = 4000;

/// Smallest pause between consecutive parts.
pub const MIN_PART_GAP: Duration = Duration::from_millis(500);

/// How long alerts are split and paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertConfig {
    pub cap: usize,
    pub part_gap: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cap: DEFAULT_ALERT_CAP,
            part_gap: MIN_PART_GAP,
        }
    }
}

/// Split `content` into parts of at most `cap` chars.
///
/// Parts end on line boundaries and keep their newlines, so joining them
/// gives back `content` exactly. A single line longer than `cap` is the one
/// case that gets cut mid-line, at char boundaries.
pub fn split_into_parts(content: &str, cap: usize) -> Vec<String> {
    let cap = cap.max(1);
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in content.split_inclusive('\n') {
        let line_len = line.chars().count();

        if current_len + line_len <= cap {
            current.push_str(line);
            current_len += line_len;
            continue;
        }

        if !current.is_empty() {
            parts.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if line_len <= cap {
            current.push_str(line);
            current_len = line_len;
            continue;
        }

        // Oversized line: emit full slices, carry the remainder.
        let chars: Vec<char> = line.chars().collect();
        let mut pieces = chars.chunks(cap).peekable();
        while let Some(piece) = pieces.next() {
            let piece: String = piece.iter().collect();
            if pieces.peek().is_some() {
                parts.push(piece);
            } else {
                current_len = piece.chars().count();
                current = piece;
            }
        }
    }

    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn part_header(index: usize, total: usize) -> String {
    format!("📄 *Part {}/{}*\n\n", index, total)
}

/// Split `content` so each sent message, "Part i/N" header included, stays
/// within `cap` chars. Headers longer than `cap` cannot be honoured.
pub fn split_for_sending(content: &str, cap: usize) -> Vec<String> {
    let mut parts = split_into_parts(content, cap);
    let mut total = parts.len();
    // The header widens with the part count, so re-split until it settles.
    while total > 1 {
        let header_len = part_header(total, total).chars().count();
        parts = split_into_parts(content, cap.saturating_sub(header_len));
        if parts.len() == total {
            break;
        }
        total = parts.len();
    }
    parts
}

/// Send `content` to `target`, split per `config`.
///
/// Parts go out in order with `config.part_gap` between them; a "Part i/N"
/// header is added only when there is more than one. Stops at the first
/// failed part. Returns the number of parts sent.
pub async fn send_chunked(
    sink: &dyn ActionSink,
    target: ChatId,
    content: &str,
    options: SendOptions,
    config: &AlertConfig,
) -> Result<usize, ActionError> {
    let parts = split_for_sending(content, config.cap);
    let total = parts.len();

    for (i, part) in parts.iter().enumerate() {
        if i > 0 && !config.part_gap.is_zero() {
            tokio::time::sleep(config.part_gap).await;
        }
        if total > 1 {
            let text = format!("{}{}", part_header(i + 1, total), part);
            sink.send(target, &text, options).await?;
        } else {
            sink.send(target, part, options).await?;
        }
    }

    Ok(total)
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M").to_string()
}

// ── Alert bodies ────────────────────────────────────────────────────

/// Keyword watch alert.
pub fn watch_alert(
    source: &str,
    message: &ChatMessage,
    matched_keywords: &[&str],
    assessment: &str,
) -> String {
    let mut alert = String::from("🚨 *WATCH ALERT*\n");
    alert.push_str(&format!("*Source:* {}\n", source));
    alert.push_str(&format!("*Time:* {}\n", timestamp(message.date)));
    alert.push_str(&format!("*From:* {}\n", message.sender.display_name()));
    if !matched_keywords.is_empty() {
        alert.push_str(&format!(
            "*Keyword Match:* {}\n",
            matched_keywords.join(", ")
        ));
    }
    alert.push_str(&format!("\n*Message:*\n{}\n\n", message.text_or_empty()));
    alert.push_str(&format!("*Assessment:*\n{}", assessment));
    alert
}

/// Edit notice. The ordinal is shown from the second edit on.
pub fn edit_alert(source: &str, message: &ChatMessage, ordinal: u64, at: DateTime<Utc>) -> String {
    let mut alert = String::from("✏️ *MESSAGE EDITED*");
    if ordinal > 1 {
        alert.push_str(&format!(" (Edit #{})", ordinal));
    }
    alert.push('\n');
    alert.push_str(&format!("*Source:* {}\n", source));
    alert.push_str(&format!("*Time:* {}\n", timestamp(at)));
    alert.push_str(&format!("*Message ID:* {}\n", message.id));
    alert.push_str(&format!("*From:* {}\n", message.sender.display_name()));
    match message.text.as_deref() {
        Some(text) if !text.is_empty() => {
            alert.push_str(&format!("\n*New text:*\n{}", text));
        }
        _ => alert.push_str("\n(no text)"),
    }
    alert
}

/// Deletion notice. Deleted content is never available, only ids.
pub fn delete_alert(source: &str, message_ids: &[i64], at: DateTime<Utc>) -> String {
    let ids: Vec<String> = message_ids.iter().map(|id| id.to_string()).collect();
    format!(
        "🗑️ *MESSAGES DELETED*\n*Source:* {}\n*Time:* {}\n*Count:* {}\n*Message IDs:* {}",
        source,
        timestamp(at),
        message_ids.len(),
        ids.join(", ")
    )
}

/// Audit notice sent after a spam message was deleted.
pub fn moderation_audit(
    source: &str,
    message: &ChatMessage,
    verdict: &ClassificationResult,
) -> String {
    let mut alert = String::from("🛡️ *SPAM REMOVED*\n");
    alert.push_str(&format!("*Source:* {}\n", source));
    alert.push_str(&format!("*Time:* {}\n", timestamp(message.date)));
    alert.push_str(&format!("*From:* {}", message.sender.display_name()));
    if let Some(id) = message.sender.id() {
        alert.push_str(&format!(" ({})", id));
    }
    alert.push('\n');
    alert.push_str(&format!(
        "*Confidence:* {:.0}%\n",
        verdict.confidence * 100.0
    ));
    if !verdict.reason.is_empty() {
        alert.push_str(&format!("*Reason:* {}\n", verdict.reason));
    }
    alert.push_str(&format!("\n*Message:*\n{}", message.text_or_empty()));
    alert
}
