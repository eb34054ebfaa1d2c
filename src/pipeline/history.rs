//! In-memory edit and deletion history.
//!
//! Nothing here is persisted. Edit history is bounded per message and in
//! the number of tracked messages; the deletion log keeps a fixed window.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::pipeline::types::ChatId;

/// Deletion records kept for status queries.
pub const DELETION_LOG_CAPACITY: usize = 1000;

/// Bounds for [`EditHistory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    pub max_edits_per_message: usize,
    pub max_tracked_messages: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            max_edits_per_message: 50,
            max_tracked_messages: 10_000,
        }
    }
}

/// One observed edit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditRecord {
    pub timestamp: DateTime<Utc>,
    pub text: Option<String>,
}

#[derive(Debug, Default)]
struct MessageEdits {
    entries: VecDeque<EditRecord>,
    /// Edits ever seen for this message, including evicted ones.
    total: u64,
    /// Value of the global sequence at the last append.
    last_touched: u64,
}

#[derive(Debug, Default)]
struct EditState {
    messages: HashMap<(ChatId, i64), MessageEdits>,
    sequence: u64,
}

/// Per-message edit history keyed by `(source, message id)`.
#[derive(Debug)]
pub struct EditHistory {
    state: Mutex<EditState>,
    limits: HistoryLimits,
}

impl EditHistory {
    pub fn new(limits: HistoryLimits) -> Self {
        Self {
            state: Mutex::new(EditState::default()),
            limits: HistoryLimits {
                max_edits_per_message: limits.max_edits_per_message.max(1),
                max_tracked_messages: limits.max_tracked_messages.max(1),
            },
        }
    }

    /// Append an edit and return its ordinal (1 for the first edit seen).
    ///
    /// The ordinal counts every edit of the message, so it keeps growing
    /// after old entries are dropped.
    pub async fn append(
        &self,
        source_id: ChatId,
        message_id: i64,
        timestamp: DateTime<Utc>,
        text: Option<String>,
    ) -> u64 {
        let mut state = self.state.lock().await;
        state.sequence += 1;
        let sequence = state.sequence;
        let key = (source_id, message_id);

        if !state.messages.contains_key(&key)
            && state.messages.len() >= self.limits.max_tracked_messages
        {
            evict_least_recent(&mut state.messages);
        }

        let edits = state.messages.entry(key).or_default();
        edits.entries.push_back(EditRecord { timestamp, text });
        while edits.entries.len() > self.limits.max_edits_per_message {
            edits.entries.pop_front();
        }
        edits.total += 1;
        edits.last_touched = sequence;
        edits.total
    }

    /// Retained edits for a message, oldest first.
    pub async fn entries(&self, source_id: ChatId, message_id: i64) -> Vec<EditRecord> {
        self.state
            .lock()
            .await
            .messages
            .get(&(source_id, message_id))
            .map(|m| m.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self, source_id: ChatId, message_id: i64) -> usize {
        self.state
            .lock()
            .await
            .messages
            .get(&(source_id, message_id))
            .map_or(0, |m| m.entries.len())
    }

    /// Number of messages with history.
    pub async fn tracked(&self) -> usize {
        self.state.lock().await.messages.len()
    }
}

fn evict_least_recent(messages: &mut HashMap<(ChatId, i64), MessageEdits>) {
    let oldest = messages
        .iter()
        .min_by_key(|(_, m)| m.last_touched)
        .map(|(key, _)| *key);
    if let Some(key) = oldest {
        messages.remove(&key);
        debug!(source_id = key.0, message_id = key.1, "Evicted edit history");
    }
}

/// One deletion event as reported by the source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletionRecord {
    pub source_id: ChatId,
    pub message_ids: Vec<i64>,
    pub timestamp: DateTime<Utc>,
}

/// Sliding window of recent deletions.
#[derive(Debug, Default)]
pub struct DeletionLog {
    records: Mutex<VecDeque<DeletionRecord>>,
}

impl DeletionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, record: DeletionRecord) {
        let mut records = self.records.lock().await;
        if records.len() == DELETION_LOG_CAPACITY {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Up to `limit` most recent records, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<DeletionRecord> {
        self.records
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}
