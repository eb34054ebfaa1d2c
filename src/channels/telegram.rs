//! Telegram transport: long-polls the Bot API for updates and performs
//! send/forward/delete through it.
//!
//! The Bot API has no history endpoint and never reports deletions, so
//! `iterate_history` is served from a bounded buffer of messages the poller
//! has already seen, and no `Deleted` events are produced.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{ActionError, SourceError};
use crate::pipeline::traits::{ActionSink, EventStream, Source};
use crate::pipeline::types::{
    ChatId, ChatMessage, Entity, EntityKind, Event, EventKind, ParseMode, SendOptions, Sender,
};

const API_BASE: &str = "https://api.telegram.org";

/// Long-poll timeout passed to getUpdates, in seconds.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Pause after a failed poll.
const POLL_BACKOFF: Duration = Duration::from_secs(5);

const ALLOWED_UPDATES: [&str; 4] = [
    "message",
    "edited_message",
    "channel_post",
    "edited_channel_post",
];

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    edited_message: Option<TgMessage>,
    #[serde(default)]
    channel_post: Option<TgMessage>,
    #[serde(default)]
    edited_channel_post: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
}

impl TgChat {
    fn into_entity(self) -> Entity {
        let title = self
            .title
            .or_else(|| self.username.map(|u| format!("@{u}")))
            .or(self.first_name)
            .unwrap_or_else(|| self.id.to_string());
        Entity {
            id: self.id,
            title,
            kind: EntityKind::from_tag(&self.kind),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    chat: TgChat,
    #[serde(default)]
    from: Option<TgUser>,
    date: i64,
    #[serde(default)]
    edit_date: Option<i64>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(flatten)]
    rest: HashMap<String, serde_json::Value>,
}

/// Message fields that mean the message carries media.
const MEDIA_FIELDS: [&str; 8] = [
    "photo",
    "video",
    "document",
    "audio",
    "voice",
    "animation",
    "sticker",
    "video_note",
];

fn unix_time(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

impl TgMessage {
    fn has_media(&self) -> bool {
        MEDIA_FIELDS.iter().any(|f| self.rest.contains_key(*f))
    }

    fn into_chat_message(self) -> ChatMessage {
        let has_media = self.has_media();
        let sender = match self.from {
            Some(user) => Sender::Present {
                id: user.id,
                username: user.username,
                first_name: user.first_name,
                is_bot: user.is_bot,
            },
            None => Sender::Absent,
        };
        ChatMessage {
            id: self.message_id,
            chat_id: self.chat.id,
            sender,
            text: self.text.or(self.caption),
            has_media,
            date: unix_time(self.date),
        }
    }
}

/// Convert one update into a pipeline event, if it carries one we use.
fn parse_update(update: Update) -> Option<Event> {
    if let Some(msg) = update.message.or(update.channel_post) {
        return Some(Event::new_message(msg.into_chat_message()));
    }
    if let Some(msg) = update.edited_message.or(update.edited_channel_post) {
        let edited_at = msg.edit_date.map(unix_time).unwrap_or_else(Utc::now);
        return Some(Event::edited(msg.into_chat_message(), edited_at));
    }
    None
}

/// Normalize a user-supplied chat identifier into a getChat `chat_id`.
///
/// Accepts numeric ids, `@name`, bare `name`, and `t.me/name` links.
fn chat_id_param(identifier: &str) -> serde_json::Value {
    let trimmed = identifier.trim();
    if let Ok(id) = trimmed.parse::<i64>() {
        return serde_json::json!(id);
    }
    let name = trimmed
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("t.me/")
        .trim_start_matches('@')
        .trim_end_matches('/');
    serde_json::json!(format!("@{name}"))
}

// ── Recent-message buffer ───────────────────────────────────────────

/// Per-chat ring of messages the poller has seen, oldest first.
#[derive(Debug)]
struct RecentMessages {
    chats: HashMap<ChatId, VecDeque<ChatMessage>>,
    capacity: usize,
}

impl RecentMessages {
    fn new(capacity: usize) -> Self {
        Self {
            chats: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn observe(&mut self, event: &Event) {
        match &event.kind {
            EventKind::NewMessage(msg) => {
                let buffer = self.chats.entry(msg.chat_id).or_default();
                if buffer.len() == self.capacity {
                    buffer.pop_front();
                }
                buffer.push_back(msg.clone());
            }
            EventKind::Edited(msg) => {
                if let Some(stored) = self
                    .chats
                    .get_mut(&msg.chat_id)
                    .and_then(|b| b.iter_mut().find(|m| m.id == msg.id))
                {
                    stored.text = msg.text.clone();
                }
            }
            _ => {}
        }
    }

    /// Newest first.
    fn recent(&self, chat_id: ChatId, limit: usize) -> Vec<ChatMessage> {
        self.chats
            .get(&chat_id)
            .map(|b| b.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }
}

// ── Bot ─────────────────────────────────────────────────────────────

/// Telegram Bot API client acting as both event source and action sink.
pub struct TelegramBot {
    bot_token: SecretString,
    client: reqwest::Client,
    recent: Arc<Mutex<RecentMessages>>,
}

impl TelegramBot {
    /// `history_capacity` bounds the per-chat buffer behind `iterate_history`.
    pub fn new(bot_token: SecretString, history_capacity: usize) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
            recent: Arc::new(Mutex::new(RecentMessages::new(history_capacity))),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.bot_token.expose_secret())
    }

    /// POST a Bot API method and return its `result`.
    async fn call(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| e.without_url().to_string())?;
        let status = resp.status();
        let data: ApiResponse<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| format!("{method} returned {status}: {}", e.without_url()))?;
        if !data.ok {
            return Err(data
                .description
                .unwrap_or_else(|| format!("{method} returned {status}")));
        }
        Ok(data.result.unwrap_or(serde_json::Value::Null))
    }

    /// Send one message, trying the requested parse mode first with a plain
    /// text fallback.
    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        options: SendOptions,
    ) -> Result<(), String> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": options.disable_preview,
        });

        let parse_mode = match options.parse_mode {
            ParseMode::Plain => return self.call("sendMessage", &body).await.map(|_| ()),
            ParseMode::Markdown => "Markdown",
            ParseMode::Html => "HTML",
        };

        body["parse_mode"] = serde_json::Value::String(parse_mode.into());
        let formatted_err = match self.call("sendMessage", &body).await {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };
        tracing::warn!(
            chat_id,
            parse_mode,
            error = %formatted_err,
            "Telegram sendMessage with formatting failed; retrying without parse_mode"
        );

        if let Some(obj) = body.as_object_mut() {
            obj.remove("parse_mode");
        }
        self.call("sendMessage", &body)
            .await
            .map(|_| ())
            .map_err(|plain_err| {
                format!("{parse_mode}: {formatted_err}, plain: {plain_err}")
            })
    }
}

// ── Source ──────────────────────────────────────────────────────────

#[async_trait]
impl Source for TelegramBot {
    async fn get_entity(&self, identifier: &str) -> Result<Entity, SourceError> {
        let body = serde_json::json!({ "chat_id": chat_id_param(identifier) });
        let result = self
            .call("getChat", &body)
            .await
            .map_err(|reason| SourceError::Unavailable {
                identifier: identifier.to_string(),
                reason,
            })?;
        let chat: TgChat =
            serde_json::from_value(result).map_err(|e| SourceError::Unavailable {
                identifier: identifier.to_string(),
                reason: format!("unexpected getChat result: {e}"),
            })?;
        Ok(chat.into_entity())
    }

    async fn iterate_history(
        &self,
        source: ChatId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, SourceError> {
        Ok(self.recent.lock().await.recent(source, limit))
    }

    async fn subscribe(&self) -> Result<EventStream, SourceError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = self.api_url("getUpdates");
        let client = self.client.clone();
        let recent = Arc::clone(&self.recent);

        tokio::spawn(async move {
            let mut offset: i64 = 0;
            tracing::info!("Telegram listener polling for updates...");

            loop {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ALLOWED_UPDATES,
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {}", e.without_url());
                        tokio::time::sleep(POLL_BACKOFF).await;
                        continue;
                    }
                };

                let data: ApiResponse<Vec<serde_json::Value>> = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {}", e.without_url());
                        tokio::time::sleep(POLL_BACKOFF).await;
                        continue;
                    }
                };

                if !data.ok {
                    tracing::warn!(
                        "Telegram getUpdates rejected: {}",
                        data.description.as_deref().unwrap_or("no description")
                    );
                    tokio::time::sleep(POLL_BACKOFF).await;
                    continue;
                }

                for raw in data.result.unwrap_or_default() {
                    // Advance offset past this update even if we can't use it
                    if let Some(uid) = raw.get("update_id").and_then(serde_json::Value::as_i64) {
                        offset = uid + 1;
                    }

                    let update: Update = match serde_json::from_value(raw) {
                        Ok(u) => u,
                        Err(e) => {
                            tracing::debug!("Skipping unrecognized update: {e}");
                            continue;
                        }
                    };
                    offset = offset.max(update.update_id + 1);

                    let Some(event) = parse_update(update) else {
                        continue;
                    };
                    recent.lock().await.observe(&event);

                    if tx.send(event).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

// ── ActionSink ──────────────────────────────────────────────────────

#[async_trait]
impl ActionSink for TelegramBot {
    async fn send(
        &self,
        target: ChatId,
        text: &str,
        options: SendOptions,
    ) -> Result<(), ActionError> {
        self.send_message(target, text, options)
            .await
            .map_err(|reason| ActionError::SendFailed {
                target: target.to_string(),
                reason,
            })
    }

    async fn forward(
        &self,
        destination: ChatId,
        original: &ChatMessage,
    ) -> Result<(), ActionError> {
        let body = serde_json::json!({
            "chat_id": destination,
            "from_chat_id": original.chat_id,
            "message_id": original.id,
        });
        self.call("forwardMessage", &body)
            .await
            .map(|_| ())
            .map_err(|reason| ActionError::ForwardFailed {
                destination: destination.to_string(),
                reason,
            })
    }

    async fn delete(&self, target: ChatId, message_ids: &[i64]) -> Result<(), ActionError> {
        let (method, body) = match message_ids {
            [] => return Ok(()),
            [id] => (
                "deleteMessage",
                serde_json::json!({ "chat_id": target, "message_id": id }),
            ),
            ids => (
                "deleteMessages",
                serde_json::json!({ "chat_id": target, "message_ids": ids }),
            ),
        };
        self.call(method, &body)
            .await
            .map(|_| ())
            .map_err(|reason| ActionError::DeleteFailed {
                target: target.to_string(),
                reason,
            })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
