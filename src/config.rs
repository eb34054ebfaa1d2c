//! Configuration types.
//!
//! Everything comes from environment variables; see [`AppConfig::from_env`].

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::pipeline::alerts::{AlertConfig, DEFAULT_ALERT_CAP, MIN_PART_GAP};
use crate::pipeline::history::HistoryLimits;
use crate::pipeline::rules::RuleSpec;
use crate::pipeline::scheduler::MIN_POLL_INTERVAL;

/// Messages per chat kept by the transport for history reports.
pub const DEFAULT_HISTORY_BUFFER: usize = 200;

/// Process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub telegram_token: SecretString,
    /// Chat id or `@username` receiving alerts, audits and reports.
    pub operator_chat: String,
    pub llm: LlmConfig,
    /// JSON array of rule specs installed at startup.
    pub rules_file: Option<PathBuf>,
    /// Scheduler poll interval, never below one minute.
    pub poll_interval: Duration,
    pub alerts: AlertConfig,
    pub history: HistoryLimits,
    pub history_buffer: usize,
    /// Enables daily-rolling file logs next to stderr.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` for every variable. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.into()));

        let telegram_token = SecretString::from(require("TELEGRAM_BOT_TOKEN")?);
        let operator_chat = require("CHATWATCH_OPERATOR_CHAT")?;

        let backend = match get("CHATWATCH_LLM_BACKEND") {
            Some(value) => LlmBackend::from_str(&value).map_err(|message| {
                ConfigError::InvalidValue {
                    key: "CHATWATCH_LLM_BACKEND".into(),
                    message,
                }
            })?,
            // Fall back to whichever key is present.
            None if get("ANTHROPIC_API_KEY").is_none() && get("OPENAI_API_KEY").is_some() => {
                LlmBackend::OpenAi
            }
            None => LlmBackend::Anthropic,
        };
        let key_var = match backend {
            LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
            LlmBackend::OpenAi => "OPENAI_API_KEY",
        };
        let llm = LlmConfig {
            backend,
            api_key: SecretString::from(require(key_var)?),
            model: get("CHATWATCH_MODEL").unwrap_or_else(|| backend.default_model().to_string()),
        };

        let poll_secs: u64 = parse_or(&get, "CHATWATCH_POLL_SECS", MIN_POLL_INTERVAL.as_secs())?;
        let part_gap_ms: u64 =
            parse_or(&get, "CHATWATCH_PART_GAP_MS", MIN_PART_GAP.as_millis() as u64)?;
        let alert_cap: usize = parse_or(&get, "CHATWATCH_ALERT_CAP", DEFAULT_ALERT_CAP)?;
        if alert_cap == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHATWATCH_ALERT_CAP".into(),
                message: "must be at least 1".into(),
            });
        }

        let defaults = HistoryLimits::default();
        let history = HistoryLimits {
            max_edits_per_message: parse_or(
                &get,
                "CHATWATCH_MAX_EDITS_PER_MESSAGE",
                defaults.max_edits_per_message,
            )?,
            max_tracked_messages: parse_or(
                &get,
                "CHATWATCH_MAX_TRACKED_MESSAGES",
                defaults.max_tracked_messages,
            )?,
        };

        Ok(Self {
            telegram_token,
            operator_chat,
            llm,
            rules_file: get("CHATWATCH_RULES_FILE").map(PathBuf::from),
            poll_interval: Duration::from_secs(poll_secs).max(MIN_POLL_INTERVAL),
            alerts: AlertConfig {
                cap: alert_cap,
                part_gap: Duration::from_millis(part_gap_ms).max(MIN_PART_GAP),
            },
            history,
            history_buffer: parse_or(&get, "CHATWATCH_HISTORY_BUFFER", DEFAULT_HISTORY_BUFFER)?,
            log_dir: get("CHATWATCH_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}

/// Read a rules file: a JSON array of rule specs tagged by `"kind"`.
pub fn load_rules(path: &Path) -> Result<Vec<RuleSpec>, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::RulesFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}
