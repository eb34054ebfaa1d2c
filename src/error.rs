//! Error types for chatwatch.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Install error: {0}")]
    Install(#[from] InstallError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    #[error("Analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Need at least {needed} usable sources, got {got}")]
    NotEnoughSources { needed: usize, got: usize },
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse rules file {path}: {reason}")]
    RulesFile { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the upstream chat source.
///
/// `Unavailable` is the install-time failure: it aborts that one install
/// call and nothing else.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Source {identifier} unavailable: {reason}")]
    Unavailable { identifier: String, reason: String },

    #[error("History fetch for source {source_id} failed: {reason}")]
    History { source_id: i64, reason: String },

    #[error("No messages found in {title}")]
    EmptyHistory { title: String },

    #[error("Event stream failed: {0}")]
    Stream(String),
}

/// Transient failures of send/forward/delete primitives.
///
/// Always non-fatal to the rule that triggered the action.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Send to {target} failed: {reason}")]
    SendFailed { target: String, reason: String },

    #[error("Forward to {destination} failed: {reason}")]
    ForwardFailed { destination: String, reason: String },

    #[error("Delete in {target} failed: {reason}")]
    DeleteFailed { target: String, reason: String },
}

/// Content analyzer failures (classification and summarization).
#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} returned empty content")]
    EmptyResponse { provider: String },
}

/// Schedule computation failures.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid time of day '{value}': expected HH:MM")]
    InvalidTime { value: String },

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Tick queue closed")]
    QueueClosed,
}

/// Failures of a single install call.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error(transparent)]
    SourceUnavailable(#[from] SourceError),

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Ban threshold must be within [0, 1], got {0}")]
    InvalidThreshold(f32),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),

    #[error("Report limit must be at least 1")]
    InvalidLimit,
}

/// Failure of one rule evaluation. Contained to that evaluation.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Evaluation panicked: {0}")]
    Panicked(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
