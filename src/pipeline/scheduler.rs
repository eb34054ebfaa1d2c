//! Scheduler bridge: turns report cadences into Tick events.
//!
//! The bridge owns its own schedule table and a ticker task. On every poll
//! it enqueues a `Tick` for each due entry onto the dispatcher's inbound
//! queue and advances that entry. It never runs report bodies and never
//! touches the rule registry or history caches; the dispatcher consumes the
//! tick and does the work in the event-processing context.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Timelike, Utc, Weekday};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ScheduleError;
use crate::pipeline::types::{ChatId, Event, RuleId};

/// Floor for the poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(60);

fn hour() -> chrono::Duration {
    chrono::Duration::hours(1)
}

// ── Cadence ─────────────────────────────────────────────────────────

/// Cadence as written in a rules file: `{"every": "daily", "at": "09:30"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "every", rename_all = "snake_case")]
pub enum CadenceSpec {
    Hourly,
    Daily { at: String },
    Weekly { day: Weekday, at: String },
}

/// Validated cadence. Wall-clock times are UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cadence {
    /// Every 60 minutes from install time.
    Hourly,
    Daily { at: NaiveTime },
    Weekly { day: Weekday, at: NaiveTime },
}

fn parse_time_of_day(value: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| ScheduleError::InvalidTime {
        value: value.to_string(),
    })
}

impl Cadence {
    pub fn from_spec(spec: &CadenceSpec) -> Result<Self, ScheduleError> {
        let cadence = match spec {
            CadenceSpec::Hourly => Cadence::Hourly,
            CadenceSpec::Daily { at } => Cadence::Daily {
                at: parse_time_of_day(at)?,
            },
            CadenceSpec::Weekly { day, at } => Cadence::Weekly {
                day: *day,
                at: parse_time_of_day(at)?,
            },
        };
        // Reject anything the cron parser would refuse later.
        if let Some(expr) = cadence.cron_expr() {
            cron_schedule(&expr)?;
        }
        Ok(cadence)
    }

    /// Cron expression (sec min hour dom month dow) for wall-clock cadences.
    fn cron_expr(&self) -> Option<String> {
        match self {
            Cadence::Hourly => None,
            Cadence::Daily { at } => Some(format!("0 {} {} * * *", at.minute(), at.hour())),
            Cadence::Weekly { day, at } => {
                Some(format!("0 {} {} * * {}", at.minute(), at.hour(), day))
            }
        }
    }

    /// First fire time for an entry installed at `installed_at`.
    pub fn first_fire(&self, installed_at: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match self.cron_expr() {
            None => Ok(installed_at + hour()),
            Some(expr) => next_cron_after(&expr, installed_at),
        }
    }

    /// Next fire time after a fire that was due at `previous`, observed at
    /// `now`. Always strictly after `now`; missed slots are skipped.
    pub fn next_after(
        &self,
        previous: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        match self.cron_expr() {
            None => {
                let mut next = previous + hour();
                while next <= now {
                    next += hour();
                }
                Ok(next)
            }
            Some(expr) => next_cron_after(&expr, now),
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Hourly => write!(f, "hourly"),
            Cadence::Daily { at } => write!(f, "daily at {} UTC", at.format("%H:%M")),
            Cadence::Weekly { day, at } => {
                write!(f, "weekly on {} at {} UTC", day, at.format("%H:%M"))
            }
        }
    }
}

fn cron_schedule(expr: &str) -> Result<cron::Schedule, ScheduleError> {
    cron::Schedule::from_str(expr).map_err(|e| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

fn next_cron_after(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    cron_schedule(expr)?
        .after(&after)
        .next()
        .ok_or_else(|| ScheduleError::InvalidCron {
            expr: expr.to_string(),
            reason: "no upcoming fire time".into(),
        })
}

// ── Schedule table ──────────────────────────────────────────────────

/// One scheduled report. `next_fire` is strictly after the last poll that
/// fired it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub rule_id: RuleId,
    pub source_id: ChatId,
    pub cadence: Cadence,
    pub next_fire: DateTime<Utc>,
}

/// Timer side of the scheduler: schedule table plus the tick producer.
pub struct SchedulerBridge {
    entries: Mutex<Vec<ScheduleEntry>>,
    tx: mpsc::UnboundedSender<Event>,
    poll_interval: Duration,
}

impl SchedulerBridge {
    /// Create a bridge feeding `tx`. Poll intervals below 60s are raised.
    pub fn new(tx: mpsc::UnboundedSender<Event>, poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            tx,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Add an entry for a freshly installed report rule.
    pub async fn add(
        &self,
        rule_id: RuleId,
        source_id: ChatId,
        cadence: Cadence,
        installed_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let next_fire = cadence.first_fire(installed_at)?;
        debug!(%rule_id, %next_fire, %cadence, "Schedule entry added");
        self.entries.lock().await.push(ScheduleEntry {
            rule_id,
            source_id,
            cadence,
            next_fire,
        });
        Ok(next_fire)
    }

    pub async fn remove(&self, rule_id: RuleId) -> bool {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.rule_id != rule_id);
        entries.len() != before
    }

    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        entries.clear();
        count
    }

    pub async fn entries(&self) -> Vec<ScheduleEntry> {
        self.entries.lock().await.clone()
    }

    /// Fire every entry that is due at `now`. Returns the number of ticks
    /// enqueued.
    ///
    /// A failed next-time computation is logged and the entry retried on the
    /// next poll; it never stops the remaining entries.
    pub async fn poll(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().await;
        let mut fired = 0;

        for entry in entries.iter_mut().filter(|e| now > e.next_fire) {
            if self
                .tx
                .send(Event::tick(entry.source_id, entry.rule_id, now))
                .is_err()
            {
                error!(rule_id = %entry.rule_id, "{}", ScheduleError::QueueClosed);
                break;
            }
            fired += 1;

            match entry.cadence.next_after(entry.next_fire, now) {
                Ok(next) => entry.next_fire = next,
                Err(e) => {
                    warn!(rule_id = %entry.rule_id, error = %e, "Schedule misfire, retrying next poll");
                    entry.next_fire = now;
                }
            }
            debug!(rule_id = %entry.rule_id, next_fire = %entry.next_fire, "Tick enqueued");
        }

        fired
    }
}

/// Spawn the ticker task. A panic inside one poll is logged and polling
/// resumes; the task only ends with the runtime.
pub fn spawn_ticker(bridge: Arc<SchedulerBridge>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(bridge.poll_interval());
        // Skip immediate first tick
        ticker.tick().await;
        info!(
            interval_secs = bridge.poll_interval().as_secs(),
            "Scheduler ticker started"
        );

        loop {
            ticker.tick().await;
            match AssertUnwindSafe(bridge.poll(Utc::now())).catch_unwind().await {
                Ok(0) => {}
                Ok(fired) => debug!(fired, "Scheduler poll fired ticks"),
                Err(_) => error!("Scheduler poll panicked, resuming"),
            }
        }
    })
}
