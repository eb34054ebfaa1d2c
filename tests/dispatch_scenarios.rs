//! End-to-end dispatch scenarios.
//!
//! Each test wires a real `Dispatcher` to in-memory doubles of the source,
//! the action sink and the content analyzer, then checks which side effects
//! a sequence of events produces.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;
use tokio::time::timeout;

use chatwatch::error::{ActionError, AnalyzerError, InstallError, SourceError};
use chatwatch::pipeline::alerts::AlertConfig;
use chatwatch::pipeline::dispatcher::{DispatchReport, Dispatcher, DispatcherConfig};
use chatwatch::pipeline::history::HistoryLimits;
use chatwatch::pipeline::rules::{RuleSpec, RuleStatus};
use chatwatch::pipeline::scheduler::{CadenceSpec, SchedulerBridge};
use chatwatch::pipeline::traits::{ActionSink, ContentAnalyzer, EventStream, Source};
use chatwatch::pipeline::types::{
    ChatId, ChatMessage, ClassificationResult, Entity, EntityKind, Event, EventKind, RuleId,
    SendOptions, Sender,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const ALPHA: ChatId = -100;
const BETA: ChatId = -200;
const UNWATCHED: ChatId = -300;
const OPERATOR: ChatId = 999;

// ── Doubles ─────────────────────────────────────────────────────────

/// Source with a fixed directory of chats and canned history.
struct StubSource {
    entities: HashMap<String, Entity>,
    history: HashMap<ChatId, Vec<ChatMessage>>,
}

impl StubSource {
    fn new() -> Self {
        let mut entities = HashMap::new();
        for (identifier, id, title) in [("@alpha", ALPHA, "Alpha"), ("@beta", BETA, "Beta")] {
            entities.insert(
                identifier.to_string(),
                Entity {
                    id,
                    title: title.to_string(),
                    kind: EntityKind::Supergroup,
                },
            );
        }
        let mut history = HashMap::new();
        history.insert(
            ALPHA,
            vec![
                message(ALPHA, 2, Some("release shipped")),
                message(ALPHA, 1, Some("release tomorrow")),
            ],
        );
        Self { entities, history }
    }
}

#[async_trait]
impl Source for StubSource {
    async fn get_entity(&self, identifier: &str) -> Result<Entity, SourceError> {
        self.entities
            .get(identifier)
            .cloned()
            .ok_or_else(|| SourceError::Unavailable {
                identifier: identifier.to_string(),
                reason: "chat not found".into(),
            })
    }

    async fn iterate_history(
        &self,
        source: ChatId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, SourceError> {
        Ok(self
            .history
            .get(&source)
            .map(|h| h.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn subscribe(&self) -> Result<EventStream, SourceError> {
        Ok(Box::pin(futures::stream::empty()))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SinkCall {
    Send { target: ChatId, text: String },
    Forward { destination: ChatId, message_id: i64 },
    Delete { target: ChatId, message_ids: Vec<i64> },
}

#[derive(Default)]
struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    fail_forward: bool,
}

impl RecordingSink {
    fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    fn forwards(&self) -> Vec<(ChatId, i64)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Forward {
                    destination,
                    message_id,
                } => Some((destination, message_id)),
                _ => None,
            })
            .collect()
    }

    fn deletes(&self) -> Vec<(ChatId, Vec<i64>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Delete {
                    target,
                    message_ids,
                } => Some((target, message_ids)),
                _ => None,
            })
            .collect()
    }

    fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Send { target, text } => {
                    assert_eq!(target, OPERATOR, "alerts go to the operator chat");
                    Some(text)
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ActionSink for RecordingSink {
    async fn send(&self, target: ChatId, text: &str, _: SendOptions) -> Result<(), ActionError> {
        self.calls.lock().unwrap().push(SinkCall::Send {
            target,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn forward(&self, destination: ChatId, original: &ChatMessage) -> Result<(), ActionError> {
        if self.fail_forward {
            return Err(ActionError::ForwardFailed {
                destination: destination.to_string(),
                reason: "network unreachable".into(),
            });
        }
        self.calls.lock().unwrap().push(SinkCall::Forward {
            destination,
            message_id: original.id,
        });
        Ok(())
    }

    async fn delete(&self, target: ChatId, message_ids: &[i64]) -> Result<(), ActionError> {
        self.calls.lock().unwrap().push(SinkCall::Delete {
            target,
            message_ids: message_ids.to_vec(),
        });
        Ok(())
    }
}

enum Verdict {
    Spam(f32),
    Clean,
    Fail,
    Panic,
}

/// Analyzer with a fixed classification outcome; counts every call.
struct ScriptedAnalyzer {
    verdict: Verdict,
    fail_summaries: bool,
    classify_calls: AtomicUsize,
    summarize_calls: AtomicUsize,
}

impl ScriptedAnalyzer {
    fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            fail_summaries: false,
            classify_calls: AtomicUsize::new(0),
            summarize_calls: AtomicUsize::new(0),
        }
    }

    fn total_calls(&self) -> usize {
        self.classify_calls.load(Ordering::SeqCst) + self.summarize_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentAnalyzer for ScriptedAnalyzer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn classify(
        &self,
        _text: &str,
        _sender: &Sender,
    ) -> Result<ClassificationResult, AnalyzerError> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        match self.verdict {
            Verdict::Spam(confidence) => Ok(ClassificationResult {
                is_spam: true,
                confidence,
                reason: "giveaway scam".into(),
            }),
            Verdict::Clean => Ok(ClassificationResult::not_spam("chat")),
            Verdict::Fail => Err(AnalyzerError::RequestFailed {
                provider: "scripted".into(),
                reason: "503 overloaded".into(),
            }),
            Verdict::Panic => panic!("classifier exploded"),
        }
    }

    async fn summarize(&self, _text: &str, _prompt: Option<&str>) -> Result<String, AnalyzerError> {
        self.summarize_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_summaries {
            return Err(AnalyzerError::RequestFailed {
                provider: "scripted".into(),
                reason: "quota exceeded".into(),
            });
        }
        Ok("Significant: coordinated announcement".into())
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    dispatcher: Arc<Dispatcher>,
    sink: Arc<RecordingSink>,
    analyzer: Arc<ScriptedAnalyzer>,
    scheduler: Arc<SchedulerBridge>,
    /// Tick queue fed by `scheduler`.
    ticks: mpsc::UnboundedReceiver<Event>,
}

fn harness_with(analyzer: ScriptedAnalyzer, sink: RecordingSink) -> Harness {
    let (tx, ticks) = mpsc::unbounded_channel();
    let scheduler = SchedulerBridge::new(tx, Duration::from_secs(60));
    let sink = Arc::new(sink);
    let analyzer = Arc::new(analyzer);
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(StubSource::new()),
        sink.clone(),
        analyzer.clone(),
        Arc::clone(&scheduler),
        DispatcherConfig {
            operator_chat: OPERATOR,
            alerts: AlertConfig {
                cap: 4000,
                part_gap: Duration::ZERO,
            },
            history: HistoryLimits::default(),
        },
    ));
    Harness {
        dispatcher,
        sink,
        analyzer,
        scheduler,
        ticks,
    }
}

fn harness() -> Harness {
    harness_with(ScriptedAnalyzer::new(Verdict::Clean), RecordingSink::default())
}

fn message(chat_id: ChatId, id: i64, text: Option<&str>) -> ChatMessage {
    ChatMessage {
        id,
        chat_id,
        sender: Sender::Present {
            id: 4242,
            username: Some("mallory".into()),
            first_name: Some("Mallory".into()),
            is_bot: false,
        },
        text: text.map(String::from),
        has_media: false,
        date: Utc.with_ymd_and_hms(2025, 6, 1, 9, 30, 0).unwrap(),
    }
}

fn new_message(chat_id: ChatId, id: i64, text: &str) -> Event {
    Event::new_message(message(chat_id, id, Some(text)))
}

fn forward_all(source: &str, destination: &str) -> RuleSpec {
    RuleSpec::Forward {
        source: source.into(),
        destination: destination.into(),
        keywords: vec![],
        pattern: None,
        media_only: false,
    }
}

fn moderate(source: &str, ban_threshold: f32, delete_spam: bool) -> RuleSpec {
    RuleSpec::Moderate {
        source: source.into(),
        ban_threshold,
        delete_spam,
    }
}

fn watch(source: &str, keywords: &[&str]) -> RuleSpec {
    RuleSpec::Watch {
        source: source.into(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        pattern: None,
    }
}

fn monitor(source: &str) -> RuleSpec {
    RuleSpec::EventMonitor {
        source: source.into(),
        watch_edits: true,
        watch_deletes: true,
        watch_online: false,
    }
}

fn hourly_report(source: &str) -> RuleSpec {
    RuleSpec::ScheduledReport {
        source: source.into(),
        cadence: CadenceSpec::Hourly,
        limit: 10,
        prompt: None,
        extract_entities: false,
    }
}

async fn status(dispatcher: &Dispatcher, id: RuleId) -> RuleStatus {
    dispatcher
        .rules()
        .await
        .into_iter()
        .find(|s| s.id == id)
        .unwrap()
}

// ── Forward ─────────────────────────────────────────────────────────

#[tokio::test]
async fn forward_all_forwards_each_message_once() {
    let h = harness();
    let id = h
        .dispatcher
        .install(forward_all("@alpha", "@beta"))
        .await
        .unwrap();

    let report = h.dispatcher.dispatch(&new_message(ALPHA, 1, "hi")).await;

    assert_eq!(
        report,
        DispatchReport {
            matched: 1,
            succeeded: 1,
            failed: 0
        }
    );
    assert_eq!(h.sink.forwards(), vec![(BETA, 1)]);
    let status = status(&h.dispatcher, id).await;
    assert_eq!((status.match_count, status.action_count), (1, 1));
}

#[tokio::test]
async fn duplicate_delivery_forwards_twice() {
    let h = harness();
    h.dispatcher
        .install(forward_all("@alpha", "@beta"))
        .await
        .unwrap();

    let event = new_message(ALPHA, 1, "hi");
    h.dispatcher.dispatch(&event).await;
    h.dispatcher.dispatch(&event).await;

    assert_eq!(h.sink.forwards(), vec![(BETA, 1), (BETA, 1)]);
}

#[tokio::test]
async fn forward_keywords_filter_messages() {
    let h = harness();
    h.dispatcher
        .install(RuleSpec::Forward {
            source: "@alpha".into(),
            destination: "@beta".into(),
            keywords: vec!["Outage".into()],
            pattern: None,
            media_only: false,
        })
        .await
        .unwrap();

    h.dispatcher
        .dispatch(&new_message(ALPHA, 1, "lunch plans"))
        .await;
    h.dispatcher
        .dispatch(&new_message(ALPHA, 2, "OUTAGE in eu-west"))
        .await;

    assert_eq!(h.sink.forwards(), vec![(BETA, 2)]);
}

#[tokio::test]
async fn forward_failure_is_counted_and_rule_stays() {
    let h = harness_with(
        ScriptedAnalyzer::new(Verdict::Clean),
        RecordingSink {
            fail_forward: true,
            ..Default::default()
        },
    );
    let id = h
        .dispatcher
        .install(forward_all("@alpha", "@beta"))
        .await
        .unwrap();

    let report = h.dispatcher.dispatch(&new_message(ALPHA, 1, "hi")).await;

    assert_eq!(report.failed, 1);
    let status = status(&h.dispatcher, id).await;
    assert_eq!(
        (status.match_count, status.action_count, status.error_count),
        (0, 0, 1)
    );
    assert_eq!(h.dispatcher.rules().await.len(), 1);
}

// ── No match ────────────────────────────────────────────────────────

#[tokio::test]
async fn unmatched_source_causes_no_calls() {
    let h = harness();
    for spec in [
        forward_all("@alpha", "@beta"),
        moderate("@alpha", 0.5, true),
        watch("@alpha", &[]),
        monitor("@alpha"),
    ] {
        h.dispatcher.install(spec).await.unwrap();
    }

    let report = h
        .dispatcher
        .dispatch(&new_message(UNWATCHED, 1, "hello"))
        .await;
    h.dispatcher
        .dispatch(&Event::deleted(UNWATCHED, vec![1], Utc::now()))
        .await;

    assert_eq!(report, DispatchReport::default());
    assert!(h.sink.calls().is_empty());
    assert_eq!(h.analyzer.total_calls(), 0);
}

// ── Moderate ────────────────────────────────────────────────────────

#[tokio::test]
async fn confident_spam_is_deleted_and_audited() {
    let h = harness_with(
        ScriptedAnalyzer::new(Verdict::Spam(0.95)),
        RecordingSink::default(),
    );
    let id = h
        .dispatcher
        .install(moderate("@alpha", 0.9, true))
        .await
        .unwrap();

    h.dispatcher
        .dispatch(&new_message(ALPHA, 77, "FREE COINS click here"))
        .await;

    assert_eq!(h.sink.deletes(), vec![(ALPHA, vec![77])]);
    let audits = h.sink.sent_texts();
    assert_eq!(audits.len(), 1);
    assert!(audits[0].contains("SPAM REMOVED"));
    assert!(audits[0].contains("giveaway scam"));
    let status = status(&h.dispatcher, id).await;
    assert_eq!((status.match_count, status.action_count), (1, 1));
}

#[tokio::test]
async fn classification_failure_never_deletes() {
    let h = harness_with(ScriptedAnalyzer::new(Verdict::Fail), RecordingSink::default());
    let id = h
        .dispatcher
        .install(moderate("@alpha", 0.0, true))
        .await
        .unwrap();

    let report = h
        .dispatcher
        .dispatch(&new_message(ALPHA, 1, "FREE COINS"))
        .await;

    assert_eq!(report.failed, 1);
    assert!(h.sink.deletes().is_empty());
    assert!(h.sink.calls().is_empty());
    assert_eq!(status(&h.dispatcher, id).await.error_count, 1);
}

#[tokio::test]
async fn spam_below_threshold_is_kept() {
    let h = harness_with(
        ScriptedAnalyzer::new(Verdict::Spam(0.6)),
        RecordingSink::default(),
    );
    let id = h
        .dispatcher
        .install(moderate("@alpha", 0.9, true))
        .await
        .unwrap();

    h.dispatcher.dispatch(&new_message(ALPHA, 1, "promo")).await;

    assert!(h.sink.deletes().is_empty());
    assert_eq!(status(&h.dispatcher, id).await.match_count, 0);
}

#[tokio::test]
async fn report_only_moderation_does_not_delete() {
    let h = harness_with(
        ScriptedAnalyzer::new(Verdict::Spam(0.99)),
        RecordingSink::default(),
    );
    let id = h
        .dispatcher
        .install(moderate("@alpha", 0.5, false))
        .await
        .unwrap();

    h.dispatcher.dispatch(&new_message(ALPHA, 1, "promo")).await;

    assert!(h.sink.calls().is_empty());
    let status = status(&h.dispatcher, id).await;
    assert_eq!((status.match_count, status.action_count), (1, 0));
}

#[tokio::test]
async fn media_without_text_is_not_classified() {
    let h = harness_with(
        ScriptedAnalyzer::new(Verdict::Spam(0.99)),
        RecordingSink::default(),
    );
    h.dispatcher
        .install(moderate("@alpha", 0.5, true))
        .await
        .unwrap();

    let mut photo = message(ALPHA, 1, None);
    photo.has_media = true;
    h.dispatcher.dispatch(&Event::new_message(photo)).await;

    assert_eq!(h.analyzer.total_calls(), 0);
    assert!(h.sink.calls().is_empty());
}

// ── Isolation ───────────────────────────────────────────────────────

#[tokio::test]
async fn panicking_rule_does_not_affect_siblings() {
    let h = harness_with(ScriptedAnalyzer::new(Verdict::Panic), RecordingSink::default());
    let moderate_id = h
        .dispatcher
        .install(moderate("@alpha", 0.5, true))
        .await
        .unwrap();
    let forward_id = h
        .dispatcher
        .install(forward_all("@alpha", "@beta"))
        .await
        .unwrap();

    let report = h.dispatcher.dispatch(&new_message(ALPHA, 5, "hi")).await;

    assert_eq!(
        report,
        DispatchReport {
            matched: 2,
            succeeded: 1,
            failed: 1
        }
    );
    assert_eq!(h.sink.forwards(), vec![(BETA, 5)]);
    assert_eq!(status(&h.dispatcher, moderate_id).await.error_count, 1);
    assert_eq!(status(&h.dispatcher, forward_id).await.action_count, 1);

    // The dispatcher keeps working after the panic.
    h.dispatcher.dispatch(&new_message(ALPHA, 6, "again")).await;
    assert_eq!(h.sink.forwards(), vec![(BETA, 5), (BETA, 6)]);
}

// ── Watch ───────────────────────────────────────────────────────────

#[tokio::test]
async fn watch_alert_carries_matches_and_assessment() {
    let h = harness();
    h.dispatcher
        .install(watch("@alpha", &["breach", "leak"]))
        .await
        .unwrap();

    h.dispatcher
        .dispatch(&new_message(ALPHA, 1, "Possible data LEAK reported"))
        .await;
    h.dispatcher
        .dispatch(&new_message(ALPHA, 2, "weekend plans"))
        .await;

    let alerts = h.sink.sent_texts();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("*Source:* Alpha"));
    assert!(alerts[0].contains("*Keyword Match:* leak"));
    assert!(!alerts[0].contains("breach"));
    assert!(alerts[0].contains("Possible data LEAK reported"));
    assert!(alerts[0].contains("coordinated announcement"));
    assert_eq!(h.analyzer.summarize_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn watch_surfaces_summarize_failure_verbatim() {
    let mut analyzer = ScriptedAnalyzer::new(Verdict::Clean);
    analyzer.fail_summaries = true;
    let h = harness_with(analyzer, RecordingSink::default());
    let id = h.dispatcher.install(watch("@alpha", &[])).await.unwrap();

    let report = h.dispatcher.dispatch(&new_message(ALPHA, 1, "anything")).await;

    assert_eq!(report.succeeded, 1);
    let alerts = h.sink.sent_texts();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("Provider scripted request failed: quota exceeded"));
    assert_eq!(status(&h.dispatcher, id).await.error_count, 0);
}

#[tokio::test]
async fn long_watch_alert_is_sent_in_numbered_parts() {
    let h = harness();
    h.dispatcher.install(watch("@alpha", &[])).await.unwrap();

    let body: String = (0..300)
        .map(|i| format!("line {i:03} of a very long incident timeline\n"))
        .collect();
    h.dispatcher.dispatch(&new_message(ALPHA, 1, &body)).await;

    let parts = h.sink.sent_texts();
    assert!(parts.len() >= 3);
    let total = parts.len();
    for (i, part) in parts.iter().enumerate() {
        let header = format!("📄 *Part {}/{}*\n\n", i + 1, total);
        assert!(part.starts_with(&header));
        assert!(part.chars().count() <= 4000);
    }
}

// ── EventMonitor ────────────────────────────────────────────────────

#[tokio::test]
async fn third_edit_is_numbered() {
    let h = harness();
    let id = h.dispatcher.install(monitor("@alpha")).await.unwrap();

    for (n, text) in ["v1", "v2", "v3"].iter().enumerate() {
        let edited = message(ALPHA, 7, Some(text));
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 10, n as u32, 0).unwrap();
        h.dispatcher.dispatch(&Event::edited(edited, at)).await;
    }

    let history = h.dispatcher.edit_history(ALPHA, 7).await;
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].text.as_deref(), Some("v3"));

    let alerts = h.sink.sent_texts();
    assert_eq!(alerts.len(), 3);
    assert!(!alerts[0].contains("Edit #"));
    assert!(alerts[1].contains("Edit #2"));
    assert!(alerts[2].contains("Edit #3"));
    assert!(alerts[2].contains("v3"));

    let status = status(&h.dispatcher, id).await;
    assert_eq!((status.match_count, status.action_count), (3, 3));
}

#[tokio::test]
async fn edit_history_appended_once_per_event() {
    let h = harness();
    h.dispatcher.install(monitor("@alpha")).await.unwrap();
    h.dispatcher.install(monitor("@alpha")).await.unwrap();

    let report = h
        .dispatcher
        .dispatch(&Event::edited(message(ALPHA, 7, Some("v1")), Utc::now()))
        .await;

    assert_eq!(report.matched, 2);
    assert_eq!(h.dispatcher.edit_history(ALPHA, 7).await.len(), 1);
    assert_eq!(h.sink.sent_texts().len(), 2);
}

#[tokio::test]
async fn edits_ignored_without_monitor() {
    let h = harness();
    h.dispatcher.install(watch("@alpha", &[])).await.unwrap();

    h.dispatcher
        .dispatch(&Event::edited(message(ALPHA, 7, Some("v1")), Utc::now()))
        .await;

    assert!(h.dispatcher.edit_history(ALPHA, 7).await.is_empty());
    assert!(h.sink.calls().is_empty());
}

#[tokio::test]
async fn delete_alert_reports_only_ids() {
    let h = harness();
    h.dispatcher.install(monitor("@alpha")).await.unwrap();

    h.dispatcher
        .dispatch(&new_message(ALPHA, 5, "secret plans"))
        .await;
    h.dispatcher
        .dispatch(&Event::deleted(ALPHA, vec![5, 6], Utc::now()))
        .await;

    let alerts = h.sink.sent_texts();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("*Source:* Alpha"));
    assert!(alerts[0].contains("*Message IDs:* 5, 6"));
    assert!(!alerts[0].contains("secret plans"));

    let deletions = h.dispatcher.recent_deletions(10).await;
    assert_eq!(deletions.len(), 1);
    assert_eq!(deletions[0].message_ids, vec![5, 6]);
}

#[tokio::test]
async fn monitor_respects_disabled_kinds() {
    let h = harness();
    h.dispatcher
        .install(RuleSpec::EventMonitor {
            source: "@alpha".into(),
            watch_edits: false,
            watch_deletes: true,
            watch_online: false,
        })
        .await
        .unwrap();

    let report = h
        .dispatcher
        .dispatch(&Event::edited(message(ALPHA, 1, Some("x")), Utc::now()))
        .await;

    assert_eq!(report.matched, 0);
    assert!(h.sink.calls().is_empty());
}

// ── Scheduled reports ───────────────────────────────────────────────

#[tokio::test]
async fn tick_runs_its_report() {
    let h = harness();
    let id = h.dispatcher.install(hourly_report("@alpha")).await.unwrap();
    assert_eq!(h.scheduler.entries().await.len(), 1);

    let report = h
        .dispatcher
        .dispatch(&Event::tick(ALPHA, id, Utc::now()))
        .await;

    assert_eq!(report.succeeded, 1);
    let sent = h.sink.sent_texts();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("INTELLIGENCE REPORT"));
    assert!(sent[0].contains("*Source:* Alpha"));
    assert!(sent[0].contains("coordinated announcement"));
    let status = status(&h.dispatcher, id).await;
    assert_eq!((status.match_count, status.action_count), (1, 1));
}

#[tokio::test]
async fn scheduler_poll_drives_report() {
    let mut h = harness();
    let id = h.dispatcher.install(hourly_report("@alpha")).await.unwrap();

    // Nothing is due right after install.
    assert_eq!(h.scheduler.poll(Utc::now()).await, 0);

    let later = Utc::now() + chrono::Duration::hours(2);
    assert_eq!(h.scheduler.poll(later).await, 1);
    let tick = h.ticks.recv().await.unwrap();
    assert_eq!(tick.source_id, ALPHA);
    assert_eq!(tick.kind, EventKind::Tick { rule_id: id });

    h.dispatcher.dispatch(&tick).await;
    assert_eq!(h.sink.sent_texts().len(), 1);

    // The entry moved past `later`, so the same instant does not fire again.
    assert_eq!(h.scheduler.poll(later).await, 0);
}

#[tokio::test]
async fn tick_for_other_rule_is_ignored() {
    let h = harness();
    h.dispatcher.install(hourly_report("@alpha")).await.unwrap();

    let report = h
        .dispatcher
        .dispatch(&Event::tick(ALPHA, uuid::Uuid::new_v4(), Utc::now()))
        .await;

    assert_eq!(report.matched, 0);
    assert!(h.sink.calls().is_empty());
}

#[tokio::test]
async fn report_on_empty_history_counts_error() {
    let h = harness();
    let id = h.dispatcher.install(hourly_report("@beta")).await.unwrap();

    let report = h
        .dispatcher
        .dispatch(&Event::tick(BETA, id, Utc::now()))
        .await;

    assert_eq!(report.failed, 1);
    assert!(h.sink.calls().is_empty());
    assert_eq!(status(&h.dispatcher, id).await.error_count, 1);
}

#[tokio::test]
async fn compare_skips_unusable_sources() {
    let h = harness();

    // Beta has no history, so only one usable source remains.
    let err = h
        .dispatcher
        .reporter()
        .compare(&["@alpha", "@beta", "@nowhere"], 20)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        chatwatch::error::Error::NotEnoughSources { needed: 2, got: 1 }
    ));
    assert!(h.sink.calls().is_empty());
}

#[tokio::test]
async fn on_demand_analysis_reports_to_operator() {
    let h = harness();

    let parts = h
        .dispatcher
        .reporter()
        .analyze("@alpha", 20, &Default::default())
        .await
        .unwrap();

    assert_eq!(parts, 1);
    let sent = h.sink.sent_texts();
    assert!(sent[0].contains("*Scope:* Last 20 messages"));
    assert!(sent[0].contains("*Model:* scripted"));
}

// ── Install / remove ────────────────────────────────────────────────

#[tokio::test]
async fn install_unknown_source_fails() {
    let h = harness();

    let err = h
        .dispatcher
        .install(watch("@nowhere", &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, InstallError::SourceUnavailable(_)));

    let err = h
        .dispatcher
        .install(forward_all("@alpha", "@nowhere"))
        .await
        .unwrap_err();
    assert!(matches!(err, InstallError::SourceUnavailable(_)));

    assert!(h.dispatcher.rules().await.is_empty());
}

#[tokio::test]
async fn remove_all_clears_every_kind() {
    let h = harness_with(
        ScriptedAnalyzer::new(Verdict::Spam(0.99)),
        RecordingSink::default(),
    );
    for spec in [
        forward_all("@alpha", "@beta"),
        watch("@alpha", &[]),
        watch("@beta", &["x"]),
        moderate("@alpha", 0.5, true),
        hourly_report("@alpha"),
    ] {
        h.dispatcher.install(spec).await.unwrap();
    }

    assert_eq!(h.dispatcher.remove_all().await, 5);
    assert!(h.scheduler.entries().await.is_empty());

    let report = h.dispatcher.dispatch(&new_message(ALPHA, 1, "x")).await;
    assert_eq!(report.matched, 0);
    assert!(h.sink.calls().is_empty());
    assert_eq!(h.analyzer.total_calls(), 0);
}

#[tokio::test]
async fn remove_one_rule() {
    let h = harness();
    let report_id = h.dispatcher.install(hourly_report("@alpha")).await.unwrap();
    let forward_id = h
        .dispatcher
        .install(forward_all("@alpha", "@beta"))
        .await
        .unwrap();

    assert!(h.dispatcher.remove(report_id).await);
    assert!(!h.dispatcher.remove(report_id).await);
    assert!(h.scheduler.entries().await.is_empty());

    let remaining: Vec<_> = h.dispatcher.rules().await.iter().map(|s| s.id).collect();
    assert_eq!(remaining, vec![forward_id]);
}

// ── Run loop ────────────────────────────────────────────────────────

#[tokio::test]
async fn run_drains_queue_and_stops_when_closed() {
    let h = harness();
    h.dispatcher
        .install(forward_all("@alpha", "@beta"))
        .await
        .unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    for id in 1..=3 {
        tx.send(new_message(ALPHA, id, "hi")).unwrap();
    }
    drop(tx);

    timeout(TEST_TIMEOUT, Arc::clone(&h.dispatcher).run(rx))
        .await
        .expect("dispatcher did not stop after the queue closed");

    let mut forwarded: Vec<i64> = h.sink.forwards().into_iter().map(|(_, id)| id).collect();
    forwarded.sort();
    assert_eq!(forwarded, vec![1, 2, 3]);
}
