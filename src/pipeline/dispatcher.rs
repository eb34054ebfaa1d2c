//! Event dispatcher: fans each inbound event out to the matching rules.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::StreamExt;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{EvalError, InstallError, SourceError};
use crate::pipeline::alerts::AlertConfig;
use crate::pipeline::evaluator::{EvalContext, evaluate};
use crate::pipeline::history::{
    DeletionLog, DeletionRecord, EditHistory, EditRecord, HistoryLimits,
};
use crate::pipeline::registry::RuleRegistry;
use crate::pipeline::report::Reporter;
use crate::pipeline::rules::{Rule, RuleKind, RuleSpec, RuleStatus};
use crate::pipeline::scheduler::SchedulerBridge;
use crate::pipeline::traits::{ActionSink, ContentAnalyzer, Source};
use crate::pipeline::types::{ChatId, Event, EventKind, RuleId};

/// Dispatcher settings that do not come from collaborators.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Chat receiving alerts, audit notices and reports.
    pub operator_chat: ChatId,
    pub alerts: AlertConfig,
    pub history: HistoryLimits,
}

/// Result of dispatching one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Rules bound to the event's source that evaluate its kind.
    pub matched: usize,
    pub succeeded: usize,
    /// Evaluations that returned an error or panicked.
    pub failed: usize,
}

/// Owns the rule registry and history caches and drives rule evaluation.
pub struct Dispatcher {
    registry: RuleRegistry,
    edits: EditHistory,
    deletions: DeletionLog,
    scheduler: Arc<SchedulerBridge>,
    source: Arc<dyn Source>,
    ctx: EvalContext,
}

impl Dispatcher {
    pub fn new(
        source: Arc<dyn Source>,
        sink: Arc<dyn ActionSink>,
        analyzer: Arc<dyn ContentAnalyzer>,
        scheduler: Arc<SchedulerBridge>,
        config: DispatcherConfig,
    ) -> Self {
        let reporter = Reporter::new(
            Arc::clone(&source),
            Arc::clone(&analyzer),
            Arc::clone(&sink),
            config.operator_chat,
            config.alerts,
        );
        Self {
            registry: RuleRegistry::new(),
            edits: EditHistory::new(config.history),
            deletions: DeletionLog::new(),
            scheduler,
            source,
            ctx: EvalContext {
                sink,
                analyzer,
                reporter,
                operator_chat: config.operator_chat,
                alerts: config.alerts,
            },
        }
    }

    /// Reporter sharing this dispatcher's collaborators.
    pub fn reporter(&self) -> &Reporter {
        &self.ctx.reporter
    }

    // ── Rule management ─────────────────────────────────────────────

    /// Resolve, validate and install a rule.
    ///
    /// The rule takes part in every dispatch that starts after this
    /// returns. Report rules also get a schedule entry.
    pub async fn install(&self, spec: RuleSpec) -> Result<RuleId, InstallError> {
        let source = self.source.get_entity(spec.source()).await?;
        let destination = match spec.destination() {
            Some(identifier) => Some(self.source.get_entity(identifier).await?),
            None => None,
        };

        let rule = Rule::build(&spec, source, destination)?;
        if let RuleKind::ScheduledReport { cadence, .. } = &rule.kind {
            let next_fire = self
                .scheduler
                .add(rule.id, rule.source.id, cadence.clone(), rule.created_at)
                .await?;
            info!(rule_id = %rule.id, %next_fire, "First report scheduled");
        }

        let rule = self.registry.insert(rule).await;
        info!(
            rule_id = %rule.id,
            kind = rule.kind.label(),
            source = %rule.source.title,
            "Rule installed"
        );
        Ok(rule.id)
    }

    /// Remove one rule and its schedule entry.
    pub async fn remove(&self, id: RuleId) -> bool {
        let removed = self.registry.remove(id).await.is_some();
        if removed {
            self.scheduler.remove(id).await;
            info!(rule_id = %id, "Rule removed");
        }
        removed
    }

    /// Remove every rule of every kind. In-flight evaluations finish.
    pub async fn remove_all(&self) -> usize {
        let count = self.registry.remove_all().await;
        let schedules = self.scheduler.clear().await;
        info!(count, schedules, "All rules removed");
        count
    }

    pub async fn rules(&self) -> Vec<RuleStatus> {
        self.registry.statuses().await
    }

    /// Retained edits of one message, oldest first.
    pub async fn edit_history(&self, source_id: ChatId, message_id: i64) -> Vec<EditRecord> {
        self.edits.entries(source_id, message_id).await
    }

    /// Most recent deletions, newest first.
    pub async fn recent_deletions(&self, limit: usize) -> Vec<DeletionRecord> {
        self.deletions.recent(limit).await
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Evaluate `event` against every matching rule.
    ///
    /// Rules are snapshotted in install order and the registry lock is
    /// released before any evaluation starts. Evaluations run concurrently;
    /// an error or panic in one is logged and counted against that rule only.
    pub async fn dispatch(&self, event: &Event) -> DispatchReport {
        let rules = self.registry.matching(event.source_id, &event.kind).await;
        if rules.is_empty() {
            debug!(source_id = event.source_id, kind = event.label(), "No matching rules");
            return DispatchReport::default();
        }

        let edit_ordinal = self.record_history(event).await;

        let evaluations = rules.iter().map(|rule| {
            AssertUnwindSafe(evaluate(rule, event, edit_ordinal, &self.ctx)).catch_unwind()
        });
        let results = join_all(evaluations).await;

        let mut report = DispatchReport {
            matched: rules.len(),
            ..Default::default()
        };
        for (rule, result) in rules.iter().zip(results) {
            let result =
                result.unwrap_or_else(|panic| Err(EvalError::Panicked(panic_message(panic))));
            match result {
                Ok(outcome) => {
                    report.succeeded += 1;
                    debug!(rule_id = %rule.id, ?outcome, "Rule evaluated");
                }
                Err(e) => {
                    report.failed += 1;
                    rule.counters.record_error();
                    if matches!(e, EvalError::Panicked(_)) {
                        error!(rule_id = %rule.id, kind = rule.kind.label(), error = %e, "Rule evaluation panicked");
                    } else {
                        warn!(rule_id = %rule.id, kind = rule.kind.label(), error = %e, "Rule evaluation failed");
                    }
                }
            }
        }
        report
    }

    /// Record edit/delete history once per event, before fan-out. Returns
    /// the edit ordinal for `Edited` events.
    async fn record_history(&self, event: &Event) -> Option<u64> {
        match &event.kind {
            EventKind::Edited(message) => Some(
                self.edits
                    .append(
                        event.source_id,
                        message.id,
                        event.timestamp,
                        message.text.clone(),
                    )
                    .await,
            ),
            EventKind::Deleted { message_ids } => {
                self.deletions
                    .record(DeletionRecord {
                        source_id: event.source_id,
                        message_ids: message_ids.clone(),
                        timestamp: event.timestamp,
                    })
                    .await;
                None
            }
            _ => None,
        }
    }

    /// Drain the inbound queue until Ctrl+C or until every producer is gone.
    ///
    /// Each event gets its own task so a slow analyzer call never holds up
    /// the next event. When the queue closes, in-flight dispatches are
    /// awaited before returning.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Event>) {
        let mut tasks = JoinSet::new();
        info!(rules = self.registry.len().await, "Dispatcher running");

        loop {
            tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl+C received, shutting down...");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Dispatch task failed");
                    }
                }
                event = inbound.recv() => {
                    match event {
                        Some(event) => {
                            let dispatcher = Arc::clone(&self);
                            tasks.spawn(async move {
                                let report = dispatcher.dispatch(&event).await;
                                if report.matched > 0 {
                                    debug!(
                                        kind = event.label(),
                                        matched = report.matched,
                                        failed = report.failed,
                                        "Event dispatched"
                                    );
                                }
                            });
                        }
                        None => {
                            info!("Inbound queue closed, draining in-flight dispatches");
                            while tasks.join_next().await.is_some() {}
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Forward source events into the dispatcher's inbound queue.
///
/// Returns when the source stream ends or the queue is closed.
pub fn spawn_source_pump(
    source: Arc<dyn Source>,
    tx: mpsc::UnboundedSender<Event>,
) -> JoinHandle<Result<(), SourceError>> {
    tokio::spawn(async move {
        let mut events = source.subscribe().await?;
        info!("Source subscription started");
        while let Some(event) = events.next().await {
            if tx.send(event).is_err() {
                warn!("Inbound queue closed, stopping source pump");
                break;
            }
        }
        info!("Source stream ended");
        Ok(())
    })
}
