//! Registry of installed rules.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::pipeline::rules::{Rule, RuleStatus};
use crate::pipeline::types::{ChatId, EventKind, RuleId};

/// Concurrent-safe store of installed rules, kept in install order.
///
/// Readers get `Arc<Rule>` snapshots, so a removal never cuts short an
/// evaluation that already holds its rule.
#[derive(Default)]
pub struct RuleRegistry {
    rules: RwLock<Vec<Arc<Rule>>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a rule. It is visible to every dispatch that starts after
    /// this returns.
    pub async fn insert(&self, rule: Rule) -> Arc<Rule> {
        let rule = Arc::new(rule);
        self.rules.write().await.push(Arc::clone(&rule));
        tracing::debug!(rule_id = %rule.id, kind = rule.kind.label(), "Registered rule");
        rule
    }

    /// Rules bound to `source_id` that evaluate `event`, in install order.
    pub async fn matching(&self, source_id: ChatId, event: &EventKind) -> Vec<Arc<Rule>> {
        self.rules
            .read()
            .await
            .iter()
            .filter(|rule| rule.source.id == source_id && rule.handles(event))
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: RuleId) -> Option<Arc<Rule>> {
        self.rules.read().await.iter().find(|r| r.id == id).cloned()
    }

    /// Remove one rule by id.
    pub async fn remove(&self, id: RuleId) -> Option<Arc<Rule>> {
        let mut rules = self.rules.write().await;
        let index = rules.iter().position(|r| r.id == id)?;
        Some(rules.remove(index))
    }

    /// Remove every rule. Returns how many were installed.
    pub async fn remove_all(&self) -> usize {
        let mut rules = self.rules.write().await;
        let count = rules.len();
        rules.clear();
        count
    }

    pub async fn len(&self) -> usize {
        self.rules.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rules.read().await.is_empty()
    }

    pub async fn statuses(&self) -> Vec<RuleStatus> {
        self.rules.read().await.iter().map(|r| r.status()).collect()
    }
}
