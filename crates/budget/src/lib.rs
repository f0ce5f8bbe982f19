//! Token budget enforcement — the gate in front of every generation call.
//!
//! Computes the combined token cost of message history and selected context
//! items against a configured ceiling, and when the ceiling is exceeded,
//! truncates with a deterministic priority policy:
//!
//! 1. The two most recent messages (latest user turn and, if present, the
//!    assistant response immediately before it) are never removed.
//! 2. `System` messages are never removed.
//! 3. Context items go first — low-priority derived types before corpus
//!    types, least-recently-used first within a tier.
//! 4. Only once items are exhausted do the oldest unprotected messages go.
//!
//! `optimize` runs the same evaluation non-destructively and returns ranked
//! advice, used to warn callers before truncation is forced.
//!
//! # Determinism
//!
//! Identical inputs always produce identical outputs, and `truncate_to_fit`
//! is idempotent: re-applying it to its own output removes nothing further.

use std::sync::Arc;

use loupe_core::item::ContextItem;
use loupe_core::message::{ChatMessage, Role};
use loupe_core::policy::{BudgetPolicy, EvictionPolicy};
use serde::{Deserialize, Serialize};
use tracing::debug;

use loupe_tokens::TokenCounter;

// ── Types ─────────────────────────────────────────────────────────────────

/// Budget pressure, derived from utilization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetLevel {
    /// Below the warning threshold
    Healthy,
    /// At or above the warning threshold
    Warning,
    /// At or above the critical threshold, still within budget
    Critical,
    /// Over budget
    Exceeded,
}

/// A derived, non-persisted snapshot of budget pressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub current_tokens: usize,
    pub limit: usize,
    /// Tokens left before the ceiling (saturating).
    pub remaining: usize,
    /// `current / limit`.
    pub utilization: f32,
    pub level: BudgetLevel,
}

/// One removal performed (or recommended) by the eviction policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncationStep {
    /// Human-readable reason for this removal.
    pub reason: String,
    /// Tokens freed by this removal.
    pub tokens_freed: usize,
}

/// The result of a destructive truncation pass.
#[derive(Debug, Clone)]
pub struct TruncationOutcome {
    pub messages: Vec<ChatMessage>,
    pub items: Vec<ContextItem>,
    pub removed_messages: usize,
    pub removed_items: usize,
    pub removed_tokens: usize,
    pub log: Vec<TruncationStep>,
}

/// A single piece of non-destructive advice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendedAction {
    pub description: String,
    pub token_savings: usize,
}

/// The result of a non-destructive optimization pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationReport {
    /// Whether applying every recommendation fits under the target.
    pub can_fit: bool,
    /// Removals the policy would perform, in order.
    pub recommended_actions: Vec<RecommendedAction>,
    /// Total tokens the recommendations would free.
    pub token_savings: usize,
}

// ── Manager ───────────────────────────────────────────────────────────────

/// The token budget manager. Stateless beyond its counter — create one and
/// reuse it across sessions.
pub struct TokenBudgetManager {
    counter: Arc<TokenCounter>,
    budget: BudgetPolicy,
    eviction: EvictionPolicy,
}

impl TokenBudgetManager {
    pub fn new(counter: Arc<TokenCounter>, budget: BudgetPolicy, eviction: EvictionPolicy) -> Self {
        Self {
            counter,
            budget,
            eviction,
        }
    }

    /// Combined token cost of messages and context items.
    pub fn calculate(&self, messages: &[ChatMessage], items: &[ContextItem]) -> usize {
        let message_tokens: usize = messages.iter().map(|m| self.counter.count_message(m)).sum();
        let item_tokens: usize = items.iter().map(|i| self.item_tokens(i)).sum();
        message_tokens + item_tokens
    }

    /// Current budget pressure.
    pub fn status(&self, messages: &[ChatMessage], items: &[ContextItem]) -> BudgetStatus {
        let current = self.calculate(messages, items);
        self.status_for(current, self.budget.token_limit)
    }

    /// Truncate until under `limit` (the configured ceiling when `None`),
    /// or until nothing removable remains.
    pub fn truncate_to_fit(
        &self,
        messages: Vec<ChatMessage>,
        items: Vec<ContextItem>,
        limit: Option<usize>,
    ) -> TruncationOutcome {
        let limit = limit.unwrap_or(self.budget.token_limit);
        let mut messages = messages;
        let mut items = items;
        let mut log = Vec::new();
        let mut removed_messages = 0;
        let mut removed_items = 0;
        let mut removed_tokens = 0;

        let protected = protected_message_ids(&messages, self.budget.protected_recent_messages);

        // Context items first, by eviction rank then LRU.
        let mut eviction_order = self.item_eviction_order(&items);
        while self.calculate(&messages, &items) > limit {
            let Some(item_id) = eviction_order.pop() else {
                break;
            };
            let Some(pos) = items.iter().position(|i| i.id == item_id) else {
                continue;
            };
            let item = items.remove(pos);
            let freed = self.item_tokens(&item);
            removed_items += 1;
            removed_tokens += freed;
            log.push(TruncationStep {
                reason: format!(
                    "Removed {} item \"{}\" ({} tokens, least recently used in its tier)",
                    item.item_type, item.title, freed
                ),
                tokens_freed: freed,
            });
        }

        // Then the oldest unprotected, non-system messages.
        while self.calculate(&messages, &items) > limit {
            let Some(pos) = messages
                .iter()
                .position(|m| m.role != Role::System && !protected.contains(&m.id))
            else {
                break;
            };
            let msg = messages.remove(pos);
            let freed = self.counter.count_message(&msg);
            removed_messages += 1;
            removed_tokens += freed;
            log.push(TruncationStep {
                reason: format!(
                    "Removed oldest {} message ({} tokens)",
                    role_label(msg.role),
                    freed
                ),
                tokens_freed: freed,
            });
        }

        if !log.is_empty() {
            debug!(
                removed_items,
                removed_messages, removed_tokens, limit, "Truncated to fit budget"
            );
        }

        TruncationOutcome {
            messages,
            items,
            removed_messages,
            removed_items,
            removed_tokens,
            log,
        }
    }

    /// Evaluate what truncation *would* do, without mutating anything.
    pub fn optimize(
        &self,
        messages: &[ChatMessage],
        items: &[ContextItem],
        target: Option<usize>,
    ) -> OptimizationReport {
        let target = target.unwrap_or(self.budget.token_limit);
        let outcome = self.truncate_to_fit(messages.to_vec(), items.to_vec(), Some(target));

        let can_fit = self.calculate(&outcome.messages, &outcome.items) <= target;
        OptimizationReport {
            can_fit,
            recommended_actions: outcome
                .log
                .iter()
                .map(|step| RecommendedAction {
                    description: step.reason.clone(),
                    token_savings: step.tokens_freed,
                })
                .collect(),
            token_savings: outcome.removed_tokens,
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn status_for(&self, current: usize, limit: usize) -> BudgetStatus {
        let utilization = if limit == 0 {
            f32::INFINITY
        } else {
            current as f32 / limit as f32
        };
        let level = if utilization < self.budget.warning_threshold {
            BudgetLevel::Healthy
        } else if utilization < self.budget.critical_threshold {
            BudgetLevel::Warning
        } else if utilization <= 1.0 {
            BudgetLevel::Critical
        } else {
            BudgetLevel::Exceeded
        };
        BudgetStatus {
            current_tokens: current,
            limit,
            remaining: limit.saturating_sub(current),
            utilization,
            level,
        }
    }

    fn item_tokens(&self, item: &ContextItem) -> usize {
        self.counter.count(&item.title)
            + item.content.as_deref().map_or(0, |c| self.counter.count(c))
    }

    /// Item ids in eviction order, *last* evicted first — callers `pop()`
    /// to get the next victim. Low-priority tiers and colder items sort to
    /// the end of the returned vec.
    fn item_eviction_order(&self, items: &[ContextItem]) -> Vec<String> {
        let mut order: Vec<&ContextItem> = items.iter().collect();
        order.sort_by(|a, b| {
            self.eviction
                .rank(a.item_type)
                .cmp(&self.eviction.rank(b.item_type))
                .then_with(|| last_activity(a).cmp(&last_activity(b)))
                .then_with(|| a.id.cmp(&b.id))
        });
        order.reverse();
        order.into_iter().map(|i| i.id.clone()).collect()
    }
}

/// The effective recency of an item for LRU ordering.
fn last_activity(item: &ContextItem) -> chrono::DateTime<chrono::Utc> {
    item.last_used_at.unwrap_or(item.added_at)
}

/// Ids of messages the eviction policy must never remove: the most recent
/// user message and up to `protected_recent - 1` assistant messages
/// immediately preceding it.
fn protected_message_ids(messages: &[ChatMessage], protected_recent: usize) -> Vec<String> {
    let mut protected = Vec::new();
    if protected_recent == 0 {
        return protected;
    }
    let Some(last_user) = messages.iter().rposition(|m| m.role == Role::User) else {
        return protected;
    };
    protected.push(messages[last_user].id.clone());

    let mut idx = last_user;
    while protected.len() < protected_recent && idx > 0 {
        idx -= 1;
        if messages[idx].role == Role::Assistant {
            protected.push(messages[idx].id.clone());
        } else {
            break;
        }
    }
    protected
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use loupe_core::intent::Intent;
    use loupe_core::item::ContextItemType;
    use loupe_core::session::SessionId;

    fn manager_with_limit(limit: usize) -> TokenBudgetManager {
        TokenBudgetManager::new(
            Arc::new(TokenCounter::default()),
            BudgetPolicy {
                token_limit: limit,
                ..Default::default()
            },
            EvictionPolicy::default(),
        )
    }

    fn user_msg(content: &str) -> ChatMessage {
        ChatMessage::user(SessionId::from("s1"), content)
    }

    fn assistant_msg(content: &str) -> ChatMessage {
        ChatMessage::assistant(SessionId::from("s1"), content, Intent::GeneralExploration)
    }

    fn item(t: ContextItemType, id: &str, content: &str) -> ContextItem {
        ContextItem::new(t, id, format!("title {id}")).with_content(content)
    }

    #[test]
    fn calculate_sums_messages_and_items() {
        let mgr = manager_with_limit(1000);
        let messages = vec![user_msg("12345678")]; // 2 tokens + 4 overhead
        let items = vec![item(ContextItemType::Insight, "i1", "12345678")];
        // item: title "title i1" (8 chars = 2) + content 2
        assert_eq!(mgr.calculate(&messages, &items), 6 + 4);
    }

    #[test]
    fn empty_context_under_budget_is_healthy_and_noop() {
        let mgr = manager_with_limit(1000);
        let messages = vec![user_msg("hello"), assistant_msg("hi there")];

        let status = mgr.status(&messages, &[]);
        assert_eq!(status.level, BudgetLevel::Healthy);
        assert!(status.remaining > 0);

        let outcome = mgr.truncate_to_fit(messages.clone(), vec![], None);
        assert_eq!(outcome.removed_messages, 0);
        assert_eq!(outcome.removed_items, 0);
        assert!(outcome.log.is_empty());
        assert_eq!(outcome.messages.len(), 2);
    }

    #[test]
    fn status_levels_follow_thresholds() {
        let mgr = manager_with_limit(100);

        // 96 tokens of 100 → critical
        let messages = vec![user_msg(&"a".repeat(368))]; // 92 + 4 overhead = 96
        let status = mgr.status(&messages, &[]);
        assert_eq!(status.current_tokens, 96);
        assert_eq!(status.level, BudgetLevel::Critical);

        // One more message pushes over 100 → exceeded
        let mut messages = messages;
        messages.push(assistant_msg(&"b".repeat(40))); // 10 + 4 = 14
        let status = mgr.status(&messages, &[]);
        assert!(status.current_tokens > 100);
        assert_eq!(status.level, BudgetLevel::Exceeded);
        assert_eq!(status.remaining, 0);

        // Truncation restores utilization ≤ 100%
        let outcome = mgr.truncate_to_fit(messages, vec![], None);
        let after = mgr.status(&outcome.messages, &outcome.items);
        assert!(after.utilization <= 1.0);
    }

    #[test]
    fn warning_band() {
        let mgr = manager_with_limit(100);
        let messages = vec![user_msg(&"a".repeat(320))]; // 80 + 4 = 84 → warning
        assert_eq!(mgr.status(&messages, &[]).level, BudgetLevel::Warning);
    }

    #[test]
    fn items_evicted_before_messages_low_priority_first() {
        let mgr = manager_with_limit(40);
        let messages = vec![user_msg(&"u".repeat(40)), assistant_msg(&"a".repeat(40))]; // 14 + 14

        let items = vec![
            item(ContextItemType::Insight, "keep", &"c".repeat(40)),
            item(ContextItemType::HowMightWe, "evict-first", &"c".repeat(40)),
        ];

        let outcome = mgr.truncate_to_fit(messages, items, None);
        // The derived how-might-we item goes before the insight.
        assert!(outcome.log[0].reason.contains("how_might_we"));
        assert!(outcome.removed_items >= 1);
        // Both protected messages survive.
        assert_eq!(outcome.messages.len(), 2);
    }

    #[test]
    fn lru_within_a_tier() {
        let mgr = manager_with_limit(30);
        let messages = vec![user_msg("hi")];

        let mut cold = item(ContextItemType::Insight, "cold", &"c".repeat(60));
        cold.last_used_at = Some(Utc::now() - Duration::hours(5));
        let mut warm = item(ContextItemType::Insight, "warm", &"c".repeat(60));
        warm.last_used_at = Some(Utc::now());

        let outcome = mgr.truncate_to_fit(messages, vec![warm, cold], None);
        assert!(outcome.removed_items >= 1);
        assert!(outcome.log[0].reason.contains("cold"));
    }

    #[test]
    fn protected_messages_survive_any_truncation() {
        let mgr = manager_with_limit(30);
        let old_user = user_msg(&"o".repeat(200));
        let old_assistant = assistant_msg(&"o".repeat(200));
        let recent_assistant = assistant_msg("recent answer");
        let recent_user = user_msg("latest question");

        let messages = vec![
            old_user,
            old_assistant.clone(),
            recent_assistant.clone(),
            recent_user.clone(),
        ];
        let outcome = mgr.truncate_to_fit(messages, vec![], None);

        let ids: Vec<&str> = outcome.messages.iter().map(|m| m.id.as_str()).collect();
        assert!(ids.contains(&recent_user.id.as_str()));
        assert!(ids.contains(&recent_assistant.id.as_str()));
        assert!(!ids.contains(&old_assistant.id.as_str()));
    }

    #[test]
    fn system_messages_never_removed() {
        let mgr = manager_with_limit(20);
        let system = ChatMessage::system(SessionId::from("s1"), &"s".repeat(100));
        let messages = vec![system.clone(), user_msg(&"u".repeat(100)), user_msg("last")];

        let outcome = mgr.truncate_to_fit(messages, vec![], None);
        assert!(outcome.messages.iter().any(|m| m.id == system.id));
    }

    #[test]
    fn truncation_is_idempotent() {
        let mgr = manager_with_limit(50);
        let messages: Vec<ChatMessage> = (0..6).map(|i| user_msg(&format!("message number {i} with some padding"))).collect();
        let items = vec![
            item(ContextItemType::Solution, "s1", &"x".repeat(100)),
            item(ContextItemType::Metric, "m1", &"x".repeat(100)),
        ];

        let first = mgr.truncate_to_fit(messages, items, None);
        let second = mgr.truncate_to_fit(first.messages.clone(), first.items.clone(), None);

        assert_eq!(second.removed_messages, 0);
        assert_eq!(second.removed_items, 0);
        assert_eq!(second.removed_tokens, 0);
        assert!(second.log.is_empty());
    }

    #[test]
    fn protected_pair_alone_over_limit_is_documented_edge() {
        let mgr = manager_with_limit(10);
        let messages = vec![assistant_msg(&"a".repeat(100)), user_msg(&"u".repeat(100))];

        let outcome = mgr.truncate_to_fit(messages, vec![], None);
        // Nothing removable: both messages are protected, so the result
        // stays over budget rather than dropping the live exchange.
        assert_eq!(outcome.messages.len(), 2);
        assert!(mgr.calculate(&outcome.messages, &outcome.items) > 10);
    }

    #[test]
    fn optimize_reports_without_mutating() {
        let mgr = manager_with_limit(30);
        let messages = vec![user_msg("latest")];
        let items = vec![
            item(ContextItemType::HowMightWe, "h1", &"x".repeat(100)),
            item(ContextItemType::Insight, "i1", &"x".repeat(100)),
        ];

        let report = mgr.optimize(&messages, &items, None);
        assert!(report.can_fit);
        assert!(!report.recommended_actions.is_empty());
        assert!(report.token_savings > 0);
        // Inputs untouched — optimize works on clones.
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn optimize_detects_unfittable_target() {
        let mgr = manager_with_limit(100);
        let messages = vec![user_msg(&"u".repeat(400))];
        let report = mgr.optimize(&messages, &[], Some(10));
        assert!(!report.can_fit);
    }

    #[test]
    fn truncation_deterministic() {
        let mgr = manager_with_limit(40);
        let messages = vec![user_msg(&"u".repeat(30)), user_msg("latest")];
        let items = vec![
            item(ContextItemType::Solution, "s1", &"x".repeat(80)),
            item(ContextItemType::HowMightWe, "h1", &"x".repeat(80)),
        ];

        let a = mgr.truncate_to_fit(messages.clone(), items.clone(), None);
        let b = mgr.truncate_to_fit(messages, items, None);
        assert_eq!(a.removed_items, b.removed_items);
        assert_eq!(a.removed_tokens, b.removed_tokens);
        let a_ids: Vec<_> = a.items.iter().map(|i| &i.id).collect();
        let b_ids: Vec<_> = b.items.iter().map(|i| &i.id).collect();
        assert_eq!(a_ids, b_ids);
    }
}
