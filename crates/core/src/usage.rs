//! Usage events — longitudinal effectiveness tracking for context items.
//!
//! A usage event links one message to the context items that contributed to
//! it, with a per-item utilization score. Events are append-only and never
//! mutate the items they reference; per-item statistics are derived.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::intent::Intent;
use crate::item::ItemRef;
use crate::session::SessionId;

/// How strongly one context item contributed to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemUtilization {
    pub item_ref: ItemRef,

    /// Utilization score, clamped to [0, 1].
    pub utilization: f32,
}

impl ItemUtilization {
    pub fn new(item_ref: ItemRef, utilization: f32) -> Self {
        Self {
            item_ref,
            utilization: utilization.clamp(0.0, 1.0),
        }
    }
}

/// An append-only record linking one message to the items it used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: String,
    pub session_id: SessionId,
    pub message_id: String,
    pub intent: Intent,
    #[serde(default)]
    pub items: Vec<ItemUtilization>,
    pub created_at: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(
        session_id: SessionId,
        message_id: impl Into<String>,
        intent: Intent,
        items: Vec<ItemUtilization>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            message_id: message_id.into(),
            intent,
            items,
            created_at: Utc::now(),
        }
    }
}

/// Derived per-item usage statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemUsageStats {
    /// How many usage events referenced the item
    pub total_uses: u64,

    /// Mean utilization across all uses
    pub avg_utilization: f32,

    /// Most recent use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,

    /// Distinct intents the item has served, in first-seen order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub intents: Vec<Intent>,
}

impl ItemUsageStats {
    /// Fold one more observation into the running statistics.
    pub fn record(&mut self, utilization: f32, intent: Intent, at: DateTime<Utc>) {
        let prior_total = self.avg_utilization * self.total_uses as f32;
        self.total_uses += 1;
        self.avg_utilization = (prior_total + utilization.clamp(0.0, 1.0)) / self.total_uses as f32;
        if self.last_used_at.is_none_or(|prev| at > prev) {
            self.last_used_at = Some(at);
        }
        if !self.intents.contains(&intent) {
            self.intents.push(intent);
        }
    }
}
