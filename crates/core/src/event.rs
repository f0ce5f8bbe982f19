//! Context events — typed notifications from the context state manager.
//!
//! Every mutating context operation emits an event after its state is
//! persisted. Delivery to subscribers is fire-and-forget relative to the
//! triggering operation; the subscription machinery lives in
//! `loupe-context`, these are the value objects on the channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::item::ContextItemType;
use crate::session::SessionId;

/// What changed in a `ContextUpdated` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextChange {
    Added,
    Removed,
    Cleared,
}

/// The kind of context event, with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// The selected-item set changed.
    ContextUpdated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_type: Option<ContextItemType>,
        change: ContextChange,
        /// Selected item count after the change.
        count: usize,
    },

    /// A validation pass found invalid references.
    ContextValidated { invalid_count: usize },

    /// A usage event was recorded for a message.
    UsageRecorded {
        message_id: String,
        item_count: usize,
    },
}

impl EventKind {
    /// Stable name for filtering subscriptions.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ContextUpdated { .. } => "context_updated",
            Self::ContextValidated { .. } => "context_validated",
            Self::UsageRecorded { .. } => "usage_recorded",
        }
    }
}

/// One event on a session's context channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEvent {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub kind: EventKind,
    pub at: DateTime<Utc>,
}

impl ContextEvent {
    pub fn new(session_id: SessionId, kind: EventKind) -> Self {
        Self {
            session_id,
            kind,
            at: Utc::now(),
        }
    }
}
