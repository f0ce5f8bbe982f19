//! Message domain types.
//!
//! These are the core value objects that flow through the entire system:
//! User sends an utterance → Orchestrator classifies and dispatches →
//! Handler generates a response → Pipeline persists both turns with full
//! processing metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::intent::Intent;
use crate::item::ItemRef;
use crate::session::SessionId;

/// The role of a message sender in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions (rules, framing)
    System,
}

/// A single persisted message in a session.
///
/// Messages are immutable once persisted and ordered by `created_at` within
/// their session. An `Assistant` message always carries the intent that
/// produced it — the persistence pipeline enforces this at the type level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique message ID
    pub id: String,

    /// Parent session
    pub session_id: SessionId,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Detected (user) or assigned (assistant) intent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,

    /// Wall-clock processing duration for assistant turns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_ms: Option<u64>,

    /// Estimated token cost of the content
    pub token_count: u32,

    /// Context items actually used to produce this message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_refs: Vec<ItemRef>,

    /// Generation backend/model used (assistant turns)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Temperature setting used (assistant turns)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Error code when the turn failed (e.g. "cancelled", "provider_error")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    /// Human-readable error detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Timestamp
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a new user message.
    pub fn user(session_id: SessionId, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            role: Role::User,
            content: content.into(),
            intent: None,
            processing_ms: None,
            token_count: 0,
            context_refs: Vec::new(),
            model: None,
            temperature: None,
            error_code: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    /// Create a new assistant message. Intent is required — an assistant
    /// turn without the intent that produced it is not a valid record.
    pub fn assistant(session_id: SessionId, content: impl Into<String>, intent: Intent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            role: Role::Assistant,
            content: content.into(),
            intent: Some(intent),
            processing_ms: None,
            token_count: 0,
            context_refs: Vec::new(),
            model: None,
            temperature: None,
            error_code: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    /// Create a new system message.
    pub fn system(session_id: SessionId, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            role: Role::System,
            content: content.into(),
            intent: None,
            processing_ms: None,
            token_count: 0,
            context_refs: Vec::new(),
            model: None,
            temperature: None,
            error_code: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

/// Query options for listing session messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageQuery {
    /// Maximum number of messages to return
    #[serde(default = "default_limit")]
    pub limit: usize,

    /// Number of messages to skip
    #[serde(default)]
    pub offset: usize,

    /// Chronological (`true`, default) or reverse order
    #[serde(default = "default_ascending")]
    pub ascending: bool,

    /// Only messages created strictly after this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<DateTime<Utc>>,

    /// Only messages created strictly before this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<DateTime<Utc>>,
}

fn default_limit() -> usize {
    50
}

fn default_ascending() -> bool {
    true
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            offset: 0,
            ascending: true,
            after: None,
            before: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ContextItemType;

    #[test]
    fn create_user_message() {
        let msg = ChatMessage::user(SessionId::from("s1"), "Hello, Loupe!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello, Loupe!");
        assert!(msg.intent.is_none());
    }

    #[test]
    fn assistant_message_carries_intent() {
        let msg = ChatMessage::assistant(
            SessionId::from("s1"),
            "Here are your insights.",
            Intent::RetrieveInsights,
        );
        assert_eq!(msg.intent, Some(Intent::RetrieveInsights));
    }

    #[test]
    fn message_serialization_roundtrip() {
        let mut msg = ChatMessage::user(SessionId::from("s1"), "Test message");
        msg.context_refs
            .push(ItemRef::new(ContextItemType::Insight, "i1"));
        msg.token_count = 12;

        let json = serde_json::to_string(&msg).unwrap();
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.content, "Test message");
        assert_eq!(back.token_count, 12);
        assert_eq!(back.context_refs.len(), 1);
    }

    #[test]
    fn query_defaults() {
        let q = MessageQuery::default();
        assert_eq!(q.limit, 50);
        assert_eq!(q.offset, 0);
        assert!(q.ascending);
        assert!(q.after.is_none());
    }
}
