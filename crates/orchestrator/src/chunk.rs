//! The streamed response chunk protocol.
//!
//! One request produces an ordered sequence of typed chunks. `Context`
//! chunks carry a stable correlation id reused from `loading` to `loaded`
//! (or `error`) so consumers reconcile by overwriting rather than
//! appending. `Message` chunks are incremental text; `Done` is always
//! terminal on success, `Error` on failure.

use loupe_core::intent::Intent;
use loupe_core::item::{ContextItem, ContextItemType};
use loupe_core::session::SessionId;
use serde::{Deserialize, Serialize};

/// Lifecycle of a context chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    Loading,
    Loaded,
    Error,
}

/// A lightweight item rendering for chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemPreview {
    pub id: String,
    pub item_type: ContextItemType,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

impl From<&ContextItem> for ItemPreview {
    fn from(item: &ContextItem) -> Self {
        Self {
            id: item.id.clone(),
            item_type: item.item_type,
            title: item.title.clone(),
            similarity: item.similarity,
        }
    }
}

/// One selectable entry in a picker chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickerEntry {
    pub item: ItemPreview,
    pub selected: bool,
}

/// A single chunk in the response stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseChunk {
    /// Request-level metadata, emitted first.
    Metadata {
        session_id: SessionId,
        message_id: String,
        intent: Intent,
        confidence: f32,
    },

    /// A context operation in progress or finished. Chunks sharing an `id`
    /// replace one another on the consumer side.
    Context {
        id: String,
        status: ContextStatus,
        title: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        items: Vec<ItemPreview>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Selectable results with per-item selection state.
    Picker {
        id: String,
        items: Vec<PickerEntry>,
        actions: Vec<String>,
        max_selectable: usize,
    },

    /// Incremental response text.
    Message { content: String },

    /// Terminal error with a retry hint.
    Error {
        code: String,
        message: String,
        retryable: bool,
    },

    /// Terminal success marker.
    Done {
        session_id: SessionId,
        message_id: String,
        tokens_used: u32,
        duration_ms: u64,
    },
}

impl ResponseChunk {
    /// Stable chunk-type name for transports that need it.
    pub fn chunk_type(&self) -> &'static str {
        match self {
            Self::Metadata { .. } => "metadata",
            Self::Context { .. } => "context",
            Self::Picker { .. } => "picker",
            Self::Message { .. } => "message",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    /// Whether this chunk ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_serialization_is_tagged() {
        let chunk = ResponseChunk::Message {
            content: "Hello".into(),
        };
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(json.contains(r#""type":"message""#));
        assert!(json.contains(r#""content":"Hello""#));
    }

    #[test]
    fn context_chunk_keeps_correlation_id() {
        let loading = ResponseChunk::Context {
            id: "corr-1".into(),
            status: ContextStatus::Loading,
            title: "Searching insights".into(),
            items: vec![],
            error: None,
        };
        let json = serde_json::to_string(&loading).unwrap();
        assert!(json.contains(r#""id":"corr-1""#));
        assert!(json.contains(r#""status":"loading""#));
        // Empty item lists are omitted from the wire format.
        assert!(!json.contains("items"));
    }

    #[test]
    fn terminal_chunks() {
        assert!(
            ResponseChunk::Error {
                code: "provider_error".into(),
                message: "x".into(),
                retryable: true
            }
            .is_terminal()
        );
        assert!(
            ResponseChunk::Done {
                session_id: SessionId::from("s1"),
                message_id: "m1".into(),
                tokens_used: 10,
                duration_ms: 5
            }
            .is_terminal()
        );
        assert!(
            !ResponseChunk::Message {
                content: "x".into()
            }
            .is_terminal()
        );
    }

    #[test]
    fn chunk_deserialization() {
        let json = r#"{"type":"error","code":"cancelled","message":"client went away","retryable":false}"#;
        let chunk: ResponseChunk = serde_json::from_str(json).unwrap();
        match chunk {
            ResponseChunk::Error { code, retryable, .. } => {
                assert_eq!(code, "cancelled");
                assert!(!retryable);
            }
            other => panic!("Wrong variant: {other:?}"),
        }
    }

    #[test]
    fn chunk_type_names() {
        let preview = ItemPreview {
            id: "i1".into(),
            item_type: ContextItemType::Insight,
            title: "t".into(),
            similarity: None,
        };
        let picker = ResponseChunk::Picker {
            id: "p1".into(),
            items: vec![PickerEntry {
                item: preview,
                selected: false,
            }],
            actions: vec!["add_to_context".into()],
            max_selectable: 10,
        };
        assert_eq!(picker.chunk_type(), "picker");
    }
}
