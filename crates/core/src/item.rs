//! Context item domain types.
//!
//! A context item is one unit of prior knowledge — a document, an interview
//! insight, a job-to-be-done, or a metric — plus the derived types produced
//! by generation ("how might we" questions and candidate solutions). Items
//! are exclusively referenced by one session's context state at a time;
//! content lives in the knowledge store and is hydrated on demand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The type tag of a context item.
///
/// `HowMightWe` and `Solution` are derived types: they are produced by the
/// generation handlers rather than ingested from the research corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextItemType {
    Document,
    Insight,
    JobToBeDone,
    Metric,
    HowMightWe,
    Solution,
}

impl ContextItemType {
    /// All item types, in declaration order.
    pub const ALL: [ContextItemType; 6] = [
        ContextItemType::Document,
        ContextItemType::Insight,
        ContextItemType::JobToBeDone,
        ContextItemType::Metric,
        ContextItemType::HowMightWe,
        ContextItemType::Solution,
    ];

    /// The snake_case tag used on the wire and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Insight => "insight",
            Self::JobToBeDone => "job_to_be_done",
            Self::Metric => "metric",
            Self::HowMightWe => "how_might_we",
            Self::Solution => "solution",
        }
    }

    /// Parse a storage/wire tag back into a type.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for ContextItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A lightweight reference to a context item: type + id.
///
/// This is what sessions persist; full content is hydrated from the
/// knowledge store when needed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemRef {
    pub item_type: ContextItemType,
    pub item_id: String,
}

impl ItemRef {
    pub fn new(item_type: ContextItemType, item_id: impl Into<String>) -> Self {
        Self {
            item_type,
            item_id: item_id.into(),
        }
    }
}

impl std::fmt::Display for ItemRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.item_type, self.item_id)
    }
}

/// A context item with (optionally hydrated) content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    /// Unique item ID
    pub id: String,

    /// Item type tag
    pub item_type: ContextItemType,

    /// Display title
    pub title: String,

    /// Full content — `None` until hydrated from the knowledge store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Similarity score; only meaningful when the item arrived via
    /// semantic search
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,

    /// Arbitrary metadata (source, generation attributes, etc.)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// When the item was added to a session's selection
    pub added_at: DateTime<Utc>,

    /// When the item was last used by a generation call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ContextItem {
    /// Create a bare item with no content (an unhydrated reference).
    pub fn new(item_type: ContextItemType, id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            item_type,
            title: title.into(),
            content: None,
            similarity: None,
            metadata: serde_json::Map::new(),
            added_at: Utc::now(),
            last_used_at: None,
        }
    }

    /// The reference for this item.
    pub fn item_ref(&self) -> ItemRef {
        ItemRef::new(self.item_type, self.id.clone())
    }

    /// Attach hydrated content.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Attach a similarity score from semantic search.
    pub fn with_similarity(mut self, similarity: f32) -> Self {
        self.similarity = Some(similarity);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tag_roundtrip() {
        for t in ContextItemType::ALL {
            assert_eq!(ContextItemType::parse(t.as_str()), Some(t));
        }
        assert_eq!(ContextItemType::parse("nope"), None);
    }

    #[test]
    fn type_serde_uses_snake_case() {
        let json = serde_json::to_string(&ContextItemType::JobToBeDone).unwrap();
        assert_eq!(json, r#""job_to_be_done""#);
        let json = serde_json::to_string(&ContextItemType::HowMightWe).unwrap();
        assert_eq!(json, r#""how_might_we""#);
    }

    #[test]
    fn item_ref_display() {
        let r = ItemRef::new(ContextItemType::Metric, "m-42");
        assert_eq!(r.to_string(), "metric:m-42");
    }

    #[test]
    fn hydration_builders() {
        let item = ContextItem::new(ContextItemType::Insight, "i1", "Drop-off insight")
            .with_content("Users abandon onboarding at step 3")
            .with_similarity(0.91);
        assert_eq!(item.content.as_deref(), Some("Users abandon onboarding at step 3"));
        assert_eq!(item.similarity, Some(0.91));
        assert_eq!(item.item_ref(), ItemRef::new(ContextItemType::Insight, "i1"));
    }
}
