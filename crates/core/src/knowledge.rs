//! Knowledge store trait — the boundary to the research corpus.
//!
//! Document ingestion, chunking, and vector similarity search are external
//! collaborators; the core only needs to resolve item references for
//! hydration and to run ranked search for the retrieval handlers. An
//! unresolved reference is reported as missing by the caller, never fatal.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::item::{ContextItem, ContextItemType};

/// A search request against the knowledge store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    /// The search text
    pub text: String,

    /// Restrict results to one item type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<ContextItemType>,

    /// Maximum number of results
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            item_type: None,
            limit: default_limit(),
        }
    }

    pub fn with_type(mut self, item_type: ContextItemType) -> Self {
        self.item_type = Some(item_type);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// A ranked search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub item: ContextItem,

    /// Similarity score in [0, 1], highest first.
    pub similarity: f32,
}

/// The knowledge store boundary.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// The store name (e.g., "in_memory", "vector_db").
    fn name(&self) -> &str;

    /// Resolve one item reference to its full data, `None` if absent.
    async fn resolve(
        &self,
        item_type: ContextItemType,
        item_id: &str,
    ) -> std::result::Result<Option<ContextItem>, StoreError>;

    /// Ranked semantic/text search over the corpus.
    async fn search(&self, query: SearchQuery) -> std::result::Result<Vec<SearchHit>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_builder() {
        let q = SearchQuery::new("onboarding drop-off")
            .with_type(ContextItemType::Insight)
            .with_limit(5);
        assert_eq!(q.item_type, Some(ContextItemType::Insight));
        assert_eq!(q.limit, 5);
    }

    #[test]
    fn query_default_limit() {
        let q = SearchQuery::new("anything");
        assert_eq!(q.limit, 10);
    }
}
