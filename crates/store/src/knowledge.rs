//! In-memory knowledge store — a seedable fixture for the external corpus.
//!
//! Real deployments plug a vector-search engine in behind the
//! `KnowledgeStore` trait; this backend scores by lowercase substring
//! occurrence so retrieval paths are exercisable without an index.

use std::collections::HashMap;

use async_trait::async_trait;
use loupe_core::error::StoreError;
use loupe_core::item::{ContextItem, ContextItemType};
use loupe_core::knowledge::{KnowledgeStore, SearchHit, SearchQuery};
use tokio::sync::RwLock;

pub struct InMemoryKnowledgeStore {
    items: RwLock<HashMap<(ContextItemType, String), ContextItem>>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }

    /// Seed one item into the corpus.
    pub async fn seed(&self, item: ContextItem) {
        self.items
            .write()
            .await
            .insert((item.item_type, item.id.clone()), item);
    }

    /// Seed many items at once.
    pub async fn seed_all(&self, items: impl IntoIterator<Item = ContextItem>) {
        let mut map = self.items.write().await;
        for item in items {
            map.insert((item.item_type, item.id.clone()), item);
        }
    }

    /// Drop an item from the corpus (simulates external deletion).
    pub async fn remove(&self, item_type: ContextItemType, item_id: &str) -> bool {
        self.items
            .write()
            .await
            .remove(&(item_type, item_id.to_string()))
            .is_some()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

impl Default for InMemoryKnowledgeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn resolve(
        &self,
        item_type: ContextItemType,
        item_id: &str,
    ) -> Result<Option<ContextItem>, StoreError> {
        Ok(self
            .items
            .read()
            .await
            .get(&(item_type, item_id.to_string()))
            .cloned())
    }

    async fn search(&self, query: SearchQuery) -> Result<Vec<SearchHit>, StoreError> {
        let needle = query.text.to_lowercase();
        let items = self.items.read().await;

        let mut hits: Vec<SearchHit> = items
            .values()
            .filter(|item| query.item_type.is_none_or(|t| item.item_type == t))
            .filter_map(|item| {
                let haystack = format!(
                    "{} {}",
                    item.title.to_lowercase(),
                    item.content.as_deref().unwrap_or("").to_lowercase()
                );
                // Simple keyword relevance: how much of the query's word
                // set appears in the item.
                let words: Vec<&str> = needle.split_whitespace().collect();
                if words.is_empty() {
                    return None;
                }
                let matched = words.iter().filter(|w| haystack.contains(**w)).count();
                if matched == 0 {
                    return None;
                }
                let similarity = matched as f32 / words.len() as f32;
                Some(SearchHit {
                    item: item.clone().with_similarity(similarity),
                    similarity,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.item.id.cmp(&b.item.id))
        });
        hits.truncate(query.limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insight(id: &str, title: &str, content: &str) -> ContextItem {
        ContextItem::new(ContextItemType::Insight, id, title).with_content(content)
    }

    #[tokio::test]
    async fn resolve_seeded_item() {
        let store = InMemoryKnowledgeStore::new();
        store
            .seed(insight("i1", "Onboarding", "Users drop off at step 3"))
            .await;

        let item = store
            .resolve(ContextItemType::Insight, "i1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.title, "Onboarding");

        let missing = store.resolve(ContextItemType::Metric, "i1").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn search_ranks_by_word_overlap() {
        let store = InMemoryKnowledgeStore::new();
        store
            .seed_all([
                insight("i1", "Onboarding drop-off", "Users abandon onboarding at step 3"),
                insight("i2", "Pricing", "Users hesitate at the pricing page"),
                insight("i3", "Support", "Tickets spike on Mondays"),
            ])
            .await;

        let hits = store
            .search(SearchQuery::new("onboarding users"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].item.id, "i1"); // both words match
        assert!(hits[0].similarity > hits[1].similarity);
    }

    #[tokio::test]
    async fn search_respects_type_filter_and_limit() {
        let store = InMemoryKnowledgeStore::new();
        store
            .seed_all([
                insight("i1", "Churn insight", "churn analysis"),
                ContextItem::new(ContextItemType::Metric, "m1", "Churn rate")
                    .with_content("monthly churn 4%"),
            ])
            .await;

        let hits = store
            .search(
                SearchQuery::new("churn")
                    .with_type(ContextItemType::Metric)
                    .with_limit(1),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item.item_type, ContextItemType::Metric);
    }

    #[tokio::test]
    async fn empty_query_returns_nothing() {
        let store = InMemoryKnowledgeStore::new();
        store.seed(insight("i1", "Anything", "at all")).await;
        let hits = store.search(SearchQuery::new("   ")).await.unwrap();
        assert!(hits.is_empty());
    }
}
