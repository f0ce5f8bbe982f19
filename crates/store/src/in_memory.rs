//! In-memory backend — useful for testing and ephemeral sessions.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loupe_core::error::StoreError;
use loupe_core::message::{ChatMessage, MessageQuery};
use loupe_core::session::{SelectedRefs, Session, SessionId, SessionStatus};
use loupe_core::store::{MessageStore, SessionStore, UsageStore};
use loupe_core::usage::{ItemUsageStats, UsageEvent};
use tokio::sync::RwLock;
use uuid::Uuid;

/// One backend implementing all three storage traits over `RwLock` maps.
///
/// Sessions, messages, and usage events live in independent maps so reads
/// of one kind never contend with writes of another.
pub struct InMemoryStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
    messages: RwLock<HashMap<SessionId, Vec<ChatMessage>>>,
    usage_events: RwLock<Vec<UsageEvent>>,
    usage_stats: RwLock<HashMap<String, ItemUsageStats>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            usage_events: RwLock::new(Vec::new()),
            usage_stats: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create(&self, session: Session) -> Result<SessionId, StoreError> {
        let id = session.id.clone();
        self.sessions.write().await.insert(id.clone(), session);
        Ok(id)
    }

    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn save_refs(&self, id: &SessionId, refs: &SelectedRefs) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::Storage(format!("session {id} not found")))?;
        session.selected = refs.clone();
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn set_status(&self, id: &SessionId, status: SessionStatus) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::Storage(format!("session {id} not found")))?;
        session.status = status;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn set_title(&self, id: &SessionId, title: &str) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::Storage(format!("session {id} not found")))?;
        session.title = Some(title.to_string());
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn add_token_usage(&self, id: &SessionId, tokens: u64) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::Storage(format!("session {id} not found")))?;
        session.total_tokens_used += tokens;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError> {
        let sessions = self.sessions.read().await;
        let mut result: Vec<Session> = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(result)
    }

    async fn purge_archived(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| {
            !(s.status == SessionStatus::Archived && s.updated_at < older_than)
        });
        Ok(before - sessions.len())
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn append(&self, mut message: ChatMessage) -> Result<String, StoreError> {
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        let id = message.id.clone();
        self.messages
            .write()
            .await
            .entry(message.session_id.clone())
            .or_default()
            .push(message);
        Ok(id)
    }

    async fn list(
        &self,
        session_id: &SessionId,
        query: &MessageQuery,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self.messages.read().await;
        let mut result: Vec<ChatMessage> = messages
            .get(session_id)
            .map(|v| v.as_slice())
            .unwrap_or_default()
            .iter()
            .filter(|m| query.after.is_none_or(|t| m.created_at > t))
            .filter(|m| query.before.is_none_or(|t| m.created_at < t))
            .cloned()
            .collect();

        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if !query.ascending {
            result.reverse();
        }
        Ok(result
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn count(&self, session_id: &SessionId) -> Result<usize, StoreError> {
        Ok(self
            .messages
            .read()
            .await
            .get(session_id)
            .map_or(0, Vec::len))
    }
}

#[async_trait]
impl UsageStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn append(&self, event: UsageEvent) -> Result<(), StoreError> {
        {
            let mut stats = self.usage_stats.write().await;
            for item in &event.items {
                stats
                    .entry(item.item_ref.item_id.clone())
                    .or_default()
                    .record(item.utilization, event.intent, event.created_at);
            }
        }
        self.usage_events.write().await.push(event);
        Ok(())
    }

    async fn stats(&self, item_id: &str) -> Result<Option<ItemUsageStats>, StoreError> {
        Ok(self.usage_stats.read().await.get(item_id).cloned())
    }

    async fn events_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<UsageEvent>, StoreError> {
        Ok(self
            .usage_events
            .read()
            .await
            .iter()
            .filter(|e| &e.session_id == session_id)
            .cloned()
            .collect())
    }
}
