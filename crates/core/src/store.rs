//! Storage traits — sessions, the append-only message log, usage events.
//!
//! Implementations: in-memory (tests, ephemeral runs) and SQLite, both in
//! `loupe-store`. All traits are object-safe so managers hold
//! `Arc<dyn ...>` and backends swap via configuration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::message::{ChatMessage, MessageQuery};
use crate::session::{SelectedRefs, Session, SessionId, SessionStatus};
use crate::usage::{ItemUsageStats, UsageEvent};

/// Session persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The backend name (e.g., "in_memory", "sqlite").
    fn name(&self) -> &str;

    /// Persist a new session.
    async fn create(&self, session: Session) -> std::result::Result<SessionId, StoreError>;

    /// Load a session by id.
    async fn get(&self, id: &SessionId) -> std::result::Result<Option<Session>, StoreError>;

    /// Replace a session's selected-item references.
    async fn save_refs(
        &self,
        id: &SessionId,
        refs: &SelectedRefs,
    ) -> std::result::Result<(), StoreError>;

    /// Update lifecycle status.
    async fn set_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
    ) -> std::result::Result<(), StoreError>;

    /// Set the session title.
    async fn set_title(&self, id: &SessionId, title: &str) -> std::result::Result<(), StoreError>;

    /// Add to the session's cumulative token usage.
    async fn add_token_usage(
        &self,
        id: &SessionId,
        tokens: u64,
    ) -> std::result::Result<(), StoreError>;

    /// All sessions owned by a user, most recently updated first.
    async fn list_for_user(&self, user_id: &str)
    -> std::result::Result<Vec<Session>, StoreError>;

    /// Delete archived sessions untouched since `older_than`.
    /// Returns the number purged.
    async fn purge_archived(
        &self,
        older_than: DateTime<Utc>,
    ) -> std::result::Result<usize, StoreError>;
}

/// The append-only message log.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// The backend name.
    fn name(&self) -> &str;

    /// Append a message. Returns its id.
    async fn append(&self, message: ChatMessage) -> std::result::Result<String, StoreError>;

    /// List a session's messages with pagination, ordering, and
    /// time-window filters.
    async fn list(
        &self,
        session_id: &SessionId,
        query: &MessageQuery,
    ) -> std::result::Result<Vec<ChatMessage>, StoreError>;

    /// Total messages in a session.
    async fn count(&self, session_id: &SessionId) -> std::result::Result<usize, StoreError>;
}

/// Append-only usage events with derived per-item statistics.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// The backend name.
    fn name(&self) -> &str;

    /// Append a usage event.
    async fn append(&self, event: UsageEvent) -> std::result::Result<(), StoreError>;

    /// Derived statistics for one item, `None` if never used.
    async fn stats(
        &self,
        item_id: &str,
    ) -> std::result::Result<Option<ItemUsageStats>, StoreError>;

    /// All events recorded for a session, oldest first.
    async fn events_for_session(
        &self,
        session_id: &SessionId,
    ) -> std::result::Result<Vec<UsageEvent>, StoreError>;
}
