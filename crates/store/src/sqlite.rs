//! SQLite backend — durable sessions, message log, and usage events.
//!
//! One database file, four tables:
//! - `sessions` — session state with the selected-ref sets as JSON
//! - `messages` — the append-only message log, indexed by (session, time)
//! - `usage_events` — append-only usage records with utilization JSON
//! - `usage_stats` — per-item running aggregates, updated on append

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loupe_core::error::StoreError;
use loupe_core::intent::Intent;
use loupe_core::item::ItemRef;
use loupe_core::message::{ChatMessage, MessageQuery, Role};
use loupe_core::session::{SelectedRefs, Session, SessionId, SessionStatus};
use loupe_core::store::{MessageStore, SessionStore, UsageStore};
use loupe_core::usage::{ItemUsageStats, ItemUtilization, UsageEvent};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

/// A durable SQLite store implementing all three storage traits.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store from a file path.
    ///
    /// The database and all tables/indexes are created automatically.
    /// Pass `":memory:"` for an in-process ephemeral database (useful for
    /// tests).
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        // An in-memory database exists per connection, so the pool must
        // stay at one connection for `:memory:` to behave like one store.
        let max_connections = if path.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id                TEXT PRIMARY KEY,
                user_id           TEXT NOT NULL,
                title             TEXT,
                status            TEXT NOT NULL,
                created_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL,
                total_tokens_used INTEGER NOT NULL DEFAULT 0,
                selected          TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("sessions table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id            TEXT PRIMARY KEY,
                session_id    TEXT NOT NULL,
                role          TEXT NOT NULL,
                content       TEXT NOT NULL,
                intent        TEXT,
                processing_ms INTEGER,
                token_count   INTEGER NOT NULL DEFAULT 0,
                context_refs  TEXT NOT NULL DEFAULT '[]',
                model         TEXT,
                temperature   REAL,
                error_code    TEXT,
                error_message TEXT,
                created_at    TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("messages table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_session_time
             ON messages(session_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("messages index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_events (
                id         TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                intent     TEXT NOT NULL,
                items      TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("usage_events table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_stats (
                item_id         TEXT PRIMARY KEY,
                total_uses      INTEGER NOT NULL DEFAULT 0,
                avg_utilization REAL NOT NULL DEFAULT 0.0,
                last_used_at    TEXT,
                intents         TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("usage_stats table: {e}")))?;

        Ok(())
    }

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<Session, StoreError> {
        let status: String = row.get("status");
        let status = match status.as_str() {
            "active" => SessionStatus::Active,
            "archived" => SessionStatus::Archived,
            "deleted" => SessionStatus::Deleted,
            other => return Err(StoreError::QueryFailed(format!("bad status: {other}"))),
        };
        let selected: String = row.get("selected");
        let selected: SelectedRefs = serde_json::from_str(&selected)
            .map_err(|e| StoreError::QueryFailed(format!("bad selected refs: {e}")))?;

        Ok(Session {
            id: SessionId(row.get("id")),
            user_id: row.get("user_id"),
            title: row.get("title"),
            status,
            created_at: parse_time(&row.get::<String, _>("created_at"))?,
            updated_at: parse_time(&row.get::<String, _>("updated_at"))?,
            total_tokens_used: row.get::<i64, _>("total_tokens_used") as u64,
            selected,
        })
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<ChatMessage, StoreError> {
        let role: String = row.get("role");
        let role = match role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "system" => Role::System,
            other => return Err(StoreError::QueryFailed(format!("bad role: {other}"))),
        };
        let intent: Option<String> = row.get("intent");
        let context_refs: String = row.get("context_refs");
        let context_refs: Vec<ItemRef> = serde_json::from_str(&context_refs)
            .map_err(|e| StoreError::QueryFailed(format!("bad context refs: {e}")))?;

        Ok(ChatMessage {
            id: row.get("id"),
            session_id: SessionId(row.get("session_id")),
            role,
            content: row.get("content"),
            intent: intent.as_deref().and_then(Intent::parse),
            processing_ms: row.get::<Option<i64>, _>("processing_ms").map(|v| v as u64),
            token_count: row.get::<i64, _>("token_count") as u32,
            context_refs,
            model: row.get("model"),
            temperature: row.get("temperature"),
            error_code: row.get("error_code"),
            error_message: row.get("error_message"),
            created_at: parse_time(&row.get::<String, _>("created_at"))?,
        })
    }

    async fn touch_session(&self, id: &SessionId) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE sessions SET updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(to_storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Storage(format!("session {id} not found")));
        }
        Ok(())
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::QueryFailed(format!("bad timestamp '{s}': {e}")))
}

fn to_storage(e: sqlx::Error) -> StoreError {
    StoreError::Storage(e.to_string())
}

#[async_trait]
impl SessionStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create(&self, session: Session) -> Result<SessionId, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, user_id, title, status, created_at, updated_at, total_tokens_used, selected)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&session.id.0)
        .bind(&session.user_id)
        .bind(&session.title)
        .bind(session.status.to_string())
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .bind(session.total_tokens_used as i64)
        .bind(serde_json::to_string(&session.selected).map_err(|e| StoreError::Storage(e.to_string()))?)
        .execute(&self.pool)
        .await
        .map_err(to_storage)?;
        Ok(session.id)
    }

    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_storage)?;
        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn save_refs(&self, id: &SessionId, refs: &SelectedRefs) -> Result<(), StoreError> {
        let json = serde_json::to_string(refs).map_err(|e| StoreError::Storage(e.to_string()))?;
        let result = sqlx::query("UPDATE sessions SET selected = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(json)
            .bind(Utc::now().to_rfc3339())
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(to_storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Storage(format!("session {id} not found")));
        }
        Ok(())
    }

    async fn set_status(&self, id: &SessionId, status: SessionStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(to_storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Storage(format!("session {id} not found")));
        }
        Ok(())
    }

    async fn set_title(&self, id: &SessionId, title: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE sessions SET title = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(title)
            .bind(Utc::now().to_rfc3339())
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(to_storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Storage(format!("session {id} not found")));
        }
        Ok(())
    }

    async fn add_token_usage(&self, id: &SessionId, tokens: u64) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET total_tokens_used = total_tokens_used + ?1 WHERE id = ?2")
            .bind(tokens as i64)
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(to_storage)?;
        self.touch_session(id).await
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE user_id = ?1 ORDER BY updated_at DESC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(to_storage)?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn purge_archived(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let result =
            sqlx::query("DELETE FROM sessions WHERE status = 'archived' AND updated_at < ?1")
                .bind(older_than.to_rfc3339())
                .execute(&self.pool)
                .await
                .map_err(to_storage)?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append(&self, mut message: ChatMessage) -> Result<String, StoreError> {
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        sqlx::query(
            r#"
            INSERT INTO messages
                (id, session_id, role, content, intent, processing_ms, token_count,
                 context_refs, model, temperature, error_code, error_message, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&message.id)
        .bind(&message.session_id.0)
        .bind(match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        })
        .bind(&message.content)
        .bind(message.intent.map(|i| i.as_str()))
        .bind(message.processing_ms.map(|v| v as i64))
        .bind(message.token_count as i64)
        .bind(
            serde_json::to_string(&message.context_refs)
                .map_err(|e| StoreError::Storage(e.to_string()))?,
        )
        .bind(&message.model)
        .bind(message.temperature)
        .bind(&message.error_code)
        .bind(&message.error_message)
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(to_storage)?;
        Ok(message.id)
    }

    async fn list(
        &self,
        session_id: &SessionId,
        query: &MessageQuery,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let order = if query.ascending { "ASC" } else { "DESC" };
        let sql = format!(
            "SELECT * FROM messages
             WHERE session_id = ?1
               AND (?2 IS NULL OR created_at > ?2)
               AND (?3 IS NULL OR created_at < ?3)
             ORDER BY created_at {order}
             LIMIT ?4 OFFSET ?5"
        );
        let rows = sqlx::query(&sql)
            .bind(&session_id.0)
            .bind(query.after.map(|t| t.to_rfc3339()))
            .bind(query.before.map(|t| t.to_rfc3339()))
            .bind(query.limit as i64)
            .bind(query.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(to_storage)?;
        rows.iter().map(Self::row_to_message).collect()
    }

    async fn count(&self, session_id: &SessionId) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM messages WHERE session_id = ?1")
            .bind(&session_id.0)
            .fetch_one(&self.pool)
            .await
            .map_err(to_storage)?;
        Ok(row.get::<i64, _>("cnt") as usize)
    }
}

#[async_trait]
impl UsageStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append(&self, event: UsageEvent) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(to_storage)?;

        sqlx::query(
            "INSERT INTO usage_events (id, session_id, message_id, intent, items, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&event.id)
        .bind(&event.session_id.0)
        .bind(&event.message_id)
        .bind(event.intent.as_str())
        .bind(
            serde_json::to_string(&event.items)
                .map_err(|e| StoreError::Storage(e.to_string()))?,
        )
        .bind(event.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(to_storage)?;

        // Fold each utilization into the per-item running aggregate.
        for item in &event.items {
            let row = sqlx::query("SELECT * FROM usage_stats WHERE item_id = ?1")
                .bind(&item.item_ref.item_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(to_storage)?;

            let mut stats = match row {
                Some(row) => {
                    let intents: String = row.get("intents");
                    let intents: Vec<String> = serde_json::from_str(&intents)
                        .map_err(|e| StoreError::QueryFailed(e.to_string()))?;
                    ItemUsageStats {
                        total_uses: row.get::<i64, _>("total_uses") as u64,
                        avg_utilization: row.get::<f64, _>("avg_utilization") as f32,
                        last_used_at: row
                            .get::<Option<String>, _>("last_used_at")
                            .as_deref()
                            .map(parse_time)
                            .transpose()?,
                        intents: intents.iter().filter_map(|s| Intent::parse(s)).collect(),
                    }
                }
                None => ItemUsageStats::default(),
            };
            stats.record(item.utilization, event.intent, event.created_at);

            let intents: Vec<&str> = stats.intents.iter().map(Intent::as_str).collect();
            sqlx::query(
                "INSERT INTO usage_stats (item_id, total_uses, avg_utilization, last_used_at, intents)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(item_id) DO UPDATE SET
                    total_uses = excluded.total_uses,
                    avg_utilization = excluded.avg_utilization,
                    last_used_at = excluded.last_used_at,
                    intents = excluded.intents",
            )
            .bind(&item.item_ref.item_id)
            .bind(stats.total_uses as i64)
            .bind(stats.avg_utilization as f64)
            .bind(stats.last_used_at.map(|t| t.to_rfc3339()))
            .bind(serde_json::to_string(&intents).map_err(|e| StoreError::Storage(e.to_string()))?)
            .execute(&mut *tx)
            .await
            .map_err(to_storage)?;
        }

        tx.commit().await.map_err(to_storage)
    }

    async fn stats(&self, item_id: &str) -> Result<Option<ItemUsageStats>, StoreError> {
        let row = sqlx::query("SELECT * FROM usage_stats WHERE item_id = ?1")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_storage)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let intents: String = row.get("intents");
        let intents: Vec<String> =
            serde_json::from_str(&intents).map_err(|e| StoreError::QueryFailed(e.to_string()))?;
        Ok(Some(ItemUsageStats {
            total_uses: row.get::<i64, _>("total_uses") as u64,
            avg_utilization: row.get::<f64, _>("avg_utilization") as f32,
            last_used_at: row
                .get::<Option<String>, _>("last_used_at")
                .as_deref()
                .map(parse_time)
                .transpose()?,
            intents: intents.iter().filter_map(|s| Intent::parse(s)).collect(),
        }))
    }

    async fn events_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<UsageEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM usage_events WHERE session_id = ?1 ORDER BY created_at ASC",
        )
        .bind(&session_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(to_storage)?;

        rows.iter()
            .map(|row| {
                let intent: String = row.get("intent");
                let items: String = row.get("items");
                let items: Vec<ItemUtilization> = serde_json::from_str(&items)
                    .map_err(|e| StoreError::QueryFailed(e.to_string()))?;
                Ok(UsageEvent {
                    id: row.get("id"),
                    session_id: SessionId(row.get("session_id")),
                    message_id: row.get("message_id"),
                    intent: Intent::parse(&intent).unwrap_or_default(),
                    items,
                    created_at: parse_time(&row.get::<String, _>("created_at"))?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loupe_core::item::ContextItemType;

    async fn test_store() -> SqliteStore {
        SqliteStore::new(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn session_roundtrip() {
        let store = test_store().await;
        let mut session = Session::new("user-1");
        session.selected.insert(ItemRef::new(ContextItemType::Insight, "i1"));
        let id = SessionStore::create(&store, session).await.unwrap();

        let loaded = SessionStore::get(&store, &id).await.unwrap().unwrap();
        assert_eq!(loaded.user_id, "user-1");
        assert_eq!(loaded.selected.total(), 1);
        assert_eq!(loaded.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn missing_session_is_none() {
        let store = test_store().await;
        let loaded = SessionStore::get(&store, &SessionId::from("nope")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn save_refs_rejects_unknown_session() {
        let store = test_store().await;
        let refs = SelectedRefs::new();
        let result = store.save_refs(&SessionId::from("ghost"), &refs).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn message_roundtrip_preserves_metadata() {
        let store = test_store().await;
        let session_id = SessionId::from("s1");

        let mut msg = ChatMessage::assistant(
            session_id.clone(),
            "Here are the insights.",
            Intent::RetrieveInsights,
        );
        msg.token_count = 42;
        msg.processing_ms = Some(1234);
        msg.model = Some("structured-v1".into());
        msg.temperature = Some(0.7);
        msg.context_refs.push(ItemRef::new(ContextItemType::Insight, "i1"));

        let id = MessageStore::append(&store, msg).await.unwrap();
        let messages = store.list(&session_id, &MessageQuery::default()).await.unwrap();

        assert_eq!(messages.len(), 1);
        let loaded = &messages[0];
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.content, "Here are the insights.");
        assert_eq!(loaded.intent, Some(Intent::RetrieveInsights));
        assert_eq!(loaded.token_count, 42);
        assert_eq!(loaded.processing_ms, Some(1234));
        assert_eq!(loaded.context_refs.len(), 1);
    }

    #[tokio::test]
    async fn message_pagination_and_ordering() {
        let store = test_store().await;
        let session_id = SessionId::from("s1");

        for i in 0..5 {
            let mut msg = ChatMessage::user(session_id.clone(), format!("m{i}"));
            msg.created_at = Utc::now() + chrono::Duration::milliseconds(i * 10);
            MessageStore::append(&store, msg).await.unwrap();
        }

        assert_eq!(MessageStore::count(&store, &session_id).await.unwrap(), 5);

        let page = store
            .list(
                &session_id,
                &MessageQuery {
                    limit: 2,
                    offset: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "m2");

        let newest = store
            .list(
                &session_id,
                &MessageQuery {
                    ascending: false,
                    limit: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(newest[0].content, "m4");
    }

    #[tokio::test]
    async fn purge_archived_sessions() {
        let store = test_store().await;
        let mut session = Session::new("user-1");
        session.updated_at = Utc::now() - chrono::Duration::days(45);
        let id = SessionStore::create(&store, session).await.unwrap();
        // set_status touches updated_at, so archive first, then backdate.
        sqlx::query("UPDATE sessions SET status = 'archived', updated_at = ?1 WHERE id = ?2")
            .bind((Utc::now() - chrono::Duration::days(45)).to_rfc3339())
            .bind(&id.0)
            .execute(&store.pool)
            .await
            .unwrap();

        let purged = store
            .purge_archived(Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);
    }

    #[tokio::test]
    async fn usage_event_aggregation() {
        let store = test_store().await;
        let session_id = SessionId::from("s1");

        for (util, intent) in [(0.8, Intent::RetrieveInsights), (0.4, Intent::CreateSolutions)] {
            let event = UsageEvent::new(
                session_id.clone(),
                "m1",
                intent,
                vec![ItemUtilization::new(
                    ItemRef::new(ContextItemType::Metric, "m-7"),
                    util,
                )],
            );
            UsageStore::append(&store, event).await.unwrap();
        }

        let stats = UsageStore::stats(&store, "m-7").await.unwrap().unwrap();
        assert_eq!(stats.total_uses, 2);
        assert!((stats.avg_utilization - 0.6).abs() < 1e-6);
        assert_eq!(stats.intents.len(), 2);
        assert!(stats.last_used_at.is_some());

        let events = store.events_for_session(&session_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].items.len(), 1);
    }
}
