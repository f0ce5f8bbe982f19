//! The per-session context state manager.

use std::collections::HashMap;
use std::sync::Arc;

use loupe_core::error::{ContextError, StoreError};
use loupe_core::event::{ContextChange, ContextEvent, EventKind};
use loupe_core::item::{ContextItem, ContextItemType, ItemRef};
use loupe_core::knowledge::KnowledgeStore;
use loupe_core::policy::{CachePolicy, SelectionLimits};
use loupe_core::session::{Session, SessionId};
use loupe_core::store::{SessionStore, UsageStore};
use loupe_core::usage::UsageEvent;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::cache::SessionCache;
use crate::events::{EventHandler, SubscriberRegistry, SubscriptionId};

/// How hydrated items should be ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Most recently used (falling back to most recently added) first
    Recency,
    /// Most used first (requires usage enrichment)
    Usage,
    /// Highest similarity first
    Similarity,
    /// Alphabetical by title
    Title,
}

/// Options for [`ContextStateManager::hydrate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HydrateOptions {
    /// Enrich items with usage statistics from the usage store.
    pub include_usage: bool,
    /// Optional ordering of the hydrated items.
    pub sort: Option<SortOrder>,
}

/// A fully hydrated context state.
#[derive(Debug, Clone)]
pub struct HydratedContext {
    pub session: Session,
    /// Items with content loaded from the knowledge store.
    pub items: Vec<ContextItem>,
    /// References that could not be resolved — reported, not fatal.
    pub missing: Vec<ItemRef>,
}

impl HydratedContext {
    pub fn item_count(&self) -> usize {
        self.items.len()
    }
}

/// Result of a read-only validation pass.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub valid: usize,
    pub invalid: Vec<ItemRef>,
}

/// Owns the selected-item state for every session.
///
/// Constructed once at process start with explicit dependencies and shared
/// by reference — never a global.
pub struct ContextStateManager {
    sessions: Arc<dyn SessionStore>,
    knowledge: Arc<dyn KnowledgeStore>,
    usage: Arc<dyn UsageStore>,
    limits: SelectionLimits,
    cache: SessionCache,
    subscribers: Arc<SubscriberRegistry>,
    /// One writer lock per session; mutations serialize, reads do not.
    write_locks: RwLock<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl ContextStateManager {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        knowledge: Arc<dyn KnowledgeStore>,
        usage: Arc<dyn UsageStore>,
        limits: SelectionLimits,
        cache_policy: CachePolicy,
    ) -> Self {
        Self {
            sessions,
            knowledge,
            usage,
            limits,
            cache: SessionCache::new(&cache_policy),
            subscribers: Arc::new(SubscriberRegistry::new()),
            write_locks: RwLock::new(HashMap::new()),
        }
    }

    // ── Selection mutations ───────────────────────────────────────────────

    /// Select an item for a session.
    ///
    /// Fails with `AlreadySelected`, `LimitExceeded` (total or per-type
    /// ceiling), `ItemNotFound` (unresolvable in the knowledge store), or
    /// `SessionNotFound`. On success the updated reference set is
    /// persisted, the cached snapshot invalidated, and a `context_updated`
    /// event emitted.
    pub async fn add(
        &self,
        session_id: &SessionId,
        item_type: ContextItemType,
        item_id: &str,
    ) -> Result<(), ContextError> {
        let lock = self.writer_lock(session_id).await;
        let _guard = lock.lock().await;

        let mut session = self.load_session(session_id).await?;
        let item_ref = ItemRef::new(item_type, item_id);

        if session.selected.contains(&item_ref) {
            return Err(ContextError::AlreadySelected {
                item_type,
                item_id: item_id.to_string(),
            });
        }
        if session.selected.total() + 1 > self.limits.max_total {
            return Err(ContextError::LimitExceeded {
                scope: "total".into(),
                limit: self.limits.max_total,
                attempted: session.selected.total() + 1,
            });
        }
        if session.selected.count(item_type) + 1 > self.limits.max_per_type {
            return Err(ContextError::LimitExceeded {
                scope: item_type.to_string(),
                limit: self.limits.max_per_type,
                attempted: session.selected.count(item_type) + 1,
            });
        }

        // The reference must resolve before it can be selected.
        match self.knowledge.resolve(item_type, item_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(ContextError::ItemNotFound {
                    item_type,
                    item_id: item_id.to_string(),
                });
            }
            Err(e) => return Err(ContextError::Storage(e.to_string())),
        }

        session.selected.insert(item_ref);
        let count = session.selected.total();
        self.persist_refs(&session).await?;

        debug!(session_id = %session_id, item_type = %item_type, item_id, "Context item added");
        self.emit(ContextEvent::new(
            session_id.clone(),
            EventKind::ContextUpdated {
                item_type: Some(item_type),
                change: ContextChange::Added,
                count,
            },
        ))
        .await;
        Ok(())
    }

    /// Deselect an item. Fails with `ItemNotFound` if it is not selected.
    pub async fn remove(
        &self,
        session_id: &SessionId,
        item_type: ContextItemType,
        item_id: &str,
    ) -> Result<(), ContextError> {
        let lock = self.writer_lock(session_id).await;
        let _guard = lock.lock().await;

        let mut session = self.load_session(session_id).await?;
        let item_ref = ItemRef::new(item_type, item_id);

        if !session.selected.remove(&item_ref) {
            return Err(ContextError::ItemNotFound {
                item_type,
                item_id: item_id.to_string(),
            });
        }
        let count = session.selected.total();
        self.persist_refs(&session).await?;

        debug!(session_id = %session_id, item_type = %item_type, item_id, "Context item removed");
        self.emit(ContextEvent::new(
            session_id.clone(),
            EventKind::ContextUpdated {
                item_type: Some(item_type),
                change: ContextChange::Removed,
                count,
            },
        ))
        .await;
        Ok(())
    }

    /// Clear all items of one type, or everything when `item_type` is
    /// `None`. Returns the number of references removed.
    pub async fn clear(
        &self,
        session_id: &SessionId,
        item_type: Option<ContextItemType>,
    ) -> Result<usize, ContextError> {
        let lock = self.writer_lock(session_id).await;
        let _guard = lock.lock().await;

        let mut session = self.load_session(session_id).await?;
        let removed = session.selected.clear(item_type);
        let count = session.selected.total();
        self.persist_refs(&session).await?;

        debug!(session_id = %session_id, removed, "Context cleared");
        self.emit(ContextEvent::new(
            session_id.clone(),
            EventKind::ContextUpdated {
                item_type,
                change: ContextChange::Cleared,
                count,
            },
        ))
        .await;
        Ok(removed)
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    /// Load the full context state with item content hydrated from the
    /// knowledge store.
    ///
    /// Items that fail to resolve are collected into `missing` rather than
    /// failing the whole call.
    pub async fn hydrate(
        &self,
        session_id: &SessionId,
        options: HydrateOptions,
    ) -> Result<HydratedContext, ContextError> {
        let session = self.load_session(session_id).await?;

        let mut items = Vec::new();
        let mut missing = Vec::new();
        for item_ref in session.selected.iter_all() {
            match self
                .knowledge
                .resolve(item_ref.item_type, &item_ref.item_id)
                .await
            {
                Ok(Some(item)) => items.push(item),
                Ok(None) => missing.push(item_ref.clone()),
                Err(e) => {
                    warn!(item = %item_ref, error = %e, "Hydration failed for item");
                    missing.push(item_ref.clone());
                }
            }
        }

        if options.include_usage {
            self.enrich_with_usage(&mut items).await;
        }
        if let Some(sort) = options.sort {
            sort_items(&mut items, sort);
        }

        Ok(HydratedContext {
            session,
            items,
            missing,
        })
    }

    /// Re-check every selected reference against the knowledge store
    /// without mutating anything. Emits `context_validated` when invalid
    /// references are found.
    pub async fn validate(&self, session_id: &SessionId) -> Result<ValidationReport, ContextError> {
        let session = self.load_session(session_id).await?;

        let mut valid = 0;
        let mut invalid = Vec::new();
        for item_ref in session.selected.iter_all() {
            match self
                .knowledge
                .resolve(item_ref.item_type, &item_ref.item_id)
                .await
            {
                Ok(Some(_)) => valid += 1,
                _ => invalid.push(item_ref.clone()),
            }
        }

        if !invalid.is_empty() {
            warn!(session_id = %session_id, invalid = invalid.len(), "Context validation found stale references");
            self.emit(ContextEvent::new(
                session_id.clone(),
                EventKind::ContextValidated {
                    invalid_count: invalid.len(),
                },
            ))
            .await;
        }

        Ok(ValidationReport { valid, invalid })
    }

    // ── Usage tracking ────────────────────────────────────────────────────

    /// Record a usage event and refresh per-item statistics.
    ///
    /// Best-effort by contract: the append runs on a detached task and any
    /// failure is logged, never surfaced — usage tracking must not fail the
    /// request that triggered it.
    pub async fn record_usage(&self, event: UsageEvent) {
        let session_id = event.session_id.clone();
        let message_id = event.message_id.clone();
        let item_count = event.items.len();

        let usage = self.usage.clone();
        let task_message_id = message_id.clone();
        tokio::spawn(async move {
            if let Err(e) = usage.append(event).await {
                warn!(message_id = %task_message_id, error = %e, "Usage tracking failed");
            }
        });

        self.emit(ContextEvent::new(
            session_id,
            EventKind::UsageRecorded {
                message_id,
                item_count,
            },
        ))
        .await;
    }

    // ── Subscriptions ─────────────────────────────────────────────────────

    /// Subscribe to this manager's context events, optionally filtered by
    /// event kind name.
    pub async fn subscribe(
        &self,
        handler: EventHandler,
        kinds: Option<Vec<String>>,
    ) -> SubscriptionId {
        self.subscribers.subscribe(handler, kinds).await
    }

    /// Remove a subscription. Returns `true` if it existed.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id).await
    }

    // ── Internals ─────────────────────────────────────────────────────────

    /// Read-through session load: cache first, then storage, inserting at
    /// the version captured before the round-trip.
    async fn load_session(&self, session_id: &SessionId) -> Result<Session, ContextError> {
        if let Some(session) = self.cache.get(session_id).await {
            return Ok(session);
        }

        let version = self.cache.version(session_id).await;
        let session = self
            .sessions
            .get(session_id)
            .await
            .map_err(|e: StoreError| ContextError::Storage(e.to_string()))?
            .ok_or_else(|| ContextError::SessionNotFound(session_id.clone()))?;
        self.cache.insert(session.clone(), version).await;
        Ok(session)
    }

    /// Persist the updated reference set and invalidate the cached
    /// snapshot before returning.
    async fn persist_refs(&self, session: &Session) -> Result<(), ContextError> {
        self.sessions
            .save_refs(&session.id, &session.selected)
            .await
            .map_err(|e| ContextError::Storage(e.to_string()))?;
        self.cache.invalidate(&session.id).await;
        Ok(())
    }

    async fn enrich_with_usage(&self, items: &mut [ContextItem]) {
        for item in items.iter_mut() {
            match self.usage.stats(&item.id).await {
                Ok(Some(stats)) => {
                    item.last_used_at = stats.last_used_at;
                    item.metadata
                        .insert("total_uses".into(), serde_json::json!(stats.total_uses));
                    item.metadata.insert(
                        "avg_utilization".into(),
                        serde_json::json!(stats.avg_utilization),
                    );
                }
                Ok(None) => {}
                Err(e) => warn!(item_id = %item.id, error = %e, "Usage enrichment failed"),
            }
        }
    }

    async fn emit(&self, event: ContextEvent) {
        self.subscribers.emit(event).await;
    }

    async fn writer_lock(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        {
            let locks = self.write_locks.read().await;
            if let Some(lock) = locks.get(session_id) {
                return lock.clone();
            }
        }
        let mut locks = self.write_locks.write().await;
        locks
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn sort_items(items: &mut [ContextItem], sort: SortOrder) {
    match sort {
        SortOrder::Recency => {
            items.sort_by_key(|i| std::cmp::Reverse(i.last_used_at.unwrap_or(i.added_at)));
        }
        SortOrder::Usage => {
            items.sort_by_key(|i| {
                std::cmp::Reverse(
                    i.metadata
                        .get("total_uses")
                        .and_then(serde_json::Value::as_u64)
                        .unwrap_or(0),
                )
            });
        }
        SortOrder::Similarity => {
            items.sort_by(|a, b| {
                b.similarity
                    .unwrap_or(0.0)
                    .partial_cmp(&a.similarity.unwrap_or(0.0))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        SortOrder::Title => {
            items.sort_by(|a, b| a.title.cmp(&b.title));
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
