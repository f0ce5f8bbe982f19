//! Session domain types.
//!
//! A session owns the set of knowledge items a user has selected for use in
//! generation, plus lifecycle state and cumulative token usage. Sessions are
//! fully independent units of concurrency — there are no cross-session locks
//! anywhere in the system.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::item::{ContextItemType, ItemRef};

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a session.
///
/// Sessions only move forward: `Active → Archived → Deleted`. Archived
/// sessions are eligible for time-boxed cleanup via
/// [`crate::store::SessionStore::purge_archived`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Archived,
    Deleted,
}

impl SessionStatus {
    /// Whether a transition from `self` to `to` is allowed.
    pub fn can_transition(self, to: SessionStatus) -> bool {
        matches!(
            (self, to),
            (SessionStatus::Active, SessionStatus::Archived)
                | (SessionStatus::Archived, SessionStatus::Deleted)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

/// The typed sets of item references a session has selected.
///
/// Insertion order is preserved within each type; the map itself is a
/// `BTreeMap` so iteration order over types is deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectedRefs {
    refs: BTreeMap<ContextItemType, Vec<ItemRef>>,
}

impl SelectedRefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of selected items of one type.
    pub fn count(&self, item_type: ContextItemType) -> usize {
        self.refs.get(&item_type).map_or(0, Vec::len)
    }

    /// Total number of selected items across all types.
    pub fn total(&self) -> usize {
        self.refs.values().map(Vec::len).sum()
    }

    /// Whether the given item is already selected.
    pub fn contains(&self, item_ref: &ItemRef) -> bool {
        self.refs
            .get(&item_ref.item_type)
            .is_some_and(|v| v.iter().any(|r| r.item_id == item_ref.item_id))
    }

    /// Append a reference, preserving insertion order.
    pub fn insert(&mut self, item_ref: ItemRef) {
        self.refs.entry(item_ref.item_type).or_default().push(item_ref);
    }

    /// Remove a reference. Returns `true` if it was present.
    pub fn remove(&mut self, item_ref: &ItemRef) -> bool {
        let Some(list) = self.refs.get_mut(&item_ref.item_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.item_id != item_ref.item_id);
        list.len() < before
    }

    /// Remove all refs of one type, or everything if `item_type` is `None`.
    /// Returns the number of refs removed.
    pub fn clear(&mut self, item_type: Option<ContextItemType>) -> usize {
        match item_type {
            Some(t) => self.refs.remove(&t).map_or(0, |v| v.len()),
            None => {
                let total = self.total();
                self.refs.clear();
                total
            }
        }
    }

    /// Iterate over all refs in deterministic (type, insertion) order.
    pub fn iter_all(&self) -> impl Iterator<Item = &ItemRef> {
        self.refs.values().flatten()
    }
}

/// A conversation session with its selected research context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID
    pub id: SessionId,

    /// Owning user
    pub user_id: String,

    /// Optional title (auto-generated or user-set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Lifecycle status
    pub status: SessionStatus,

    /// When this session was created
    pub created_at: DateTime<Utc>,

    /// When the session was last touched
    pub updated_at: DateTime<Utc>,

    /// Cumulative token usage across all turns
    pub total_tokens_used: u64,

    /// Selected item references, by type
    #[serde(default)]
    pub selected: SelectedRefs,
}

impl Session {
    /// Create a new active session for a user.
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            user_id: user_id.into(),
            title: None,
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            total_tokens_used: 0,
            selected: SelectedRefs::new(),
        }
    }

    /// Transition the session lifecycle, rejecting invalid edges.
    pub fn transition(&mut self, to: SessionStatus) -> Result<(), Error> {
        if !self.status.can_transition(to) {
            return Err(Error::Internal(format!(
                "invalid session transition: {} -> {}",
                self.status, to
            )));
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item_ref(t: ContextItemType, id: &str) -> ItemRef {
        ItemRef {
            item_type: t,
            item_id: id.into(),
        }
    }

    #[test]
    fn selected_refs_insert_and_count() {
        let mut refs = SelectedRefs::new();
        refs.insert(item_ref(ContextItemType::Insight, "i1"));
        refs.insert(item_ref(ContextItemType::Insight, "i2"));
        refs.insert(item_ref(ContextItemType::Metric, "m1"));

        assert_eq!(refs.count(ContextItemType::Insight), 2);
        assert_eq!(refs.count(ContextItemType::Metric), 1);
        assert_eq!(refs.total(), 3);
        assert!(refs.contains(&item_ref(ContextItemType::Insight, "i1")));
        assert!(!refs.contains(&item_ref(ContextItemType::Document, "i1")));
    }

    #[test]
    fn selected_refs_remove() {
        let mut refs = SelectedRefs::new();
        refs.insert(item_ref(ContextItemType::Insight, "i1"));

        assert!(refs.remove(&item_ref(ContextItemType::Insight, "i1")));
        assert!(!refs.remove(&item_ref(ContextItemType::Insight, "i1")));
        assert_eq!(refs.total(), 0);
    }

    #[test]
    fn selected_refs_clear_by_type() {
        let mut refs = SelectedRefs::new();
        refs.insert(item_ref(ContextItemType::Insight, "i1"));
        refs.insert(item_ref(ContextItemType::Metric, "m1"));

        assert_eq!(refs.clear(Some(ContextItemType::Insight)), 1);
        assert_eq!(refs.total(), 1);
        assert_eq!(refs.clear(None), 1);
        assert_eq!(refs.total(), 0);
    }

    #[test]
    fn lifecycle_transitions() {
        let mut session = Session::new("user-1");
        assert_eq!(session.status, SessionStatus::Active);

        session.transition(SessionStatus::Archived).unwrap();
        assert_eq!(session.status, SessionStatus::Archived);

        session.transition(SessionStatus::Deleted).unwrap();
        assert_eq!(session.status, SessionStatus::Deleted);
    }

    #[test]
    fn invalid_transitions_rejected() {
        let mut session = Session::new("user-1");
        assert!(session.transition(SessionStatus::Deleted).is_err());

        session.transition(SessionStatus::Archived).unwrap();
        assert!(session.transition(SessionStatus::Active).is_err());
    }

    #[test]
    fn session_serialization_roundtrip() {
        let mut session = Session::new("user-1");
        session.selected.insert(item_ref(ContextItemType::Insight, "i1"));

        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back.user_id, "user-1");
        assert_eq!(back.selected.total(), 1);
    }
}
