//! Versioned read-through cache for session state.
//!
//! Every mutating operation bumps a per-session version and drops the
//! cached entry *before* returning; a read that raced the mutation cannot
//! re-insert stale state because its captured version no longer matches.
//! Entries also expire on a TTL and the cache is bounded — expired and
//! oldest entries are evicted first, without blocking concurrent readers
//! across a storage round-trip.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use loupe_core::policy::CachePolicy;
use loupe_core::session::{Session, SessionId};
use tokio::sync::RwLock;

pub struct SessionCache {
    inner: RwLock<CacheInner>,
    ttl: Duration,
    max_entries: usize,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<SessionId, CacheEntry>,
    /// Versions survive entry eviction so stale inserts stay detectable.
    versions: HashMap<SessionId, u64>,
}

struct CacheEntry {
    session: Session,
    inserted_at: Instant,
    expires_at: Instant,
}

impl SessionCache {
    pub fn new(policy: &CachePolicy) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            ttl: Duration::from_secs(policy.session_ttl_secs),
            max_entries: policy.max_sessions,
        }
    }

    /// The current version for a session. Capture this *before* loading
    /// from storage and pass it back to [`insert`](Self::insert).
    pub async fn version(&self, id: &SessionId) -> u64 {
        self.inner.read().await.versions.get(id).copied().unwrap_or(0)
    }

    /// Cached session state, if present and fresh.
    pub async fn get(&self, id: &SessionId) -> Option<Session> {
        let inner = self.inner.read().await;
        let entry = inner.entries.get(id)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.session.clone())
    }

    /// Insert state loaded at `version`. A no-op when a mutation has bumped
    /// the version since — the loaded state is already stale.
    pub async fn insert(&self, session: Session, version: u64) {
        let mut inner = self.inner.write().await;
        let current = inner.versions.get(&session.id).copied().unwrap_or(0);
        if version != current {
            return;
        }

        let now = Instant::now();
        inner.entries.insert(
            session.id.clone(),
            CacheEntry {
                session,
                inserted_at: now,
                expires_at: now + self.ttl,
            },
        );

        if inner.entries.len() > self.max_entries {
            Self::evict(&mut inner, self.max_entries);
        }
    }

    /// Bump the session's version and drop its entry. Returns the new
    /// version.
    pub async fn invalidate(&self, id: &SessionId) -> u64 {
        let mut inner = self.inner.write().await;
        inner.entries.remove(id);
        let version = inner.versions.entry(id.clone()).or_insert(0);
        *version += 1;
        *version
    }

    /// Number of cached entries (for tests and diagnostics).
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    /// Drop expired entries first, then the oldest, until under `target`.
    fn evict(inner: &mut CacheInner, target: usize) {
        let now = Instant::now();
        inner.entries.retain(|_, e| e.expires_at > now);

        while inner.entries.len() > target {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    inner.entries.remove(&id);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(ttl_secs: u64, max: usize) -> CachePolicy {
        CachePolicy {
            session_ttl_secs: ttl_secs,
            max_sessions: max,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn insert_and_get() {
        let cache = SessionCache::new(&policy(300, 16));
        let session = Session::new("user-1");
        let id = session.id.clone();

        let version = cache.version(&id).await;
        cache.insert(session, version).await;

        assert!(cache.get(&id).await.is_some());
    }

    #[tokio::test]
    async fn invalidate_bumps_version_and_drops_entry() {
        let cache = SessionCache::new(&policy(300, 16));
        let session = Session::new("user-1");
        let id = session.id.clone();

        let v0 = cache.version(&id).await;
        cache.insert(session, v0).await;

        let v1 = cache.invalidate(&id).await;
        assert!(v1 > v0);
        assert!(cache.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn stale_insert_is_rejected() {
        let cache = SessionCache::new(&policy(300, 16));
        let session = Session::new("user-1");
        let id = session.id.clone();

        // Reader captured version 0, then a mutation bumped it.
        let stale_version = cache.version(&id).await;
        cache.invalidate(&id).await;
        cache.insert(session, stale_version).await;

        assert!(cache.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn zero_ttl_expires_immediately() {
        let cache = SessionCache::new(&policy(0, 16));
        let session = Session::new("user-1");
        let id = session.id.clone();

        let version = cache.version(&id).await;
        cache.insert(session, version).await;
        assert!(cache.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn bounded_eviction_drops_oldest() {
        let cache = SessionCache::new(&policy(300, 2));
        let mut ids = Vec::new();
        for _ in 0..3 {
            let session = Session::new("user-1");
            ids.push(session.id.clone());
            let version = cache.version(&session.id).await;
            cache.insert(session, version).await;
            // Distinct insertion instants for deterministic eviction order.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(cache.len().await, 2);
        assert!(cache.get(&ids[0]).await.is_none());
        assert!(cache.get(&ids[2]).await.is_some());
    }
}
