//! Session storage backends
//!
//! Provides:
//! - The `SessionStore` seam the registry reads and writes through
//! - A bounded in-memory store with idle expiry
//! - A Redis store for sharing sessions across gateway replicas

use super::Session;
use crate::cache::{keys, Cache};
use crate::errors::Result;
use crate::metrics;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Trait for session persistence
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch a live session; expired and unknown ids are both `None`
    async fn get(&self, id: &str) -> Result<Option<Session>>;

    /// Insert or replace a session under its own id
    async fn put(&self, session: Session) -> Result<()>;

    /// Drop a session; true if one was stored
    async fn remove(&self, id: &str) -> Result<bool>;

    /// Check the backend is reachable
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Purge idle sessions, returning how many were dropped.
    /// Backends that expire entries on their own return 0.
    async fn evict_expired(&self) -> usize {
        0
    }

    /// Backend name for logs
    fn backend(&self) -> &'static str;
}

struct Entry {
    session: Session,
    touched: Instant,
}

/// In-process store with idle expiry and a size cap.
///
/// When full, inserting a new session evicts the least recently used one.
pub struct InMemorySessionStore {
    entries: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
    max_sessions: usize,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration, max_sessions: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_sessions: max_sessions.max(1),
        }
    }

    /// Number of stored sessions, expired ones included until swept
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn is_expired(&self, entry: &Entry, now: Instant) -> bool {
        now.duration_since(entry.touched) > self.ttl
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, id: &str) -> Result<Option<Session>> {
        let now = Instant::now();
        let entries = self.entries.read().await;

        Ok(entries
            .get(id)
            .filter(|entry| !self.is_expired(entry, now))
            .map(|entry| entry.session.clone()))
    }

    async fn put(&self, session: Session) -> Result<()> {
        let mut entries = self.entries.write().await;

        if !entries.contains_key(session.id()) && entries.len() >= self.max_sessions {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(id, _)| id.clone());

            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                metrics::record_sessions_evicted(1, "capacity");
                tracing::debug!(session_id = %oldest, "Evicted least recently used session");
            }
        }

        entries.insert(
            session.id().to_string(),
            Entry {
                session,
                touched: Instant::now(),
            },
        );
        metrics::set_active_sessions(entries.len());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(id).is_some();
        metrics::set_active_sessions(entries.len());
        Ok(removed)
    }

    async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        let evicted = before - entries.len();

        if evicted > 0 {
            metrics::record_sessions_evicted(evicted, "expired");
        }
        metrics::set_active_sessions(entries.len());
        evicted
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Redis-backed store; expiry is the key TTL, refreshed on every write
pub struct RedisSessionStore {
    cache: Arc<Cache>,
    ttl_secs: u64,
}

impl RedisSessionStore {
    pub fn new(cache: Arc<Cache>, ttl: Duration) -> Self {
        Self {
            cache,
            ttl_secs: ttl.as_secs().max(1),
        }
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, id: &str) -> Result<Option<Session>> {
        self.cache.get(&keys::session(id)).await
    }

    async fn put(&self, session: Session) -> Result<()> {
        self.cache
            .set_with_ttl(&keys::session(session.id()), &session, self.ttl_secs)
            .await
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        self.cache.delete(&keys::session(id)).await
    }

    async fn ping(&self) -> Result<()> {
        self.cache.ping().await
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(ttl_secs: u64, max: usize) -> InMemorySessionStore {
        InMemorySessionStore::new(Duration::from_secs(ttl_secs), max)
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = store(60, 10);
        let session = Session::new("seed");
        let id = session.id().to_string();

        assert!(store.get(&id).await.unwrap().is_none());
        store.put(session).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap().unwrap().id(), id);

        assert!(store.remove(&id).await.unwrap());
        assert!(!store.remove(&id).await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_expire() {
        let store = store(60, 10);
        let stale = Session::new("seed");
        let stale_id = stale.id().to_string();
        store.put(stale).await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        let fresh = Session::new("seed");
        let fresh_id = fresh.id().to_string();
        store.put(fresh).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(store.get(&stale_id).await.unwrap().is_none());
        assert!(store.get(&fresh_id).await.unwrap().is_some());
        assert_eq!(store.len().await, 2);

        assert_eq!(store.evict_expired().await, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_least_recently_used() {
        let store = store(3600, 2);
        let a = Session::new("seed");
        let b = Session::new("seed");
        let c = Session::new("seed");
        let (a_id, b_id, c_id) = (a.id().to_string(), b.id().to_string(), c.id().to_string());

        store.put(a.clone()).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        store.put(b).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        // Touch `a` again so `b` becomes the oldest
        store.put(a).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        store.put(c).await.unwrap();

        assert_eq!(store.len().await, 2);
        assert!(store.get(&a_id).await.unwrap().is_some());
        assert!(store.get(&b_id).await.unwrap().is_none());
        assert!(store.get(&c_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_replacing_does_not_evict() {
        let store = store(3600, 1);
        let mut session = Session::new("seed");
        store.put(session.clone()).await.unwrap();

        session.append(crate::chat::Message::user("hi"));
        store.put(session.clone()).await.unwrap();

        let stored = store.get(session.id()).await.unwrap().unwrap();
        assert_eq!(stored.history().len(), 2);
    }
}
