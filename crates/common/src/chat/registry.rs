//! Session lookup, creation, and per-session serialization

use super::router::MessageRouter;
use super::session::{ChatFailure, ChatReply, Session};
use super::store::SessionStore;
use crate::errors::Result;
use crate::metrics;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Maps session ids to sessions and runs chat turns against them.
///
/// Turns on the same id run one at a time; different ids never wait on
/// each other.
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    locks: StdMutex<HashMap<String, Weak<Mutex<()>>>>,
    system_prompt: String,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, system_prompt: impl Into<String>) -> Self {
        Self {
            store,
            locks: StdMutex::new(HashMap::new()),
            system_prompt: system_prompt.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Return the session for `id`, or register a new one.
    ///
    /// Absent and unknown ids both yield a fresh session; only a failing
    /// store is an error.
    pub async fn resolve(&self, id: Option<&str>) -> Result<Session> {
        if let Some(id) = id {
            if let Some(session) = self.store.get(id).await? {
                return Ok(session);
            }
            tracing::info!(requested = %id, "Unknown session id, starting a new session");
        }

        let session = Session::new(&self.system_prompt);
        self.store.put(session.clone()).await?;
        metrics::record_session_created();
        tracing::info!(session_id = %session.id(), backend = self.store.backend(), "Session created");

        Ok(session)
    }

    /// Discard a session; false when there was nothing to discard
    pub async fn reset(&self, id: &str) -> Result<bool> {
        let _guard = self.lock(id).await;
        let removed = self.store.remove(id).await?;

        if removed {
            metrics::record_session_reset();
        }
        tracing::info!(session_id = %id, removed, "Session reset");
        Ok(removed)
    }

    /// Exclusive section for one session id
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(id).lock_owned().await
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(lock) = locks.get(id).and_then(Weak::upgrade) {
            return lock;
        }

        // Drop entries nobody holds any more
        locks.retain(|_, lock| lock.strong_count() > 0);

        let lock = Arc::new(Mutex::new(()));
        locks.insert(id.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Run one chat turn: resolve the session, process the message, store the result.
    ///
    /// The session is written back on failure too, so the user message is kept.
    pub async fn handle(
        &self,
        router: &MessageRouter,
        session_id: Option<&str>,
        message: &str,
        image: Option<Vec<u8>>,
    ) -> std::result::Result<ChatReply, ChatFailure> {
        let _guard = match session_id {
            Some(id) => Some(self.lock(id).await),
            None => None,
        };

        let mut session = self.resolve(session_id).await?;
        let outcome = session.process(router, message, image).await;
        let id = session.id().to_string();

        if let Err(error) = self.store.put(session).await {
            return match outcome {
                Ok(_) => Err(ChatFailure {
                    session_id: Some(id),
                    error,
                }),
                Err(failure) => {
                    tracing::error!(session_id = %id, error = %error, "Failed to store session after failed turn");
                    Err(failure)
                }
            };
        }

        outcome
    }

    /// Purge idle sessions from the backing store
    pub async fn evict_expired(&self) -> usize {
        self.store.evict_expired().await
    }

    /// Check the backing store is reachable
    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::router::fakes::Fakes;
    use crate::chat::store::InMemorySessionStore;
    use crate::errors::AppError;
    use std::collections::HashSet;
    use std::time::Duration;

    fn registry() -> Arc<SessionRegistry> {
        let store = Arc::new(InMemorySessionStore::new(Duration::from_secs(3600), 1000));
        Arc::new(SessionRegistry::new(store, "seed prompt"))
    }

    async fn history_len(registry: &SessionRegistry, id: &str) -> usize {
        registry.store().get(id).await.unwrap().unwrap().history().len()
    }

    #[tokio::test]
    async fn test_missing_id_creates_fresh_sessions() {
        let registry = registry();
        let fakes = Fakes::new("ctx", "unused");
        let router = fakes.router(Duration::from_secs(5));

        let mut seen = HashSet::new();
        for _ in 0..5 {
            let reply = registry.handle(&router, None, "hello", None).await.unwrap();
            assert!(seen.insert(reply.session_id));
        }
    }

    #[tokio::test]
    async fn test_unknown_id_falls_back_to_new_session() {
        let registry = registry();
        let session = registry.resolve(Some("no-such-session")).await.unwrap();
        assert_ne!(session.id(), "no-such-session");
        assert_eq!(session.history().len(), 1);
        assert!(registry.store().get(session.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_two_turns_give_history_of_five() {
        let registry = registry();
        let fakes = Fakes::new("Deposits are protected.", "unused");
        let router = fakes.router(Duration::from_secs(5));

        let first = registry.handle(&router, None, "What's the deposit policy?", None).await.unwrap();
        assert!(!first.session_id.is_empty());
        assert_eq!(history_len(&registry, &first.session_id).await, 3);

        let second = registry
            .handle(&router, Some(&first.session_id), "And pets?", None)
            .await
            .unwrap();
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(history_len(&registry, &first.session_id).await, 5);
    }

    #[tokio::test]
    async fn test_failed_turn_is_persisted_with_user_message() {
        let registry = registry();
        let fakes = Fakes::new("ctx", "unused");
        let router = fakes.router(Duration::from_secs(5));

        let id = registry.handle(&router, None, "hi", None).await.unwrap().session_id;
        let failure = registry
            .handle(&router, Some(&id), "please fail", None)
            .await
            .unwrap_err();

        assert_eq!(failure.session_id.as_deref(), Some(id.as_str()));
        assert!(matches!(failure.error, AppError::GenerationError { .. }));
        assert_eq!(history_len(&registry, &id).await, 4);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let registry = registry();
        assert!(!registry.reset("unknown").await.unwrap());
        assert!(!registry.reset("unknown").await.unwrap());

        let session = registry.resolve(None).await.unwrap();
        assert!(registry.reset(session.id()).await.unwrap());
        assert!(!registry.reset(session.id()).await.unwrap());

        // A reset id is treated as unknown afterwards
        let next = registry.resolve(Some(session.id())).await.unwrap();
        assert_ne!(next.id(), session.id());
    }

    #[tokio::test]
    async fn test_concurrent_turns_on_one_session_are_serialized() {
        let registry = registry();
        let fakes = Arc::new(Fakes::new("ctx", "unused"));
        let router = Arc::new(fakes.router(Duration::from_secs(5)));
        let id = registry.resolve(None).await.unwrap().id().to_string();

        let turns = (0..10).map(|i| {
            let registry = registry.clone();
            let router = router.clone();
            let id = id.clone();
            tokio::spawn(async move {
                registry
                    .handle(&router, Some(&id), &format!("message {}", i), None)
                    .await
            })
        });

        for result in futures::future::join_all(turns).await {
            assert!(result.unwrap().is_ok());
        }

        // seed + 10 * (user, assistant): no turn overwrote another
        assert_eq!(history_len(&registry, &id).await, 21);
    }

    #[tokio::test]
    async fn test_other_sessions_are_not_blocked() {
        let registry = registry();
        let fakes = Fakes::new("ctx", "unused");
        let router = fakes.router(Duration::from_secs(5));

        let held = registry.lock("busy-session").await;
        let reply = tokio::time::timeout(
            Duration::from_secs(5),
            registry.handle(&router, Some("another-session"), "hi", None),
        )
        .await
        .expect("independent session should not wait")
        .unwrap();
        assert!(!reply.session_id.is_empty());
        drop(held);
    }

    #[tokio::test]
    async fn test_idle_locks_are_pruned() {
        let registry = registry();
        {
            let _a = registry.lock("a").await;
        }
        let _b = registry.lock("b").await;

        let locks = registry.locks.lock().unwrap();
        assert!(!locks.contains_key("a"));
        assert!(locks.contains_key("b"));
    }
}
