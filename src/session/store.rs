//! Session cache keyed by connection identity.
//!
//! The store guarantees at most one [`Session`] per [`ConnectionKey`]: the
//! create-if-absent path goes through dashmap's atomic entry API, so two
//! callers racing on the same key observe exactly one session creation.
//!
//! Entries are never evicted. Session reuse is optimistic for the process
//! lifetime; a caller that wants a fresh connection closes the session and
//! lets its next `open()` reconnect.

use std::sync::Arc;

use dashmap::DashMap;

use crate::auth::{CredentialCache, CredentialSource};
use crate::events::EventBus;
use crate::session::{ConnectionKey, Session};

/// Process-wide (per-context) cache of shared sessions.
pub struct SessionStore {
    sessions: DashMap<ConnectionKey, Arc<Session>>,
    source: Arc<dyn CredentialSource>,
    secrets: CredentialCache,
    events: EventBus,
}

impl SessionStore {
    pub(crate) fn new(
        source: Arc<dyn CredentialSource>,
        secrets: CredentialCache,
        events: EventBus,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            source,
            secrets,
            events,
        }
    }

    /// Look up the session for `key`, creating it if absent.
    ///
    /// Creation does not connect; the session authenticates lazily on its
    /// first `open()`.
    pub fn get_or_create(&self, key: &ConnectionKey) -> Arc<Session> {
        self.sessions
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Session::new(
                    key.clone(),
                    self.source.clone(),
                    self.secrets.clone(),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    /// Look up an existing session without creating one.
    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    /// Number of cached sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;

    fn store() -> Arc<SessionStore> {
        Arc::new(SessionStore::new(
            Arc::new(StaticCredentials::new().with_password("secret")),
            CredentialCache::new(),
            EventBus::new(),
        ))
    }

    fn key() -> ConnectionKey {
        ConnectionKey::new("alice", "node01", 22)
    }

    #[test]
    fn test_same_key_yields_same_session() {
        let store = store();
        let a = store.get_or_create(&key());
        let b = store.get_or_create(&key());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_different_keys_yield_different_sessions() {
        let store = store();
        let a = store.get_or_create(&ConnectionKey::new("alice", "node01", 22));
        let b = store.get_or_create(&ConnectionKey::new("alice", "node02", 22));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_get_without_create() {
        let store = store();
        assert!(store.get(&key()).is_none());
        store.get_or_create(&key());
        assert!(store.get(&key()).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_yields_one_instance() {
        let store = store();
        let mut handles = Vec::new();

        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.get_or_create(&key()) }));
        }

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }

        let first = &sessions[0];
        assert!(sessions.iter().all(|s| Arc::ptr_eq(first, s)));
        assert_eq!(store.len(), 1);
    }
}
