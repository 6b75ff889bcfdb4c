//! Constructor-injected execution context.
//!
//! The context owns the three process-wide collaborators — session store,
//! credential cache and event bus — as one explicit object handed to every
//! executor. Tests create a fresh context per case; applications create
//! one at startup. The one-session-per-key invariant lives in the store,
//! not in a global.

use std::sync::Arc;

use crate::auth::{CredentialCache, CredentialSource, PromptMode};
use crate::events::EventBus;
use crate::session::SessionStore;

/// Shared state for every executor created by one application.
pub struct ExecContext {
    sessions: SessionStore,
    secrets: CredentialCache,
    events: EventBus,
}

impl ExecContext {
    /// Build a context around the given credential callback.
    pub fn new(source: Arc<dyn CredentialSource>) -> Arc<Self> {
        let secrets = CredentialCache::new();
        let events = EventBus::new();
        Arc::new(Self {
            sessions: SessionStore::new(source, secrets.clone(), events.clone()),
            secrets,
            events,
        })
    }

    /// Build a context whose credential input mode is selected by the
    /// `REXEC_ASKPASS` environment variable.
    pub fn from_env() -> Arc<Self> {
        Self::new(PromptMode::from_env().into_source())
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn secrets(&self) -> &CredentialCache {
        &self.secrets
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;
    use crate::session::ConnectionKey;

    #[test]
    fn test_contexts_are_isolated() {
        let a = ExecContext::new(Arc::new(StaticCredentials::new()));
        let b = ExecContext::new(Arc::new(StaticCredentials::new()));

        let key = ConnectionKey::new("alice", "node01", 22);
        a.sessions().get_or_create(&key);

        assert_eq!(a.sessions().len(), 1);
        assert!(b.sessions().is_empty());
    }

    #[test]
    fn test_secrets_shared_with_store() {
        let ctx = ExecContext::new(Arc::new(StaticCredentials::new()));
        let key = ConnectionKey::new("alice", "node01", 22);

        ctx.secrets().store(&key, "hunter2");
        assert_eq!(ctx.secrets().get(&key), Some("hunter2".to_string()));
    }
}
