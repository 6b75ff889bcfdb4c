//! Password-based SSH authentication.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client;

use crate::session::ClientHandler;
use crate::session::ConnectionKey;

use super::prompt::{CredentialCache, CredentialSource};
use super::traits::AuthStrategy;

/// Password authentication strategy.
///
/// Pulls the password from the credential source on demand and records it
/// in the cache when the server accepts it.
pub struct PasswordAuth {
    key: ConnectionKey,
    source: Arc<dyn CredentialSource>,
    cache: CredentialCache,
}

impl PasswordAuth {
    pub fn new(key: ConnectionKey, source: Arc<dyn CredentialSource>, cache: CredentialCache) -> Self {
        Self { key, source, cache }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        // Reuse a previously successful secret before prompting again.
        let password = match self.cache.get(&self.key) {
            Some(cached) => cached,
            None => self.source.password(&self.key).await?,
        };

        let result = handle
            .authenticate_password(username, &password)
            .await
            .map_err(|e| format!("Password authentication failed: {}", e))?;

        if result.success() {
            self.cache.store(&self.key, password);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
