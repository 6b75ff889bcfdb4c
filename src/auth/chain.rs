//! Authentication chain for trying multiple strategies.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use tracing::debug;

use crate::session::ClientHandler;
use crate::session::ConnectionKey;

use super::prompt::{CredentialCache, CredentialSource};
use super::traits::AuthStrategy;
use super::{InteractiveAuth, KeyAuth, PasswordAuth};

/// Authentication chain that tries multiple strategies in order.
///
/// Strategies are tried in the order they were added. The first successful
/// authentication stops the chain and returns success.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    /// Create a new empty authentication chain.
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Build the standard chain for a connection: every registered
    /// identity key first, then password, then keyboard-interactive.
    pub fn standard(
        key: &ConnectionKey,
        identities: &[PathBuf],
        source: Arc<dyn CredentialSource>,
        cache: CredentialCache,
    ) -> Self {
        let mut chain = Self::new();
        for identity in identities {
            chain = chain.with_key(key.clone(), identity.clone(), source.clone());
        }
        chain
            .with_password(key.clone(), source.clone(), cache.clone())
            .with_interactive(key.clone(), source, cache)
    }

    /// Add key-based authentication to the chain.
    pub fn with_key(
        mut self,
        key: ConnectionKey,
        key_path: impl Into<PathBuf>,
        source: Arc<dyn CredentialSource>,
    ) -> Self {
        self.strategies
            .push(Box::new(KeyAuth::new(key, key_path, source)));
        self
    }

    /// Add password authentication to the chain.
    pub fn with_password(
        mut self,
        key: ConnectionKey,
        source: Arc<dyn CredentialSource>,
        cache: CredentialCache,
    ) -> Self {
        self.strategies
            .push(Box::new(PasswordAuth::new(key, source, cache)));
        self
    }

    /// Add keyboard-interactive authentication to the chain.
    pub fn with_interactive(
        mut self,
        key: ConnectionKey,
        source: Arc<dyn CredentialSource>,
        cache: CredentialCache,
    ) -> Self {
        self.strategies
            .push(Box::new(InteractiveAuth::new(key, source, cache)));
        self
    }

    /// Check if the chain has any authentication strategies.
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        if self.strategies.is_empty() {
            return Err("No authentication strategies configured".to_string());
        }

        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!("Authentication succeeded with strategy: {}", strategy.name());
                    return Ok(true);
                }
                Ok(false) => {
                    debug!("Authentication failed with strategy: {}", strategy.name());
                    last_error = Some(format!("{} authentication rejected", strategy.name()));
                }
                Err(e) => {
                    debug!(
                        "Authentication error with strategy {}: {}",
                        strategy.name(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "All authentication methods failed".to_string()))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
