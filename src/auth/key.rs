//! Private key file SSH authentication.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::session::ClientHandler;
use crate::session::ConnectionKey;

use super::prompt::CredentialSource;
use super::traits::AuthStrategy;

/// Private key file authentication strategy.
///
/// Loads a private key from a file and uses it for public key
/// authentication. Encrypted keys trigger a passphrase request through
/// the credential source.
pub struct KeyAuth {
    key: ConnectionKey,
    key_path: PathBuf,
    source: Arc<dyn CredentialSource>,
}

impl KeyAuth {
    pub fn new(
        key: ConnectionKey,
        key_path: impl Into<PathBuf>,
        source: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            key,
            key_path: key_path.into(),
            source,
        }
    }

    async fn load_key(&self) -> Result<keys::PrivateKey, String> {
        let path = Path::new(&self.key_path);

        // Try without a passphrase first; fall back to asking for one.
        match keys::load_secret_key(path, None) {
            Ok(key_pair) => Ok(key_pair),
            Err(load_err) => {
                debug!(
                    "Key {:?} not loadable without passphrase ({}), prompting",
                    self.key_path, load_err
                );
                let passphrase = self.source.passphrase(&self.key, path).await?;
                keys::load_secret_key(path, Some(&passphrase)).map_err(|e| {
                    format!(
                        "Failed to load private key from {:?}: {}",
                        self.key_path, e
                    )
                })
            }
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let key_pair = self.load_key().await?;

        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| format!("Key authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;

    #[test]
    fn test_key_auth_name() {
        let auth = KeyAuth::new(
            ConnectionKey::new("alice", "node01", 22),
            "/home/alice/.ssh/id_ed25519",
            Arc::new(StaticCredentials::new()),
        );
        assert_eq!(auth.name(), "key");
        assert_eq!(
            auth.key_path,
            PathBuf::from("/home/alice/.ssh/id_ed25519")
        );
    }
}
