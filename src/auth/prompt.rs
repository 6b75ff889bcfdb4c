//! Credential callback contract, input-mode selection and the secret cache.
//!
//! The session layer never owns secrets; it asks a [`CredentialSource`]
//! for them on demand. Which concrete source is used is chosen by the
//! `REXEC_ASKPASS` environment variable:
//!
//! * `stdin` (default) — prompt on the controlling terminal
//! * `socket` — request the secret from a local helper listening on
//!   `REXEC_ASKPASS_HOST`:`REXEC_ASKPASS_PORT`, one line per request
//!
//! The original tool also offered a pop-up dialog; GUI entry is out of
//! scope here, so that value falls back to `stdin` with a warning.
//!
//! Secrets that successfully authenticated are stored in the
//! [`CredentialCache`] keyed by connection, so that third parties (the
//! executors' password-prompt injection) can retrieve them afterwards
//! without re-prompting.

use std::env;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::warn;

use crate::config::{ASKPASS_HOST_ENV_VAR, ASKPASS_MODE_ENV_VAR, ASKPASS_PORT_ENV_VAR};
use crate::session::ConnectionKey;

/// Supplies secrets on demand during authentication.
///
/// Implementations must answer synchronously from the caller's point of
/// view: the connect sequence is suspended until the secret arrives.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// The login password for `key`.
    async fn password(&self, key: &ConnectionKey) -> Result<String, String>;

    /// The passphrase protecting the private key at `identity`.
    async fn passphrase(&self, key: &ConnectionKey, identity: &Path) -> Result<String, String>;

    /// A response to one keyboard-interactive prompt. `echo` is the
    /// server's hint on whether the response may be displayed.
    async fn interactive(
        &self,
        key: &ConnectionKey,
        prompt: &str,
        echo: bool,
    ) -> Result<String, String>;
}

/// Process-wide cache of secrets that actually worked, keyed by connection.
#[derive(Debug, Clone, Default)]
pub struct CredentialCache {
    secrets: Arc<DashMap<ConnectionKey, String>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the secret that authenticated `key`.
    pub fn store(&self, key: &ConnectionKey, secret: impl Into<String>) {
        self.secrets.insert(key.clone(), secret.into());
    }

    /// Retrieve the cached secret for `key`, if any.
    pub fn get(&self, key: &ConnectionKey) -> Option<String> {
        self.secrets.get(key).map(|entry| entry.value().clone())
    }

    /// Drop the cached secret for `key`.
    pub fn forget(&self, key: &ConnectionKey) {
        self.secrets.remove(key);
    }
}

/// How interactive secrets are gathered, per `REXEC_ASKPASS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptMode {
    /// Read from the process's stdin.
    Stdin,
    /// Ask a line-oriented helper over TCP.
    Socket { host: String, port: u16 },
}

impl PromptMode {
    /// Resolve the prompt mode from the environment.
    pub fn from_env() -> Self {
        match env::var(ASKPASS_MODE_ENV_VAR).as_deref() {
            Ok("socket") => {
                let host = env::var(ASKPASS_HOST_ENV_VAR)
                    .unwrap_or_else(|_| "127.0.0.1".to_string());
                match env::var(ASKPASS_PORT_ENV_VAR)
                    .ok()
                    .and_then(|p| p.parse::<u16>().ok())
                {
                    Some(port) => PromptMode::Socket { host, port },
                    None => {
                        warn!(
                            "{} is `socket` but {} is unset or invalid, falling back to stdin",
                            ASKPASS_MODE_ENV_VAR, ASKPASS_PORT_ENV_VAR
                        );
                        PromptMode::Stdin
                    }
                }
            }
            Ok("stdin") | Err(_) => PromptMode::Stdin,
            Ok(other) => {
                // The legacy pop-up dialog mode lands here as well.
                warn!(
                    "unsupported {} value `{}`, falling back to stdin",
                    ASKPASS_MODE_ENV_VAR, other
                );
                PromptMode::Stdin
            }
        }
    }

    /// Build the credential source for this mode.
    pub fn into_source(self) -> Arc<dyn CredentialSource> {
        match self {
            PromptMode::Stdin => Arc::new(StdinPrompt),
            PromptMode::Socket { host, port } => Arc::new(SocketPrompt { host, port }),
        }
    }
}

/// Fixed secrets handed in by the embedding application.
///
/// Also the natural source for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    password: Option<String>,
    passphrase: Option<String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn password(&self, key: &ConnectionKey) -> Result<String, String> {
        self.password
            .clone()
            .ok_or_else(|| format!("no password configured for {}", key))
    }

    async fn passphrase(&self, _key: &ConnectionKey, identity: &Path) -> Result<String, String> {
        self.passphrase
            .clone()
            .ok_or_else(|| format!("no passphrase configured for {}", identity.display()))
    }

    async fn interactive(
        &self,
        key: &ConnectionKey,
        _prompt: &str,
        _echo: bool,
    ) -> Result<String, String> {
        self.password(key).await
    }
}

/// Prompts on the controlling terminal via stdin.
pub struct StdinPrompt;

impl StdinPrompt {
    async fn read_line(&self, prompt: &str) -> Result<String, String> {
        eprint!("{}", prompt);
        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| format!("failed to read secret from stdin: {}", e))?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

#[async_trait]
impl CredentialSource for StdinPrompt {
    async fn password(&self, key: &ConnectionKey) -> Result<String, String> {
        self.read_line(&format!("Password for {}: ", key)).await
    }

    async fn passphrase(&self, _key: &ConnectionKey, identity: &Path) -> Result<String, String> {
        self.read_line(&format!("Passphrase for {}: ", identity.display()))
            .await
    }

    async fn interactive(
        &self,
        _key: &ConnectionKey,
        prompt: &str,
        _echo: bool,
    ) -> Result<String, String> {
        self.read_line(prompt).await
    }
}

/// Requests secrets from a line-oriented helper over TCP.
///
/// One request per connection: the prompt text is sent, terminated by a
/// newline, and the single reply line is the secret.
pub struct SocketPrompt {
    host: String,
    port: u16,
}

impl SocketPrompt {
    async fn request(&self, prompt: &str) -> Result<String, String> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                format!(
                    "failed to reach credential helper at {}:{}: {}",
                    self.host, self.port, e
                )
            })?;

        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(format!("{}\n", prompt).as_bytes())
            .await
            .map_err(|e| format!("failed to send prompt to credential helper: {}", e))?;

        let mut line = String::new();
        let mut reader = BufReader::new(read_half);
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| format!("failed to read secret from credential helper: {}", e))?;

        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

#[async_trait]
impl CredentialSource for SocketPrompt {
    async fn password(&self, key: &ConnectionKey) -> Result<String, String> {
        self.request(&format!("password {}", key)).await
    }

    async fn passphrase(&self, _key: &ConnectionKey, identity: &Path) -> Result<String, String> {
        self.request(&format!("passphrase {}", identity.display()))
            .await
    }

    async fn interactive(
        &self,
        _key: &ConnectionKey,
        prompt: &str,
        _echo: bool,
    ) -> Result<String, String> {
        self.request(prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConnectionKey {
        ConnectionKey::new("alice", "node01", 22)
    }

    mod cache {
        use super::*;

        #[test]
        fn test_store_and_get() {
            let cache = CredentialCache::new();
            cache.store(&key(), "hunter2");
            assert_eq!(cache.get(&key()), Some("hunter2".to_string()));
        }

        #[test]
        fn test_get_unknown_key() {
            let cache = CredentialCache::new();
            assert_eq!(cache.get(&key()), None);
        }

        #[test]
        fn test_forget() {
            let cache = CredentialCache::new();
            cache.store(&key(), "hunter2");
            cache.forget(&key());
            assert_eq!(cache.get(&key()), None);
        }

        #[test]
        fn test_store_overwrites() {
            let cache = CredentialCache::new();
            cache.store(&key(), "old");
            cache.store(&key(), "new");
            assert_eq!(cache.get(&key()), Some("new".to_string()));
        }
    }

    mod static_credentials {
        use super::*;

        #[tokio::test]
        async fn test_password() {
            let source = StaticCredentials::new().with_password("hunter2");
            assert_eq!(source.password(&key()).await.unwrap(), "hunter2");
        }

        #[tokio::test]
        async fn test_missing_password_errors() {
            let source = StaticCredentials::new();
            assert!(source.password(&key()).await.is_err());
        }

        #[tokio::test]
        async fn test_interactive_falls_back_to_password() {
            let source = StaticCredentials::new().with_password("hunter2");
            let answer = source.interactive(&key(), "Password: ", false).await;
            assert_eq!(answer.unwrap(), "hunter2");
        }
    }

    mod socket_prompt {
        use super::*;
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpListener;

        #[tokio::test]
        async fn test_request_round_trip() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();

            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let (read_half, mut write_half) = stream.into_split();
                let mut line = String::new();
                BufReader::new(read_half).read_line(&mut line).await.unwrap();
                assert!(line.starts_with("password "));
                write_half.write_all(b"s3cret\n").await.unwrap();
            });

            let source = SocketPrompt {
                host: "127.0.0.1".to_string(),
                port,
            };
            assert_eq!(source.password(&key()).await.unwrap(), "s3cret");
        }
    }
}
