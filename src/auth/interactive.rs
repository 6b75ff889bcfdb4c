//! Keyboard-interactive SSH authentication.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, KeyboardInteractiveAuthResponse};
use tracing::debug;

use crate::session::ClientHandler;
use crate::session::ConnectionKey;

use super::prompt::{CredentialCache, CredentialSource};
use super::traits::AuthStrategy;

/// Keyboard-interactive authentication strategy.
///
/// Drives the server's prompt/response rounds, answering each prompt via
/// the credential source. A single-prompt round that succeeds caches the
/// response as the connection's secret.
pub struct InteractiveAuth {
    key: ConnectionKey,
    source: Arc<dyn CredentialSource>,
    cache: CredentialCache,
}

impl InteractiveAuth {
    pub fn new(key: ConnectionKey, source: Arc<dyn CredentialSource>, cache: CredentialCache) -> Self {
        Self { key, source, cache }
    }
}

#[async_trait]
impl AuthStrategy for InteractiveAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let mut response = handle
            .authenticate_keyboard_interactive_start(username, None)
            .await
            .map_err(|e| format!("Interactive authentication failed: {}", e))?;

        // The one secret answered in a single-prompt round; cached on success.
        let mut sole_response: Option<String> = None;

        loop {
            match response {
                KeyboardInteractiveAuthResponse::Success => {
                    if let Some(secret) = sole_response.take() {
                        self.cache.store(&self.key, secret);
                    }
                    return Ok(true);
                }
                KeyboardInteractiveAuthResponse::Failure { .. } => {
                    return Ok(false);
                }
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                    debug!("Interactive auth round with {} prompt(s)", prompts.len());

                    let mut answers = Vec::with_capacity(prompts.len());
                    for prompt in &prompts {
                        let answer = self
                            .source
                            .interactive(&self.key, &prompt.prompt, prompt.echo)
                            .await?;
                        answers.push(answer);
                    }

                    sole_response = if answers.len() == 1 {
                        answers.first().cloned()
                    } else {
                        None
                    };

                    response = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await
                        .map_err(|e| format!("Interactive authentication failed: {}", e))?;
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "interactive"
    }
}
