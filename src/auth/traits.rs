//! Authentication strategy trait definition.

use async_trait::async_trait;
use russh::client;

use crate::session::ClientHandler;

/// Trait for SSH authentication strategies.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// async tasks. Each strategy represents a different authentication
/// method (password, key file, keyboard-interactive).
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate with the SSH server.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Authentication succeeded
    /// * `Ok(false)` - Authentication failed (credentials rejected)
    /// * `Err(message)` - Error during authentication attempt
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, String>;

    /// Name of this strategy, for logging.
    fn name(&self) -> &'static str;
}
