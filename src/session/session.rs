//! Authenticated SSH session lifecycle.
//!
//! A [`Session`] owns exactly one russh connection to one
//! [`ConnectionKey`]. It is created lazily by the store, shared by every
//! executor referencing the same key, and moves between two states:
//!
//! ```text
//! Unconnected --open()--> Connected --close()/detected failure--> Unconnected
//! ```
//!
//! `open()` is idempotent: a live handle is returned as-is, a stale handle
//! (server dropped us) is transparently reconnected. Opening authenticates
//! through the strategy chain, starts the keepalive, publishes an `Opened`
//! event and replays every forward registered while unconnected.
//!
//! All state mutation happens under one per-session `tokio::Mutex`; each
//! command or transfer opens its own channel, so concurrent callers only
//! contend on open/close/forward bookkeeping.

use std::collections::HashMap;
#[cfg(feature = "port_forward")]
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use russh::{Disconnect, client, keys};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthChain, AuthStrategy, CredentialCache, CredentialSource};
use crate::config::{self, MAX_RETRY_DELAY};
use crate::error::{ConnectionError, is_retryable_error};
use crate::events::{ConnectionEvent, EventBus};
use crate::session::ConnectionKey;
#[cfg(feature = "port_forward")]
use crate::session::forward::{ForwardDirection, ForwardSpec, serve_local_forward};

/// Client handler for russh that accepts all host keys.
///
/// Host keys are accepted without verification, matching
/// `StrictHostKeyChecking=no`; deployments that need known-hosts checking
/// front this with their own handler.
pub struct ClientHandler {
    /// Remote-forward routing table: server-side bound port to the local
    /// target that forwarded channels should connect to.
    #[cfg(feature = "port_forward")]
    remote_routes: Arc<DashMap<u32, (String, u16)>>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    #[cfg(feature = "port_forward")]
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let Some(route) = self
            .remote_routes
            .get(&connected_port)
            .map(|entry| entry.value().clone())
        else {
            warn!(
                "Forwarded channel for unregistered port {} ({}), dropping",
                connected_port, connected_address
            );
            return Ok(());
        };

        debug!(
            "Forwarded connection from {} on remote port {} -> {}:{}",
            originator_address, connected_port, route.0, route.1
        );

        tokio::spawn(async move {
            let (host, port) = route;
            let local_stream = match tokio::net::TcpStream::connect((host.as_str(), port)).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Remote forward target {}:{} unreachable: {}", host, port, e);
                    return;
                }
            };

            let channel_stream = channel.into_stream();
            let (mut local_read, mut local_write) = tokio::io::split(local_stream);
            let (mut channel_read, mut channel_write) = tokio::io::split(channel_stream);

            tokio::select! {
                result = tokio::io::copy(&mut channel_read, &mut local_write) => {
                    if let Err(e) = result {
                        debug!("Remote-forward inbound copy ended: {}", e);
                    }
                }
                result = tokio::io::copy(&mut local_read, &mut channel_write) => {
                    if let Err(e) = result {
                        debug!("Remote-forward outbound copy ended: {}", e);
                    }
                }
            }
        });

        Ok(())
    }
}

/// Mutable session state, guarded by the session mutex.
struct SessionState {
    handle: Option<Arc<client::Handle<ClientHandler>>>,
    identities: Vec<PathBuf>,
    connected_at: Option<DateTime<Utc>>,
    /// Local forwards; the token is present while the listener is live.
    #[cfg(feature = "port_forward")]
    local_forwards: HashMap<ForwardSpec, Option<CancellationToken>>,
    /// Remote forwards registered (or queued) with the server.
    #[cfg(feature = "port_forward")]
    remote_forwards: HashSet<ForwardSpec>,
}

/// One shared, lazily-authenticated connection to a remote endpoint.
pub struct Session {
    key: ConnectionKey,
    source: Arc<dyn CredentialSource>,
    secrets: CredentialCache,
    events: EventBus,
    state: Mutex<SessionState>,
    #[cfg(feature = "port_forward")]
    remote_routes: Arc<DashMap<u32, (String, u16)>>,
}

impl Session {
    pub(crate) fn new(
        key: ConnectionKey,
        source: Arc<dyn CredentialSource>,
        secrets: CredentialCache,
        events: EventBus,
    ) -> Self {
        Self {
            key,
            source,
            secrets,
            events,
            state: Mutex::new(SessionState {
                handle: None,
                identities: Vec::new(),
                connected_at: None,
                #[cfg(feature = "port_forward")]
                local_forwards: HashMap::new(),
                #[cfg(feature = "port_forward")]
                remote_forwards: HashSet::new(),
            }),
            #[cfg(feature = "port_forward")]
            remote_routes: Arc::new(DashMap::new()),
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// When the current connection was established, if connected.
    pub async fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.connected_at
    }

    /// Register a private key file to try during authentication.
    pub async fn add_identity(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut state = self.state.lock().await;
        if !state.identities.contains(&path) {
            state.identities.push(path);
        }
    }

    /// Whether the session currently holds a live handle.
    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        state
            .handle
            .as_ref()
            .is_some_and(|handle| !handle.is_closed())
    }

    /// Open the session, reusing a live connection when possible.
    ///
    /// A stale handle (closed underneath us) is discarded and the session
    /// reconnects transparently.
    pub async fn open(&self) -> Result<Arc<client::Handle<ClientHandler>>, ConnectionError> {
        let mut state = self.state.lock().await;
        self.open_locked(&mut state).await
    }

    async fn open_locked(
        &self,
        state: &mut SessionState,
    ) -> Result<Arc<client::Handle<ClientHandler>>, ConnectionError> {
        if let Some(handle) = &state.handle {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
            info!("Session to {} went stale, reconnecting", self.key);
            state.handle = None;
            state.connected_at = None;
        }

        let handle = Arc::new(self.connect_with_retry(&state.identities).await?);
        state.handle = Some(handle.clone());
        state.connected_at = Some(Utc::now());

        info!("Session to {} opened", self.key);
        self.events.publish(ConnectionEvent::Opened(self.key.clone()));

        #[cfg(feature = "port_forward")]
        self.replay_forwards(state, &handle).await;

        Ok(handle)
    }

    /// Close and reopen the session. Used for the single session-down retry.
    pub async fn reopen(&self) -> Result<Arc<client::Handle<ClientHandler>>, ConnectionError> {
        self.close().await;
        self.open().await
    }

    /// Disconnect, cancel forwards and clear registrations. Idempotent.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        self.close_locked(&mut state).await;
    }

    async fn close_locked(&self, state: &mut SessionState) {
        #[cfg(feature = "port_forward")]
        {
            for (spec, token) in state.local_forwards.drain() {
                if let Some(token) = token {
                    debug!("Cancelling local forward {}", spec);
                    token.cancel();
                }
            }
            state.remote_forwards.clear();
            self.remote_routes.clear();
        }

        if let Some(handle) = state.handle.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                debug!("Disconnect from {} reported: {}", self.key, e);
            }
            state.connected_at = None;
            info!("Session to {} closed", self.key);
            self.events.publish(ConnectionEvent::Closed(self.key.clone()));
        }
    }

    /// Connect with retry logic using exponential backoff with jitter.
    ///
    /// Only transient errors are retried; authentication failures abort
    /// immediately to avoid account lockouts.
    async fn connect_with_retry(
        &self,
        identities: &[PathBuf],
    ) -> Result<client::Handle<ClientHandler>, ConnectionError> {
        let max_retries = config::resolve_max_retries(None);
        let min_delay = config::resolve_retry_delay(None);

        let backoff = ExponentialBuilder::default()
            .with_min_delay(min_delay)
            .with_max_delay(MAX_RETRY_DELAY)
            .with_max_times(max_retries as usize)
            .with_jitter();

        let result = (|| async { self.connect_once(identities).await })
            .retry(backoff)
            .when(|e: &String| {
                let retryable = is_retryable_error(e);
                if !retryable {
                    warn!(
                        "Connection to {} failed with non-retryable error: {}",
                        self.key, e
                    );
                }
                retryable
            })
            .notify(|err, dur| {
                warn!("Connection failed: {}. Retrying in {:?}", err, dur);
            })
            .await;

        result.map_err(|reason| {
            error!("Connection to {} failed: {}", self.key, reason);
            if reason.to_lowercase().contains("auth") {
                ConnectionError::AuthenticationFailed {
                    user: self.key.user().to_string(),
                    host: self.key.host().to_string(),
                    reason,
                }
            } else {
                ConnectionError::Unreachable {
                    host: self.key.host().to_string(),
                    port: self.key.port(),
                    reason,
                }
            }
        })
    }

    /// One connection attempt: TCP connect, handshake, authenticate.
    async fn connect_once(
        &self,
        identities: &[PathBuf],
    ) -> Result<client::Handle<ClientHandler>, String> {
        let connect_timeout = config::resolve_connect_timeout(None);
        let ssh_config = build_client_config();
        let handler = ClientHandler {
            #[cfg(feature = "port_forward")]
            remote_routes: self.remote_routes.clone(),
        };

        let connect_future = client::connect(
            ssh_config,
            (self.key.host(), self.key.port()),
            handler,
        );

        let mut handle = tokio::time::timeout(connect_timeout, connect_future)
            .await
            .map_err(|_| format!("Connection timed out after {:?}", connect_timeout))?
            .map_err(|e| format!("Failed to connect: {}", e))?;

        let chain = AuthChain::standard(
            &self.key,
            identities,
            self.source.clone(),
            self.secrets.clone(),
        );

        let success = chain.authenticate(&mut handle, self.key.user()).await?;
        if !success {
            return Err("Authentication failed: no authentication methods succeeded".to_string());
        }

        Ok(handle)
    }

    /// Re-register every queued forward on a freshly opened connection.
    #[cfg(feature = "port_forward")]
    async fn replay_forwards(
        &self,
        state: &mut SessionState,
        handle: &Arc<client::Handle<ClientHandler>>,
    ) {
        for (spec, token_slot) in state.local_forwards.iter_mut() {
            if token_slot.is_none() {
                let token = CancellationToken::new();
                match serve_local_forward(handle.clone(), spec.clone(), token.clone()).await {
                    Ok(addr) => {
                        debug!("Replayed local forward {} on {}", spec, addr);
                        *token_slot = Some(token);
                    }
                    Err(e) => warn!("Failed to replay local forward {}: {}", spec, e),
                }
            }
        }

        for spec in &state.remote_forwards {
            self.remote_routes.insert(
                spec.bind_port as u32,
                (spec.target_host.clone(), spec.target_port),
            );
            match handle.tcpip_forward("localhost", spec.bind_port as u32).await {
                Ok(_) => debug!("Replayed remote forward {}", spec),
                Err(e) => warn!("Failed to replay remote forward {}: {}", spec, e),
            }
        }
    }

    /// Register a local forward. Adding an existing spec is a no-op; while
    /// unconnected the forward is queued and replayed on the next open.
    #[cfg(feature = "port_forward")]
    pub async fn add_local_forward(&self, spec: ForwardSpec) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().await;

        if state.local_forwards.contains_key(&spec) {
            debug!("Local forward {} already registered", spec);
            return Ok(());
        }

        let live_handle = state
            .handle
            .as_ref()
            .filter(|handle| !handle.is_closed())
            .cloned();

        let token_slot = match live_handle {
            Some(handle) => {
                let token = CancellationToken::new();
                serve_local_forward(handle, spec.clone(), token.clone()).await?;
                Some(token)
            }
            None => None,
        };

        state.local_forwards.insert(spec, token_slot);
        Ok(())
    }

    /// Register a remote forward. Adding an existing spec is a no-op; while
    /// unconnected the forward is queued and replayed on the next open.
    #[cfg(feature = "port_forward")]
    pub async fn add_remote_forward(&self, spec: ForwardSpec) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().await;

        if state.remote_forwards.contains(&spec) {
            debug!("Remote forward {} already registered", spec);
            return Ok(());
        }

        self.remote_routes.insert(
            spec.bind_port as u32,
            (spec.target_host.clone(), spec.target_port),
        );

        if let Some(handle) = state.handle.as_ref().filter(|handle| !handle.is_closed()) {
            handle
                .tcpip_forward("localhost", spec.bind_port as u32)
                .await
                .map_err(|e| {
                    ConnectionError::Forward(format!(
                        "failed to register remote forward {}: {}",
                        spec, e
                    ))
                })?;
        }

        state.remote_forwards.insert(spec);
        Ok(())
    }

    /// Deregister the forward bound on `port`. Unknown ports are a no-op.
    /// With `close_if_last`, removing the last forward of the direction
    /// closes the whole session.
    #[cfg(feature = "port_forward")]
    pub async fn remove_forward(
        &self,
        direction: ForwardDirection,
        port: u16,
        close_if_last: bool,
    ) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().await;

        let remaining = match direction {
            ForwardDirection::Local => {
                let found = state
                    .local_forwards
                    .keys()
                    .find(|spec| spec.bind_port == port)
                    .cloned();
                if let Some(spec) = found {
                    if let Some(Some(token)) = state.local_forwards.remove(&spec) {
                        token.cancel();
                    }
                    debug!("Removed local forward {}", spec);
                }
                state.local_forwards.len()
            }
            ForwardDirection::Remote => {
                let found = state
                    .remote_forwards
                    .iter()
                    .find(|spec| spec.bind_port == port)
                    .cloned();
                if let Some(spec) = found {
                    state.remote_forwards.remove(&spec);
                    self.remote_routes.remove(&(port as u32));
                    if let Some(handle) =
                        state.handle.as_ref().filter(|handle| !handle.is_closed())
                    {
                        if let Err(e) = handle
                            .cancel_tcpip_forward("localhost", port as u32)
                            .await
                        {
                            warn!("Failed to cancel remote forward {}: {}", spec, e);
                        }
                    }
                    debug!("Removed remote forward {}", spec);
                }
                state.remote_forwards.len()
            }
        };

        if close_if_last && remaining == 0 {
            debug!(
                "Last {} forward removed from {}, closing session",
                direction, self.key
            );
            self.close_locked(&mut state).await;
        }

        Ok(())
    }

    /// Number of registered forwards in the given direction.
    #[cfg(feature = "port_forward")]
    pub async fn forward_count(&self, direction: ForwardDirection) -> usize {
        let state = self.state.lock().await;
        match direction {
            ForwardDirection::Local => state.local_forwards.len(),
            ForwardDirection::Remote => state.remote_forwards.len(),
        }
    }
}

/// Build the russh client configuration.
///
/// Sessions are held open for reuse, so no inactivity timeout is set; a
/// 30-second keepalive with three strikes detects dead peers instead.
fn build_client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;

    fn session() -> Session {
        Session::new(
            ConnectionKey::new("alice", "node01", 22),
            Arc::new(StaticCredentials::new().with_password("secret")),
            CredentialCache::new(),
            EventBus::new(),
        )
    }

    #[tokio::test]
    async fn test_new_session_is_unconnected() {
        let session = session();
        assert!(!session.is_connected().await);
        assert!(session.connected_at().await.is_none());
    }

    #[tokio::test]
    async fn test_close_when_unconnected_is_noop() {
        let session = session();
        session.close().await;
        assert!(!session.is_connected().await);
    }

    #[tokio::test]
    async fn test_add_identity_deduplicates() {
        let session = session();
        session.add_identity("/home/alice/.ssh/id_ed25519").await;
        session.add_identity("/home/alice/.ssh/id_ed25519").await;
        let state = session.state.lock().await;
        assert_eq!(state.identities.len(), 1);
    }

    #[cfg(feature = "port_forward")]
    mod forwards {
        use super::*;

        #[tokio::test]
        async fn test_add_forward_twice_registers_once() {
            let session = session();
            let spec = ForwardSpec::new(8080, "db.internal", 5432);

            session.add_local_forward(spec.clone()).await.unwrap();
            session.add_local_forward(spec).await.unwrap();

            assert_eq!(session.forward_count(ForwardDirection::Local).await, 1);
        }

        #[tokio::test]
        async fn test_remove_unknown_port_is_noop() {
            let session = session();
            session
                .remove_forward(ForwardDirection::Local, 9999, false)
                .await
                .unwrap();
            assert_eq!(session.forward_count(ForwardDirection::Local).await, 0);
        }

        #[tokio::test]
        async fn test_remove_forward_clears_registration() {
            let session = session();
            session
                .add_local_forward(ForwardSpec::new(8080, "db.internal", 5432))
                .await
                .unwrap();
            session
                .remove_forward(ForwardDirection::Local, 8080, false)
                .await
                .unwrap();
            assert_eq!(session.forward_count(ForwardDirection::Local).await, 0);
        }

        #[tokio::test]
        async fn test_queued_remote_forward_tracked_while_unconnected() {
            let session = session();
            session
                .add_remote_forward(ForwardSpec::new(9000, "127.0.0.1", 3000))
                .await
                .unwrap();
            assert_eq!(session.forward_count(ForwardDirection::Remote).await, 1);
        }
    }
}
