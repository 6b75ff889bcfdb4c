//! Port forwarding specs and the local-forward listener.
//!
//! A local forward binds a TCP listener on the local side and tunnels each
//! accepted connection through a `direct-tcpip` channel (RFC 4254) to the
//! forward's target. Data flows in both directions via `tokio::io::copy`
//! until either side closes.
//!
//! Remote forwards are registered with the server via a `tcpip-forward`
//! global request; the connection handler routes incoming forwarded
//! channels back to the target (see `session.rs`).

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use russh::client;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::ConnectionError;
use crate::session::ClientHandler;

/// Which side of the connection a forward binds on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardDirection {
    /// Bind locally, tunnel to a host reachable from the remote side.
    Local,
    /// Bind on the remote server, tunnel back to a locally reachable host.
    Remote,
}

impl fmt::Display for ForwardDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardDirection::Local => write!(f, "local"),
            ForwardDirection::Remote => write!(f, "remote"),
        }
    }
}

/// One port-forward registration: `bind_port:target_host:target_port`.
///
/// For a local forward the bind port is opened on this machine and the
/// target is resolved by the remote server; for a remote forward the bind
/// port is opened on the server and the target is resolved locally. The
/// string shape is identical in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub bind_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl ForwardSpec {
    pub fn new(bind_port: u16, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            bind_port,
            target_host: target_host.into(),
            target_port,
        }
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.bind_port, self.target_host, self.target_port
        )
    }
}

impl FromStr for ForwardSpec {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConnectionError::Forward(format!("invalid forward spec `{}`", s));

        let (bind_str, rest) = s.split_once(':').ok_or_else(bad)?;
        let (host, target_str) = rest.rsplit_once(':').ok_or_else(bad)?;

        if host.is_empty() {
            return Err(bad());
        }

        let bind_port = bind_str.parse::<u16>().map_err(|_| bad())?;
        let target_port = target_str.parse::<u16>().map_err(|_| bad())?;

        Ok(Self::new(bind_port, host, target_port))
    }
}

/// Bind the local listener for `spec` and serve it until `token` fires.
///
/// Returns the actually bound address once listening.
pub(crate) async fn serve_local_forward(
    handle: Arc<client::Handle<ClientHandler>>,
    spec: ForwardSpec,
    token: CancellationToken,
) -> Result<SocketAddr, ConnectionError> {
    let listener_addr = format!("127.0.0.1:{}", spec.bind_port);
    let listener = TcpListener::bind(&listener_addr).await.map_err(|e| {
        ConnectionError::Forward(format!(
            "failed to bind local port {}: {}",
            spec.bind_port, e
        ))
    })?;

    let local_addr = listener
        .local_addr()
        .map_err(|e| ConnectionError::Forward(format!("failed to get local address: {}", e)))?;

    tokio::spawn(async move {
        debug!("Local forward {} active on {}", spec, local_addr);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Local forward {} cancelled", spec);
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((local_stream, client_addr)) => {
                            debug!("New connection from {} to forwarded port {}", client_addr, spec.bind_port);

                            let handle = handle.clone();
                            let target_host = spec.target_host.clone();
                            let target_port = spec.target_port;

                            tokio::spawn(async move {
                                if let Err(e) = tunnel_connection(
                                    handle,
                                    local_stream,
                                    &target_host,
                                    target_port,
                                )
                                .await
                                {
                                    debug!("Forwarded connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Error accepting forwarded connection: {}", e);
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok(local_addr)
}

/// Tunnel one accepted connection through a `direct-tcpip` channel.
async fn tunnel_connection(
    handle: Arc<client::Handle<ClientHandler>>,
    local_stream: tokio::net::TcpStream,
    target_host: &str,
    target_port: u16,
) -> Result<(), String> {
    let channel = handle
        .channel_open_direct_tcpip(
            target_host,
            target_port as u32,
            "127.0.0.1",
            0, // Local originator port (not significant for direct-tcpip)
        )
        .await
        .map_err(|e| format!("Failed to open direct-tcpip channel: {}", e))?;

    let channel_stream = channel.into_stream();

    let (mut local_read, mut local_write) = tokio::io::split(local_stream);
    let (mut channel_read, mut channel_write) = tokio::io::split(channel_stream);

    let local_to_remote = tokio::io::copy(&mut local_read, &mut channel_write);
    let remote_to_local = tokio::io::copy(&mut channel_read, &mut local_write);

    // Run both directions concurrently until one completes or errors
    tokio::select! {
        result = local_to_remote => {
            if let Err(e) = result {
                debug!("Local to remote copy ended: {}", e);
            }
        }
        result = remote_to_local => {
            if let Err(e) = result {
                debug!("Remote to local copy ended: {}", e);
            }
        }
    }

    debug!("Forwarded connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spec() {
        let spec: ForwardSpec = "8080:db.internal:5432".parse().unwrap();
        assert_eq!(spec.bind_port, 8080);
        assert_eq!(spec.target_host, "db.internal");
        assert_eq!(spec.target_port, 5432);
    }

    #[test]
    fn test_display_round_trip() {
        let spec = ForwardSpec::new(8080, "db.internal", 5432);
        assert_eq!(spec.to_string(), "8080:db.internal:5432");
        let parsed: ForwardSpec = spec.to_string().parse().unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn test_rejects_malformed_specs() {
        assert!("8080".parse::<ForwardSpec>().is_err());
        assert!("8080:host".parse::<ForwardSpec>().is_err());
        assert!("notaport:host:5432".parse::<ForwardSpec>().is_err());
        assert!("8080:host:notaport".parse::<ForwardSpec>().is_err());
        assert!("8080::5432".parse::<ForwardSpec>().is_err());
    }

    #[test]
    fn test_specs_are_hashable_and_equal() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(ForwardSpec::new(8080, "host", 80));
        assert!(!set.insert(ForwardSpec::new(8080, "host", 80)));
        assert!(set.insert(ForwardSpec::new(8081, "host", 80)));
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(ForwardDirection::Local.to_string(), "local");
        assert_eq!(ForwardDirection::Remote.to_string(), "remote");
    }
}
