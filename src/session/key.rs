//! Connection identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConnectionError;

/// Default SSH port used when a target omits one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Identity of one remote endpoint: `user@host:port`, normalized.
///
/// This is the lookup key of the session store — all executors built with
/// an equal key share one authenticated session. Host names are compared
/// case-insensitively (stored lowercased); user names are case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    user: String,
    host: String,
    port: u16,
}

impl ConnectionKey {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into().to_lowercase(),
            port,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

impl FromStr for ConnectionKey {
    type Err = ConnectionError;

    /// Parse `user@host[:port]`. The port defaults to 22.
    ///
    /// Uses `rsplit_once` on the colon so IPv6 literals like
    /// `user@[::1]:2222` keep their bracketed host intact.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, rest) = s
            .split_once('@')
            .ok_or_else(|| ConnectionError::InvalidTarget(s.to_string()))?;

        if user.is_empty() || rest.is_empty() {
            return Err(ConnectionError::InvalidTarget(s.to_string()));
        }

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port_str)) if !host.ends_with(']') || host.contains("]:") => {
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| ConnectionError::InvalidTarget(s.to_string()))?;
                (host, port)
            }
            Some(_) | None => (rest, DEFAULT_SSH_PORT),
        };

        if host.is_empty() {
            return Err(ConnectionError::InvalidTarget(s.to_string()));
        }

        Ok(Self::new(user, host, port))
    }
}
