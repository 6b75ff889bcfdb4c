//! Error taxonomy and failure classification.
//!
//! Two layers of failure exist in this crate:
//!
//! 1. [`ConnectionError`] — the session could not be established or was lost
//!    (authentication rejected, host unreachable, handle dropped).
//! 2. [`ExecError`] — a single command or transfer failed. Connection
//!    failures surface through it via `#[from]`.
//!
//! A non-zero exit code from `execute_cmd` is **not** an error; callers
//! inspect the returned code. Transfers and directory operations, in
//! contrast, raise on any failure.
//!
//! # Retry classification
//!
//! Connection attempts are retried with backoff only for transient errors.
//! Authentication failures are never retried to avoid account lockouts.
//! A separate predicate, [`is_session_down`], identifies the one condition
//! that warrants transparently reopening a cached session and retrying a
//! command exactly once.

use std::time::Duration;

use thiserror::Error;

/// Session-level failure: the connection itself is unusable.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid connection target `{0}`")]
    InvalidTarget(String),

    #[error("failed to connect to {host}:{port}: {reason}")]
    Unreachable {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("connection to {0} timed out after {1:?}")]
    ConnectTimeout(String, Duration),

    #[error("authentication failed for {user}@{host}: {reason}")]
    AuthenticationFailed {
        user: String,
        host: String,
        reason: String,
    },

    #[error("no credential available: {0}")]
    CredentialUnavailable(String),

    #[error("session to {0} is down")]
    SessionDown(String),

    #[error("port forward failed: {0}")]
    Forward(String),

    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),
}

/// Failure of a single command execution or file transfer.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("failed to run `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("{0}")]
    Connection(#[from] ConnectionError),

    /// Remote side rejected a transfer (SCP ack byte `1` or `2`); carries
    /// the remote-supplied message text verbatim.
    #[error("remote refused transfer: {0}")]
    TransferRejected(String),

    #[error("transfer protocol violation: {0}")]
    Protocol(String),

    #[error("unsafe path `{path}`: {reason}")]
    UnsafePath { path: String, reason: String },

    #[error("no files match `{0}`")]
    NoMatch(String),

    #[error("path error on `{path}`: {source}")]
    Path {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Wrap a filesystem error with the path it concerns.
    pub fn path(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Path {
            path: path.into(),
            source,
        }
    }
}

pub type ExecResult<T> = std::result::Result<T, ExecError>;

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "key authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
    "would block",
];

/// Patterns that mean the cached session handle itself has died and a
/// reconnect is worth one retry.
const SESSION_DOWN_ERRORS: &[&str] = &[
    "session is down",
    "channel open failure",
    "disconnect",
    "connection reset",
    "broken pipe",
    "channel closed",
    "not connected",
];

/// Determines if a connect-time error is transient and worth retrying.
///
/// Authentication failures take precedence: an error mentioning both an
/// auth keyword and a connection keyword is classified as permanent.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    for auth_err in AUTH_ERRORS {
        if error_lower.contains(auth_err) {
            return false;
        }
    }

    for retryable_err in RETRYABLE_ERRORS {
        if error_lower.contains(retryable_err) {
            return true;
        }
    }

    // Unknown errors are retried unless they look like a protocol-level
    // SSH failure without any connect/timeout flavour.
    !error_lower.contains("ssh")
        || error_lower.contains("timeout")
        || error_lower.contains("connect")
}

/// Does this failure mean the shared session handle is dead?
///
/// When true, the remote executor closes the session, reopens it and
/// retries the operation exactly once before surfacing the error.
pub(crate) fn is_session_down(error: &str) -> bool {
    let error_lower = error.to_lowercase();
    SESSION_DOWN_ERRORS
        .iter()
        .any(|pat| error_lower.contains(pat))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod retry_classification {
        use super::*;

        #[test]
        fn test_auth_failures_not_retryable() {
            assert!(!is_retryable_error("Authentication failed"));
            assert!(!is_retryable_error("permission denied (publickey)"));
            assert!(!is_retryable_error("All authentication methods failed"));
        }

        #[test]
        fn test_connection_errors_retryable() {
            assert!(is_retryable_error("Connection refused"));
            assert!(is_retryable_error("connection timed out after 30s"));
            assert!(is_retryable_error("Network is unreachable"));
            assert!(is_retryable_error("broken pipe"));
        }

        #[test]
        fn test_auth_takes_precedence_over_connection() {
            assert!(!is_retryable_error(
                "Connection timeout during authentication failed"
            ));
        }

        #[test]
        fn test_ssh_protocol_errors_not_retryable() {
            assert!(!is_retryable_error("SSH protocol error"));
            assert!(is_retryable_error("SSH connection timeout"));
        }

        #[test]
        fn test_unknown_errors_retryable() {
            assert!(is_retryable_error("something odd happened"));
        }
    }

    mod session_down {
        use super::*;

        #[test]
        fn test_down_patterns() {
            assert!(is_session_down("session is down"));
            assert!(is_session_down("Channel open failure"));
            assert!(is_session_down("server sent DISCONNECT"));
            assert!(is_session_down("write: Broken pipe"));
        }

        #[test]
        fn test_other_errors_are_not_down() {
            assert!(!is_session_down("exit status 1"));
            assert!(!is_session_down("no such file or directory"));
        }
    }

    mod display {
        use super::*;

        #[test]
        fn test_timeout_carries_command() {
            let err = ExecError::Timeout {
                command: "sleep 30".to_string(),
                timeout: Duration::from_secs(1),
            };
            let msg = err.to_string();
            assert!(msg.contains("sleep 30"));
            assert!(msg.contains("timed out"));
        }

        #[test]
        fn test_transfer_rejection_carries_remote_text() {
            let err = ExecError::TransferRejected("scp: disk full".to_string());
            assert!(err.to_string().contains("disk full"));
        }

        #[test]
        fn test_connection_error_converts() {
            let err: ExecError = ConnectionError::SessionDown("user@host:22".to_string()).into();
            assert!(matches!(err, ExecError::Connection(_)));
        }
    }
}
