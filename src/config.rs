//! Configuration resolution and per-executor settings.
//!
//! Defaults resolve with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `REXEC_CONNECT_TIMEOUT` | 30s | SSH connection timeout in seconds |
//! | `REXEC_COMMAND_TIMEOUT` | 0 (unlimited) | Command execution timeout in seconds |
//! | `REXEC_MAX_RETRIES` | 3 | Maximum connect retry attempts |
//! | `REXEC_RETRY_DELAY_MS` | 1000ms | Initial connect retry delay in milliseconds |
//! | `REXEC_ASKPASS` | `stdin` | Credential input mode (`stdin` or `socket`) |
//! | `REXEC_ASKPASS_HOST` | 127.0.0.1 | Host for socket credential mode |
//! | `REXEC_ASKPASS_PORT` | - | Port for socket credential mode |

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default SSH connection timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default command execution timeout in seconds (0 = unlimited)
pub(crate) const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 0;

/// Default maximum retry attempts for SSH connection
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Maximum retry delay cap
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Environment variable name for SSH connection timeout
pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "REXEC_CONNECT_TIMEOUT";

/// Environment variable name for command execution timeout
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "REXEC_COMMAND_TIMEOUT";

/// Environment variable name for max connect retries
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "REXEC_MAX_RETRIES";

/// Environment variable name for connect retry delay in milliseconds
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "REXEC_RETRY_DELAY_MS";

/// Environment variable selecting the credential input mode
pub(crate) const ASKPASS_MODE_ENV_VAR: &str = "REXEC_ASKPASS";

/// Environment variable naming the host for socket credential input
pub(crate) const ASKPASS_HOST_ENV_VAR: &str = "REXEC_ASKPASS_HOST";

/// Environment variable naming the port for socket credential input
pub(crate) const ASKPASS_PORT_ENV_VAR: &str = "REXEC_ASKPASS_PORT";

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    env::var(var).ok().and_then(|v| v.parse::<T>().ok())
}

/// Resolve the connection timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> Duration {
    let secs = timeout_param
        .or_else(|| env_parse(CONNECT_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Resolve the command timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_command_timeout(timeout_param: Option<u64>) -> u64 {
    timeout_param
        .or_else(|| env_parse(COMMAND_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS)
}

/// Resolve the max connect retries with priority: parameter -> env var -> default
pub(crate) fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    max_retries_param
        .or_else(|| env_parse(MAX_RETRIES_ENV_VAR))
        .unwrap_or(DEFAULT_MAX_RETRIES)
}

/// Resolve the initial connect retry delay with priority: parameter -> env var -> default
pub(crate) fn resolve_retry_delay(delay_ms_param: Option<u64>) -> Duration {
    let ms = delay_ms_param
        .or_else(|| env_parse(RETRY_DELAY_MS_ENV_VAR))
        .unwrap_or(DEFAULT_RETRY_DELAY_MS);
    Duration::from_millis(ms)
}

/// Per-executor settings, read at the start of each operation.
///
/// One instance is owned by each executor; setters mutate it between
/// operations. The shared session is never affected by these values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Command/transfer timeout in seconds. 0 means no timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Re-arm the timeout whenever fresh stdout bytes arrive.
    #[serde(default)]
    pub restart_timeout_on_stdout: bool,

    /// Re-arm the timeout whenever fresh stderr bytes arrive.
    #[serde(default)]
    pub restart_timeout_on_stderr: bool,

    /// Capture the remote shell pid and `kill -9` its process group on
    /// timeout or forced disconnect.
    #[serde(default)]
    pub forced_cleanup: bool,

    /// Allocate a pseudo-terminal on the exec channel.
    #[serde(default)]
    pub request_pty: bool,

    /// Extra options appended to the remote `scp` invocation.
    #[serde(default)]
    pub extra_scp_options: Vec<String>,
}

fn default_timeout_secs() -> u64 {
    resolve_command_timeout(None)
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            restart_timeout_on_stdout: false,
            restart_timeout_on_stderr: false,
            forced_cleanup: false,
            request_pty: false,
            extra_scp_options: Vec::new(),
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the timeout as a Duration, or None if timeout is disabled (0).
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout_secs))
        }
    }

    /// Set the timeout in seconds (0 disables it).
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Configure which streams re-arm the timeout.
    pub fn with_timeout_restart(mut self, on_stdout: bool, on_stderr: bool) -> Self {
        self.restart_timeout_on_stdout = on_stdout;
        self.restart_timeout_on_stderr = on_stderr;
        self
    }

    /// Enable forced remote cleanup on timeout.
    pub fn with_forced_cleanup(mut self, forced: bool) -> Self {
        self.forced_cleanup = forced;
        self
    }

    /// Request a PTY on the exec channel.
    pub fn with_pty(mut self, pty: bool) -> Self {
        self.request_pty = pty;
        self
    }

    /// Append an extra scp protocol option.
    pub fn with_scp_option(mut self, option: impl Into<String>) -> Self {
        self.extra_scp_options.push(option.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod resolution {
        use super::*;

        #[test]
        fn test_parameter_takes_priority() {
            assert_eq!(resolve_command_timeout(Some(42)), 42);
            assert_eq!(resolve_max_retries(Some(7)), 7);
        }

        #[test]
        fn test_defaults_without_parameter_or_env() {
            // Env vars are not set in the test environment for these names.
            assert_eq!(
                resolve_connect_timeout(Some(DEFAULT_CONNECT_TIMEOUT_SECS)),
                Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)
            );
            assert_eq!(resolve_retry_delay(Some(250)), Duration::from_millis(250));
        }

        #[test]
        fn test_max_retry_delay_is_reasonable() {
            assert!(MAX_RETRY_DELAY.as_secs() >= 5);
            assert!(MAX_RETRY_DELAY.as_secs() <= 60);
        }
    }

    mod executor_config {
        use super::*;

        #[test]
        fn test_default_config() {
            let config = ExecutorConfig::default();
            assert!(!config.restart_timeout_on_stdout);
            assert!(!config.restart_timeout_on_stderr);
            assert!(!config.forced_cleanup);
            assert!(!config.request_pty);
            assert!(config.extra_scp_options.is_empty());
        }

        #[test]
        fn test_zero_timeout_means_unlimited() {
            let config = ExecutorConfig::new().with_timeout_secs(0);
            assert!(config.timeout().is_none());
        }

        #[test]
        fn test_timeout_as_duration() {
            let config = ExecutorConfig::new().with_timeout_secs(90);
            assert_eq!(config.timeout(), Some(Duration::from_secs(90)));
        }

        #[test]
        fn test_builder() {
            let config = ExecutorConfig::new()
                .with_timeout_secs(30)
                .with_timeout_restart(true, false)
                .with_forced_cleanup(true)
                .with_pty(true)
                .with_scp_option("-C");

            assert_eq!(config.timeout_secs, 30);
            assert!(config.restart_timeout_on_stdout);
            assert!(!config.restart_timeout_on_stderr);
            assert!(config.forced_cleanup);
            assert!(config.request_pty);
            assert_eq!(config.extra_scp_options, vec!["-C".to_string()]);
        }
    }
}
