//! The executor contract.

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::error::ExecResult;
use crate::session::ConnectionKey;

/// A caller-supplied sink receiving one of the command's output streams.
pub type OutputSink<'a> = &'a mut (dyn AsyncWrite + Send + Unpin);

/// Uniform command-execution and file-transfer surface.
///
/// Implemented by [`LocalExec`](crate::exec::LocalExec) (OS processes and
/// direct filesystem calls) and [`RemoteExec`](crate::exec::RemoteExec)
/// (channels on a shared SSH session plus the SCP protocol). Callers issue
/// one operation at a time; configuration setters take effect from the
/// next operation.
#[async_trait]
pub trait ExecTarget: Send {
    /// Run one shell command, streaming its output into `out`/`err`.
    ///
    /// Returns the command's exit code; a non-zero code is data for the
    /// caller to inspect, not an error. When `third_party` is given, the
    /// output is watched for a credential prompt and that connection's
    /// cached secret is written to the command's stdin on first match.
    ///
    /// Fails with [`ExecError::Timeout`](crate::error::ExecError::Timeout)
    /// if the configured deadline elapses first.
    async fn execute_cmd(
        &mut self,
        command: &str,
        out: OutputSink<'_>,
        err: OutputSink<'_>,
        third_party: Option<&ConnectionKey>,
    ) -> ExecResult<i32>;

    /// Create a directory. With `create_parents`, missing ancestors are
    /// created and an already-existing directory is a success; without it,
    /// an existing path is an error.
    async fn create_dir(&mut self, path: &str, create_parents: bool) -> ExecResult<bool>;

    /// Delete a file or (with `recursive`) a directory tree. Wildcards in
    /// the final path segment are honored only with `allow_wildcard`;
    /// roots and `.`/`..` are always refused.
    async fn delete_file(
        &mut self,
        path: &str,
        recursive: bool,
        allow_wildcard: bool,
    ) -> ExecResult<bool>;

    /// Copy local files (wildcards expand against the final segment only)
    /// to `target`. Returns the number of files and directories created.
    async fn copy_to(&mut self, sources: &[&str], target: &str, recursive: bool)
    -> ExecResult<usize>;

    /// Copy from `source` into the local directory `target`. Returns the
    /// number of files and directories created.
    async fn copy_from(&mut self, source: &str, target: &str, recursive: bool)
    -> ExecResult<usize>;

    /// Set the operation timeout in seconds (0 disables it), and which
    /// streams re-arm it on fresh output.
    fn set_timeout(&mut self, secs: u64, restart_on_stdout: bool, restart_on_stderr: bool);

    /// Enable killing the remote process group when a command times out.
    fn set_forced_cleanup(&mut self, forced: bool);

    /// Register a private key file for authentication. No-op locally.
    async fn add_identity(&mut self, path: &str);

    /// Register a local port forward `lport:rhost:rport`. No-op locally.
    #[cfg(feature = "port_forward")]
    async fn set_port_forwarding_local(&mut self, spec: &str) -> ExecResult<()>;

    /// Register a remote port forward `rport:lhost:lport`. No-op locally.
    #[cfg(feature = "port_forward")]
    async fn set_port_forwarding_remote(&mut self, spec: &str) -> ExecResult<()>;

    /// Establish the underlying connection eagerly. Local targets always
    /// report true.
    async fn open_connection(&mut self) -> ExecResult<bool>;

    /// Tear down the underlying connection. No-op locally.
    async fn close_connection(&mut self);
}
