//! Command execution and file transfer over a shared SSH session.
//!
//! Every operation opens a fresh exec channel on the executor's
//! [`Session`]; the session itself is cached and reused across calls.
//! Command output is pumped by `select!`ing channel messages against the
//! rolling deadline, with the same credential-prompt injection as the
//! local executor plus auto-acceptance of host-key questions. Transfers
//! run the wire protocol from [`crate::scp`] over the channel's byte
//! stream.
//!
//! A failure that looks like a dead session closes the cached connection,
//! reopens it and retries the operation exactly once.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::{ChannelMsg, client};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::context::ExecContext;
use crate::error::{ConnectionError, ExecError, ExecResult, is_session_down};
use crate::exec::path::{expand_local, shell_quote, shell_quote_wildcard, validate_delete_path};
use crate::exec::pump::{Deadline, PromptScanner};
use crate::exec::traits::{ExecTarget, OutputSink};
use crate::scp;
#[cfg(feature = "port_forward")]
use crate::session::ForwardSpec;
use crate::session::{ClientHandler, ConnectionKey, Session};

/// Terminal type requested when the config asks for a PTY.
const PTY_TERM: &str = "xterm";

/// Bound on the best-effort remote kill after a timeout.
const FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Should this failure be answered by reopening the session and trying
/// the operation a second time?
fn session_worth_reopening(error: &ExecError) -> bool {
    !matches!(error, ExecError::Timeout { .. }) && is_session_down(&error.to_string())
}

/// Executor backed by exec channels on a cached SSH session.
pub struct RemoteExec {
    ctx: Arc<ExecContext>,
    key: ConnectionKey,
    session: Arc<Session>,
    config: ExecutorConfig,
}

impl RemoteExec {
    /// Build an executor for `key`, sharing the context's cached session.
    pub fn new(ctx: Arc<ExecContext>, key: ConnectionKey) -> Self {
        let session = ctx.sessions().get_or_create(&key);
        Self {
            ctx,
            key,
            session,
            config: ExecutorConfig::default(),
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Open a fresh channel and start `command` on it.
    async fn open_exec_channel(
        &self,
        command: &str,
    ) -> ExecResult<(
        Arc<client::Handle<ClientHandler>>,
        russh::Channel<client::Msg>,
    )> {
        let handle = self.session.open().await?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(ConnectionError::Protocol)?;

        if self.config.request_pty {
            channel
                .request_pty(false, PTY_TERM, 80, 24, 0, 0, &[])
                .await
                .map_err(ConnectionError::Protocol)?;
        }

        channel
            .exec(true, command)
            .await
            .map_err(ConnectionError::Protocol)?;

        Ok((handle, channel))
    }

    /// One command attempt: open channel, exec, pump until closed.
    async fn run_attempt(
        &self,
        command_text: &str,
        full_command: &str,
        capture_pid: bool,
        out: OutputSink<'_>,
        err: OutputSink<'_>,
        secret: Option<&str>,
    ) -> ExecResult<i32> {
        let (handle, mut channel) = self.open_exec_channel(full_command).await?;

        let mut deadline = Deadline::new(&self.config);
        let mut password_scanner = PromptScanner::password();
        let mut host_key_scanner = PromptScanner::host_key();
        let mut scanning_password = secret.is_some();
        let mut pid_capture = PidCapture::new(capture_pid);
        let mut exit_code: Option<i32> = None;

        loop {
            tokio::select! {
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        deadline.bump_stdout();
                        let forwarded;
                        let chunk: &[u8] = if pid_capture.active() {
                            forwarded = pid_capture.feed(&data);
                            &forwarded
                        } else {
                            &data
                        };
                        if chunk.is_empty() {
                            continue;
                        }
                        if scanning_password && password_scanner.scan(chunk) {
                            if let Some(secret) = secret {
                                inject_line(&mut channel, secret).await?;
                            }
                            scanning_password = false;
                        }
                        if host_key_scanner.scan(chunk) {
                            debug!("Accepting host-key verification prompt");
                            inject_line(&mut channel, "yes").await?;
                        }
                        out.write_all(chunk).await?;
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                        deadline.bump_stderr();
                        if scanning_password && password_scanner.scan(&data) {
                            if let Some(secret) = secret {
                                inject_line(&mut channel, secret).await?;
                            }
                            scanning_password = false;
                        }
                        if host_key_scanner.scan(&data) {
                            debug!("Accepting host-key verification prompt");
                            inject_line(&mut channel, "yes").await?;
                        }
                        err.write_all(&data).await?;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status as i32);
                    }
                    Some(ChannelMsg::Eof) => {
                        if exit_code.is_some() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
                _ = deadline.wait() => {
                    warn!("Remote command timed out: {}", command_text);
                    let _ = channel.close().await;
                    if let Some(pid) = pid_capture.pid() {
                        self.force_kill(&handle, pid).await;
                    }
                    return Err(ExecError::Timeout {
                        command: command_text.to_string(),
                        timeout: deadline.timeout().unwrap_or_default(),
                    });
                }
            }
        }

        let _ = channel.close().await;

        let code = exit_code.unwrap_or(-1);
        debug!("Remote command exited with {}: {}", code, command_text);
        Ok(code)
    }

    /// Best-effort `kill -9` of the captured remote process group, issued
    /// on its own short-lived channel. Failure is logged, never raised.
    async fn force_kill(&self, handle: &Arc<client::Handle<ClientHandler>>, pid: u32) {
        let kill_command = format!("kill -9 -{}", pid);
        let attempt = async {
            let mut channel = handle.channel_open_session().await?;
            channel.exec(true, kill_command.as_str()).await?;
            while let Some(msg) = channel.wait().await {
                if matches!(msg, ChannelMsg::Close | ChannelMsg::Eof) {
                    break;
                }
            }
            let _ = channel.close().await;
            Ok::<(), russh::Error>(())
        };

        match tokio::time::timeout(FORCE_KILL_TIMEOUT, attempt).await {
            Ok(Ok(())) => debug!("Issued forced kill of remote process group {}", pid),
            Ok(Err(e)) => warn!("Forced kill of remote process group {} failed: {}", pid, e),
            Err(_) => warn!("Forced kill of remote process group {} timed out", pid),
        }
    }

    /// Run a housekeeping command, raising with its stderr on a non-zero
    /// exit.
    async fn run_checked(&self, command: &str, path: &str) -> ExecResult<()> {
        let mut out = Vec::new();
        let mut err = Vec::new();

        let mut result = self
            .run_attempt(command, command, false, &mut out, &mut err, None)
            .await;
        if let Err(e) = &result
            && session_worth_reopening(e)
        {
            warn!(
                "Session to {} looks down ({}), reopening and retrying once",
                self.key, e
            );
            self.session.reopen().await?;
            out.clear();
            err.clear();
            result = self
                .run_attempt(command, command, false, &mut out, &mut err, None)
                .await;
        }

        let code = result?;
        if code != 0 {
            let reason = String::from_utf8_lossy(&err);
            let reason = reason.trim();
            return Err(ExecError::path(
                path,
                std::io::Error::other(if reason.is_empty() {
                    format!("`{}` exited with {}", command, code)
                } else {
                    reason.to_string()
                }),
            ));
        }
        Ok(())
    }

    /// One upload attempt: run `scp -t` remotely and drive the source
    /// state machine over the channel stream, bounded by the timeout.
    async fn upload_once(
        &self,
        scp_command: &str,
        files: &[PathBuf],
        recursive: bool,
    ) -> ExecResult<usize> {
        let (_handle, channel) = self.open_exec_channel(scp_command).await?;
        let mut stream = channel.into_stream();

        let result = match self.config.timeout() {
            Some(limit) => {
                match tokio::time::timeout(limit, scp::send_local(&mut stream, files, recursive))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Transfer timed out: {}", scp_command);
                        Err(ExecError::Timeout {
                            command: scp_command.to_string(),
                            timeout: limit,
                        })
                    }
                }
            }
            None => scp::send_local(&mut stream, files, recursive).await,
        };

        let _ = stream.shutdown().await;
        result
    }

    /// One download attempt: run `scp -f` remotely and drive the sink
    /// state machine over the channel stream, bounded by the timeout.
    async fn download_once(
        &self,
        scp_command: &str,
        target: &std::path::Path,
        recursive: bool,
    ) -> ExecResult<usize> {
        let (_handle, channel) = self.open_exec_channel(scp_command).await?;
        let mut stream = channel.into_stream();

        let result = match self.config.timeout() {
            Some(limit) => {
                match tokio::time::timeout(limit, scp::receive_into(&mut stream, target, recursive))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Transfer timed out: {}", scp_command);
                        Err(ExecError::Timeout {
                            command: scp_command.to_string(),
                            timeout: limit,
                        })
                    }
                }
            }
            None => scp::receive_into(&mut stream, target, recursive).await,
        };

        let _ = stream.shutdown().await;
        result
    }
}

/// Write one answer line into the channel's stdin.
async fn inject_line(channel: &mut russh::Channel<client::Msg>, answer: &str) -> ExecResult<()> {
    let line = format!("{}\n", answer);
    channel.data(line.as_bytes()).await.map_err(|_| {
        ExecError::Protocol("failed to write response into the remote channel".to_string())
    })
}

/// Assemble the remote `scp` invocation for a transfer.
///
/// `mode_flag` is `-t` (remote sink, upload) or `-f` (remote source,
/// download). The path keeps any wildcard in its final segment live for
/// the remote shell; everything else is quoted.
fn build_scp_command(
    mode_flag: &str,
    recursive: bool,
    extra_options: &[String],
    remote_path: &str,
) -> String {
    let mut command = String::from("scp");
    if recursive {
        command.push_str(" -r");
    }
    for option in extra_options {
        command.push(' ');
        command.push_str(option);
    }
    command.push(' ');
    command.push_str(mode_flag);
    command.push(' ');
    command.push_str(&shell_quote_wildcard(remote_path));
    command
}

/// Collects the first output line of a forced-cleanup command, which the
/// `echo $$;` prefix makes the remote shell's process id.
struct PidCapture {
    line: Vec<u8>,
    pid: Option<u32>,
    active: bool,
}

impl PidCapture {
    fn new(active: bool) -> Self {
        Self {
            line: Vec::new(),
            pid: None,
            active,
        }
    }

    fn active(&self) -> bool {
        self.active
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Feed a chunk while the first line is still incomplete. Returns the
    /// bytes that should be forwarded to the caller: nothing while
    /// buffering, the remainder once the pid line is complete, or the
    /// whole buffered text when it turns out not to be a pid.
    fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        match chunk.iter().position(|&b| b == b'\n') {
            None => {
                self.line.extend_from_slice(chunk);
                Vec::new()
            }
            Some(idx) => {
                self.line.extend_from_slice(&chunk[..idx]);
                self.active = false;
                let rest = &chunk[idx + 1..];

                let parsed = std::str::from_utf8(&self.line)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok());
                match parsed {
                    Some(pid) => {
                        debug!("Captured remote process id {}", pid);
                        self.pid = Some(pid);
                        rest.to_vec()
                    }
                    None => {
                        warn!("First output line is not a process id, forwarding it");
                        let mut spill = std::mem::take(&mut self.line);
                        spill.push(b'\n');
                        spill.extend_from_slice(rest);
                        spill
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ExecTarget for RemoteExec {
    async fn execute_cmd(
        &mut self,
        command: &str,
        out: OutputSink<'_>,
        err: OutputSink<'_>,
        third_party: Option<&ConnectionKey>,
    ) -> ExecResult<i32> {
        debug!("Executing on {}: {}", self.key, command);

        let secret = third_party.and_then(|key| {
            let cached = self.ctx.secrets().get(key);
            if cached.is_none() {
                warn!("No cached secret for {}, prompt injection disabled", key);
            }
            cached
        });

        let capture_pid = self.config.forced_cleanup;
        let full_command = if capture_pid {
            // The first line of output becomes the shell's own pid so a
            // timeout can target its whole process group.
            format!("echo $$; {}", command)
        } else {
            command.to_string()
        };

        let first = self
            .run_attempt(
                command,
                &full_command,
                capture_pid,
                &mut *out,
                &mut *err,
                secret.as_deref(),
            )
            .await;

        match first {
            Err(e) if session_worth_reopening(&e) => {
                warn!(
                    "Session to {} looks down ({}), reopening and retrying once",
                    self.key, e
                );
                self.session.reopen().await?;
                self.run_attempt(
                    command,
                    &full_command,
                    capture_pid,
                    out,
                    err,
                    secret.as_deref(),
                )
                .await
            }
            other => other,
        }
    }

    async fn create_dir(&mut self, path: &str, create_parents: bool) -> ExecResult<bool> {
        let command = if create_parents {
            format!("mkdir -p {}", shell_quote(path))
        } else {
            format!("mkdir {}", shell_quote(path))
        };
        self.run_checked(&command, path).await?;
        Ok(true)
    }

    async fn delete_file(
        &mut self,
        path: &str,
        recursive: bool,
        allow_wildcard: bool,
    ) -> ExecResult<bool> {
        validate_delete_path(path, allow_wildcard)?;

        let target = if allow_wildcard {
            shell_quote_wildcard(path)
        } else {
            shell_quote(path)
        };
        let command = if recursive {
            format!("rm -r -- {}", target)
        } else {
            format!("rm -- {}", target)
        };
        self.run_checked(&command, path).await?;
        Ok(true)
    }

    async fn copy_to(
        &mut self,
        sources: &[&str],
        target: &str,
        recursive: bool,
    ) -> ExecResult<usize> {
        let mut files: Vec<PathBuf> = Vec::new();
        for source in sources {
            let matches = expand_local(source)?;
            if matches.is_empty() {
                return Err(ExecError::NoMatch(source.to_string()));
            }
            files.extend(matches);
        }

        let command = build_scp_command("-t", recursive, &self.config.extra_scp_options, target);
        debug!("Uploading {} entries via `{}`", files.len(), command);

        match self.upload_once(&command, &files, recursive).await {
            Err(e) if session_worth_reopening(&e) => {
                warn!(
                    "Session to {} looks down ({}), reopening and retrying once",
                    self.key, e
                );
                self.session.reopen().await?;
                self.upload_once(&command, &files, recursive).await
            }
            other => other,
        }
    }

    async fn copy_from(
        &mut self,
        source: &str,
        target: &str,
        recursive: bool,
    ) -> ExecResult<usize> {
        let command = build_scp_command("-f", recursive, &self.config.extra_scp_options, source);
        debug!("Downloading via `{}` into {}", command, target);

        let target_dir = PathBuf::from(target);
        match self.download_once(&command, &target_dir, recursive).await {
            Err(e) if session_worth_reopening(&e) => {
                warn!(
                    "Session to {} looks down ({}), reopening and retrying once",
                    self.key, e
                );
                self.session.reopen().await?;
                self.download_once(&command, &target_dir, recursive).await
            }
            other => other,
        }
    }

    fn set_timeout(&mut self, secs: u64, restart_on_stdout: bool, restart_on_stderr: bool) {
        self.config.timeout_secs = secs;
        self.config.restart_timeout_on_stdout = restart_on_stdout;
        self.config.restart_timeout_on_stderr = restart_on_stderr;
    }

    fn set_forced_cleanup(&mut self, forced: bool) {
        self.config.forced_cleanup = forced;
    }

    async fn add_identity(&mut self, path: &str) {
        self.session.add_identity(path).await;
    }

    #[cfg(feature = "port_forward")]
    async fn set_port_forwarding_local(&mut self, spec: &str) -> ExecResult<()> {
        let spec: ForwardSpec = spec.parse()?;
        self.session.add_local_forward(spec).await?;
        Ok(())
    }

    #[cfg(feature = "port_forward")]
    async fn set_port_forwarding_remote(&mut self, spec: &str) -> ExecResult<()> {
        let spec: ForwardSpec = spec.parse()?;
        self.session.add_remote_forward(spec).await?;
        Ok(())
    }

    async fn open_connection(&mut self) -> ExecResult<bool> {
        self.session.open().await?;
        Ok(true)
    }

    async fn close_connection(&mut self) {
        self.session.close().await;
    }
}
