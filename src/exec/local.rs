//! Command execution and file operations on the local machine.
//!
//! Commands run through `/bin/sh -c` in their own process group so that a
//! timeout can kill the whole tree, not just the shell. Output is pumped
//! by a single task `select!`ing both pipes against the rolling deadline;
//! filesystem operations go straight to the OS through tokio's fs layer.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::context::ExecContext;
use crate::error::{ExecError, ExecResult};
use crate::exec::path::{expand_local, validate_delete_path};
use crate::exec::pump::{Deadline, PromptScanner};
use crate::exec::traits::{ExecTarget, OutputSink};
use crate::session::ConnectionKey;

/// Read-buffer size for pipe pumping (8 KB).
const PIPE_BUFFER_SIZE: usize = 8192;

/// Executor backed by local OS processes and direct filesystem calls.
pub struct LocalExec {
    ctx: Arc<ExecContext>,
    config: ExecutorConfig,
}

impl LocalExec {
    pub fn new(ctx: Arc<ExecContext>) -> Self {
        Self {
            ctx,
            config: ExecutorConfig::default(),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Kill the child's whole process group, then the child itself.
    async fn kill_process_tree(child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // The child was spawned as its own process group leader, so a
            // negative pid addresses the entire group.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
        if let Err(e) = child.kill().await {
            debug!("Kill after timeout reported: {}", e);
        }
    }

    /// Write the cached secret plus newline into the child's stdin.
    async fn inject_secret(stdin: &mut Option<ChildStdin>, secret: &str) {
        if let Some(stdin) = stdin {
            let line = format!("{}\n", secret);
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                warn!("Failed to write secret to child stdin: {}", e);
            } else if let Err(e) = stdin.flush().await {
                warn!("Failed to flush child stdin: {}", e);
            }
        }
    }
}

#[async_trait]
impl ExecTarget for LocalExec {
    async fn execute_cmd(
        &mut self,
        command: &str,
        out: OutputSink<'_>,
        err: OutputSink<'_>,
        third_party: Option<&ConnectionKey>,
    ) -> ExecResult<i32> {
        debug!("Executing local command: {}", command);

        let secret = third_party.and_then(|key| {
            let cached = self.ctx.secrets().get(key);
            if cached.is_none() {
                warn!(
                    "No cached secret for {}, prompt injection disabled",
                    key
                );
            }
            cached
        });

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if secret.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        // New process group so a timeout can kill the whole tree.
        #[cfg(unix)]
        cmd.process_group(0);

        let spawn_err = |reason: String| ExecError::Spawn {
            command: command.to_string(),
            reason,
        };

        let mut child = cmd.spawn().map_err(|e| spawn_err(e.to_string()))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("stdout pipe missing".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_err("stderr pipe missing".to_string()))?;
        let mut stdin = child.stdin.take();

        let mut scanner = PromptScanner::password();
        let mut scanning = secret.is_some();
        let mut deadline = Deadline::new(&self.config);

        let mut obuf = [0u8; PIPE_BUFFER_SIZE];
        let mut ebuf = [0u8; PIPE_BUFFER_SIZE];
        let mut stdout_done = false;
        let mut stderr_done = false;

        while !(stdout_done && stderr_done) {
            tokio::select! {
                read = stdout.read(&mut obuf), if !stdout_done => {
                    let n = read?;
                    if n == 0 {
                        stdout_done = true;
                    } else {
                        deadline.bump_stdout();
                        if scanning && scanner.scan(&obuf[..n]) {
                            if let Some(secret) = &secret {
                                Self::inject_secret(&mut stdin, secret).await;
                            }
                            scanning = false;
                        }
                        out.write_all(&obuf[..n]).await?;
                    }
                }
                read = stderr.read(&mut ebuf), if !stderr_done => {
                    let n = read?;
                    if n == 0 {
                        stderr_done = true;
                    } else {
                        deadline.bump_stderr();
                        if scanning && scanner.scan(&ebuf[..n]) {
                            if let Some(secret) = &secret {
                                Self::inject_secret(&mut stdin, secret).await;
                            }
                            scanning = false;
                        }
                        err.write_all(&ebuf[..n]).await?;
                    }
                }
                _ = deadline.wait() => {
                    warn!("Local command timed out: {}", command);
                    Self::kill_process_tree(&mut child).await;
                    return Err(ExecError::Timeout {
                        command: command.to_string(),
                        timeout: deadline.timeout().unwrap_or_default(),
                    });
                }
            }
        }

        // Both pipes are closed; the exit status is still subject to the
        // same deadline.
        let status = tokio::select! {
            status = child.wait() => status?,
            _ = deadline.wait() => {
                warn!("Local command timed out awaiting exit: {}", command);
                Self::kill_process_tree(&mut child).await;
                return Err(ExecError::Timeout {
                    command: command.to_string(),
                    timeout: deadline.timeout().unwrap_or_default(),
                });
            }
        };

        let exit_code = status.code().unwrap_or(-1);
        debug!("Local command exited with {}: {}", exit_code, command);
        Ok(exit_code)
    }

    async fn create_dir(&mut self, path: &str, create_parents: bool) -> ExecResult<bool> {
        if create_parents {
            tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| ExecError::path(path, e))?;
        } else {
            tokio::fs::create_dir(path)
                .await
                .map_err(|e| ExecError::path(path, e))?;
        }
        Ok(true)
    }

    async fn delete_file(
        &mut self,
        path: &str,
        recursive: bool,
        allow_wildcard: bool,
    ) -> ExecResult<bool> {
        validate_delete_path(path, allow_wildcard)?;

        let targets = expand_local(path)?;
        if targets.is_empty() {
            // A permitted wildcard that matched nothing.
            return Ok(false);
        }

        for target in targets {
            let meta = tokio::fs::symlink_metadata(&target)
                .await
                .map_err(|e| ExecError::path(target.display().to_string(), e))?;

            if meta.is_dir() {
                if !recursive {
                    return Err(ExecError::UnsafePath {
                        path: target.display().to_string(),
                        reason: "is a directory and recursive delete was not requested"
                            .to_string(),
                    });
                }
                tokio::fs::remove_dir_all(&target)
                    .await
                    .map_err(|e| ExecError::path(target.display().to_string(), e))?;
            } else {
                tokio::fs::remove_file(&target)
                    .await
                    .map_err(|e| ExecError::path(target.display().to_string(), e))?;
            }
            debug!("Deleted {}", target.display());
        }
        Ok(true)
    }

    async fn copy_to(
        &mut self,
        sources: &[&str],
        target: &str,
        recursive: bool,
    ) -> ExecResult<usize> {
        copy_local(sources, target, recursive).await
    }

    async fn copy_from(
        &mut self,
        source: &str,
        target: &str,
        recursive: bool,
    ) -> ExecResult<usize> {
        copy_local(&[source], target, recursive).await
    }

    fn set_timeout(&mut self, secs: u64, restart_on_stdout: bool, restart_on_stderr: bool) {
        self.config.timeout_secs = secs;
        self.config.restart_timeout_on_stdout = restart_on_stdout;
        self.config.restart_timeout_on_stderr = restart_on_stderr;
    }

    fn set_forced_cleanup(&mut self, forced: bool) {
        self.config.forced_cleanup = forced;
    }

    async fn add_identity(&mut self, _path: &str) {
        // Identities only matter for remote targets.
    }

    #[cfg(feature = "port_forward")]
    async fn set_port_forwarding_local(&mut self, spec: &str) -> ExecResult<()> {
        debug!("Ignoring local port forward {} on a local target", spec);
        Ok(())
    }

    #[cfg(feature = "port_forward")]
    async fn set_port_forwarding_remote(&mut self, spec: &str) -> ExecResult<()> {
        debug!("Ignoring remote port forward {} on a local target", spec);
        Ok(())
    }

    async fn open_connection(&mut self) -> ExecResult<bool> {
        Ok(true)
    }

    async fn close_connection(&mut self) {}
}

/// Copy each (possibly glob) source into the `target` directory.
///
/// Returns the number of files plus directories created, the top-level
/// directory of each copied tree included.
async fn copy_local(sources: &[&str], target: &str, recursive: bool) -> ExecResult<usize> {
    let target_dir = std::path::Path::new(target);
    tokio::fs::create_dir_all(target_dir)
        .await
        .map_err(|e| ExecError::path(target, e))?;

    let mut count = 0;
    for source in sources {
        let matches = expand_local(source)?;
        if matches.is_empty() {
            return Err(ExecError::NoMatch(source.to_string()));
        }
        for matched in matches {
            count += copy_entry(&matched, target_dir, recursive).await?;
        }
    }
    Ok(count)
}

/// Copy one file or directory into `target_dir`, preserving permissions.
async fn copy_entry(
    source: &std::path::Path,
    target_dir: &std::path::Path,
    recursive: bool,
) -> ExecResult<usize> {
    let meta = tokio::fs::metadata(source)
        .await
        .map_err(|e| ExecError::path(source.display().to_string(), e))?;

    let Some(name) = source.file_name() else {
        return Err(ExecError::UnsafePath {
            path: source.display().to_string(),
            reason: "has no final path component".to_string(),
        });
    };
    let dest = target_dir.join(name);

    if meta.is_dir() {
        if !recursive {
            return Err(ExecError::UnsafePath {
                path: source.display().to_string(),
                reason: "is a directory and recursive copy was not requested".to_string(),
            });
        }

        tokio::fs::create_dir_all(&dest)
            .await
            .map_err(|e| ExecError::path(dest.display().to_string(), e))?;
        #[cfg(unix)]
        tokio::fs::set_permissions(&dest, meta.permissions())
            .await
            .map_err(|e| ExecError::path(dest.display().to_string(), e))?;

        let mut count = 1;
        let mut entries = tokio::fs::read_dir(source)
            .await
            .map_err(|e| ExecError::path(source.display().to_string(), e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ExecError::path(source.display().to_string(), e))?
        {
            count += Box::pin(copy_entry(&entry.path(), &dest, recursive)).await?;
        }
        Ok(count)
    } else {
        tokio::fs::copy(source, &dest)
            .await
            .map_err(|e| ExecError::path(source.display().to_string(), e))?;
        #[cfg(unix)]
        tokio::fs::set_permissions(&dest, meta.permissions())
            .await
            .map_err(|e| ExecError::path(dest.display().to_string(), e))?;
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;
    use std::time::{Duration, Instant};

    fn executor() -> LocalExec {
        LocalExec::new(ExecContext::new(Arc::new(StaticCredentials::new())))
    }

    async fn run(exec: &mut LocalExec, command: &str) -> (i32, String, String) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let code = exec
            .execute_cmd(command, &mut out, &mut err, None)
            .await
            .unwrap();
        (
            code,
            String::from_utf8_lossy(&out).to_string(),
            String::from_utf8_lossy(&err).to_string(),
        )
    }

    mod commands {
        use super::*;

        #[tokio::test]
        async fn test_exit_code_and_stdout() {
            let mut exec = executor();
            let (code, out, _) = run(&mut exec, "echo hello").await;
            assert_eq!(code, 0);
            assert_eq!(out, "hello\n");
        }

        #[tokio::test]
        async fn test_nonzero_exit_is_not_an_error() {
            let mut exec = executor();
            let (code, _, _) = run(&mut exec, "exit 3").await;
            assert_eq!(code, 3);
        }

        #[tokio::test]
        async fn test_stderr_is_separated() {
            let mut exec = executor();
            let (_, out, err) = run(&mut exec, "echo visible; echo hidden 1>&2").await;
            assert_eq!(out, "visible\n");
            assert_eq!(err, "hidden\n");
        }

        #[tokio::test]
        async fn test_timeout_kills_within_bounded_margin() {
            let mut exec = executor();
            exec.set_timeout(1, false, false);

            let started = Instant::now();
            let mut out = Vec::new();
            let mut err = Vec::new();
            let result = exec
                .execute_cmd("sleep 5", &mut out, &mut err, None)
                .await;
            let elapsed = started.elapsed();

            assert!(matches!(result, Err(ExecError::Timeout { .. })));
            assert!(
                elapsed < Duration::from_millis(2500),
                "timeout took {:?}",
                elapsed
            );
            if let Err(ExecError::Timeout { command, .. }) = result {
                assert_eq!(command, "sleep 5");
            }
        }

        #[tokio::test]
        async fn test_restart_on_stdout_keeps_chatty_command_alive() {
            let mut exec = executor();
            exec.set_timeout(1, true, false);

            // Prints every 400ms for ~2s total; each line re-arms the clock.
            let script = "for i in 1 2 3 4 5; do echo tick$i; sleep 0.4; done";
            let (code, out, _) = run(&mut exec, script).await;
            assert_eq!(code, 0);
            assert!(out.contains("tick5"));
        }

        #[tokio::test]
        async fn test_password_prompt_injection() {
            let ctx = ExecContext::new(Arc::new(StaticCredentials::new()));
            let key = ConnectionKey::new("alice", "node01", 22);
            ctx.secrets().store(&key, "hunter2");
            let mut exec = LocalExec::new(ctx);

            let mut out = Vec::new();
            let mut err = Vec::new();
            let code = exec
                .execute_cmd(
                    "printf 'Enter password: '; read line; echo \"got:$line\"",
                    &mut out,
                    &mut err,
                    Some(&key),
                )
                .await
                .unwrap();

            assert_eq!(code, 0);
            assert!(String::from_utf8_lossy(&out).contains("got:hunter2"));
        }
    }

    mod filesystem {
        use super::*;

        #[tokio::test]
        async fn test_create_dir_with_parents() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("a/b/c");
            let mut exec = executor();

            assert!(
                exec.create_dir(&path.to_string_lossy(), true)
                    .await
                    .unwrap()
            );
            assert!(path.is_dir());

            // Existing directory with create_parents is still a success.
            assert!(
                exec.create_dir(&path.to_string_lossy(), true)
                    .await
                    .unwrap()
            );
        }

        #[tokio::test]
        async fn test_create_dir_existing_without_parents_errors() {
            let dir = tempfile::tempdir().unwrap();
            let mut exec = executor();
            let path = dir.path().to_string_lossy().to_string();
            assert!(exec.create_dir(&path, false).await.is_err());
        }

        #[tokio::test]
        async fn test_delete_refuses_root_and_wildcards() {
            let mut exec = executor();
            assert!(exec.delete_file("/", true, false).await.is_err());
            assert!(exec.delete_file("/tmp/*.log", false, false).await.is_err());
        }

        #[tokio::test]
        async fn test_delete_directory_requires_recursive() {
            let dir = tempfile::tempdir().unwrap();
            let sub = dir.path().join("sub");
            tokio::fs::create_dir(&sub).await.unwrap();
            let mut exec = executor();

            let path = sub.to_string_lossy().to_string();
            assert!(exec.delete_file(&path, false, false).await.is_err());
            assert!(exec.delete_file(&path, true, false).await.unwrap());
            assert!(!sub.exists());
        }

        #[tokio::test]
        async fn test_delete_wildcard_when_permitted() {
            let dir = tempfile::tempdir().unwrap();
            for name in ["a.log", "b.log", "keep.txt"] {
                tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
            }
            let mut exec = executor();

            let pattern = dir.path().join("*.log");
            assert!(
                exec.delete_file(&pattern.to_string_lossy(), false, true)
                    .await
                    .unwrap()
            );
            assert!(!dir.path().join("a.log").exists());
            assert!(dir.path().join("keep.txt").exists());
        }
    }

    mod copying {
        use super::*;

        #[tokio::test]
        async fn test_wildcard_copy_matches_filename_component() {
            let src = tempfile::tempdir().unwrap();
            let dst = tempfile::tempdir().unwrap();
            for name in ["a.txt", "b.txt", "a.log"] {
                tokio::fs::write(src.path().join(name), name.as_bytes())
                    .await
                    .unwrap();
            }
            let mut exec = executor();

            let pattern = src.path().join("a.*").to_string_lossy().to_string();
            let count = exec
                .copy_to(&[&pattern], &dst.path().to_string_lossy(), false)
                .await
                .unwrap();

            assert_eq!(count, 2);
            assert!(dst.path().join("a.txt").is_file());
            assert!(dst.path().join("a.log").is_file());
            assert!(!dst.path().join("b.txt").exists());
        }

        #[tokio::test]
        async fn test_recursive_tree_copy_counts_files_and_dirs() {
            let work = tempfile::tempdir().unwrap();
            let src = work.path().join("src");
            tokio::fs::create_dir_all(src.join("sub")).await.unwrap();
            tokio::fs::write(src.join("f1"), vec![1u8; 10]).await.unwrap();
            tokio::fs::write(src.join("sub/f2"), vec![2u8; 5])
                .await
                .unwrap();

            let dst = work.path().join("dst");
            let mut exec = executor();
            let count = exec
                .copy_to(
                    &[&src.to_string_lossy()],
                    &dst.to_string_lossy(),
                    true,
                )
                .await
                .unwrap();

            // Two files plus two directories (src itself and sub).
            assert_eq!(count, 4);
            assert_eq!(
                tokio::fs::read(dst.join("src/f1")).await.unwrap().len(),
                10
            );
            assert_eq!(
                tokio::fs::read(dst.join("src/sub/f2")).await.unwrap().len(),
                5
            );
        }

        #[tokio::test]
        async fn test_no_match_is_an_error() {
            let src = tempfile::tempdir().unwrap();
            let dst = tempfile::tempdir().unwrap();
            let mut exec = executor();

            let pattern = src.path().join("*.none").to_string_lossy().to_string();
            let result = exec
                .copy_to(&[&pattern], &dst.path().to_string_lossy(), false)
                .await;
            assert!(matches!(result, Err(ExecError::NoMatch(_))));
        }

        #[cfg(unix)]
        #[tokio::test]
        async fn test_executable_bit_preserved() {
            use std::os::unix::fs::PermissionsExt;

            let src = tempfile::tempdir().unwrap();
            let dst = tempfile::tempdir().unwrap();
            let script = src.path().join("run.sh");
            tokio::fs::write(&script, b"#!/bin/sh\n").await.unwrap();
            tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
                .await
                .unwrap();

            let mut exec = executor();
            exec.copy_to(
                &[&script.to_string_lossy()],
                &dst.path().to_string_lossy(),
                false,
            )
            .await
            .unwrap();

            let mode = tokio::fs::metadata(dst.path().join("run.sh"))
                .await
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }
}
