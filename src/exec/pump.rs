//! Output-pump helpers shared by both executors.
//!
//! Two small pieces of state ride along every pump loop:
//!
//! * [`PromptScanner`] — watches the raw output stream for a credential
//!   prompt. Matching is case-insensitive, tolerates a prompt split across
//!   two reads, and fires at most once. This is a text heuristic carried
//!   over from the original tool: prompts worded without the known tokens
//!   are not detected, and ordinary output containing them triggers a
//!   spurious (harmless) injection. It is a compatibility behavior, not a
//!   guaranteed contract.
//! * [`Deadline`] — the single per-call timeout, optionally re-armed when
//!   fresh bytes arrive on the configured streams.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::ExecutorConfig;

/// Tokens recognized as credential prompts, lowercase.
const PASSWORD_TOKENS: &[&str] = &["password", "passphrase", "passcode"];

/// Tokens recognized as a host-key confirmation prompt, lowercase.
const HOST_KEY_TOKENS: &[&str] = &["yes/no"];

/// Single-shot, chunk-boundary-tolerant substring scanner.
pub(crate) struct PromptScanner {
    tokens: &'static [&'static str],
    /// Lowercased tail of previously scanned bytes, kept just long enough
    /// to catch a token straddling two chunks.
    window: Vec<u8>,
    keep: usize,
    fired: bool,
}

impl PromptScanner {
    fn new(tokens: &'static [&'static str]) -> Self {
        let keep = tokens
            .iter()
            .map(|t| t.len())
            .max()
            .unwrap_or(0)
            .saturating_sub(1);
        Self {
            tokens,
            window: Vec::new(),
            keep,
            fired: false,
        }
    }

    /// Scanner for password/passphrase/passcode prompts.
    pub fn password() -> Self {
        Self::new(PASSWORD_TOKENS)
    }

    /// Scanner for the host-key verification question.
    pub fn host_key() -> Self {
        Self::new(HOST_KEY_TOKENS)
    }

    /// Scan a fresh chunk. Returns true exactly once, on the first chunk
    /// that completes a token.
    pub fn scan(&mut self, chunk: &[u8]) -> bool {
        if self.fired {
            return false;
        }

        self.window
            .extend(chunk.iter().map(|b| b.to_ascii_lowercase()));

        for token in self.tokens {
            if contains(&self.window, token.as_bytes()) {
                self.fired = true;
                self.window.clear();
                return true;
            }
        }

        if self.window.len() > self.keep {
            let cut = self.window.len() - self.keep;
            self.window.drain(..cut);
        }
        false
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// The per-call timeout clock.
///
/// `armed` from the executor config; `bump_*` re-arms it when the matching
/// stream produced bytes and the config asks for that. [`Deadline::wait`]
/// returns an owned future suitable for a `select!` arm — it never
/// resolves when no timeout is configured.
pub(crate) struct Deadline {
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    restart_on_stdout: bool,
    restart_on_stderr: bool,
}

impl Deadline {
    pub fn new(config: &ExecutorConfig) -> Self {
        let timeout = config.timeout();
        Self {
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
            restart_on_stdout: config.restart_timeout_on_stdout,
            restart_on_stderr: config.restart_timeout_on_stderr,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Fresh stdout bytes arrived.
    pub fn bump_stdout(&mut self) {
        if self.restart_on_stdout
            && let Some(t) = self.timeout
        {
            self.deadline = Some(Instant::now() + t);
        }
    }

    /// Fresh stderr bytes arrived.
    pub fn bump_stderr(&mut self) {
        if self.restart_on_stderr
            && let Some(t) = self.timeout
        {
            self.deadline = Some(Instant::now() + t);
        }
    }

    /// A future resolving at the current deadline, or never if unlimited.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let at = self.deadline;
        async move {
            match at {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod prompt_scanner {
        use super::*;

        #[test]
        fn test_detects_password_prompt() {
            let mut scanner = PromptScanner::password();
            assert!(scanner.scan(b"Enter password: "));
        }

        #[test]
        fn test_case_insensitive() {
            let mut scanner = PromptScanner::password();
            assert!(scanner.scan(b"PASSWORD for alice: "));
        }

        #[test]
        fn test_fires_exactly_once() {
            let mut scanner = PromptScanner::password();
            assert!(scanner.scan(b"password: "));
            assert!(!scanner.scan(b"password again: "));
        }

        #[test]
        fn test_prompt_split_across_reads() {
            let mut scanner = PromptScanner::password();
            assert!(!scanner.scan(b"Enter pass"));
            assert!(scanner.scan(b"word: "));
            assert!(!scanner.scan(b"password: "));
        }

        #[test]
        fn test_split_at_every_point() {
            let prompt = b"Please type your Passphrase now";
            for split in 1..prompt.len() {
                let mut scanner = PromptScanner::password();
                let first = scanner.scan(&prompt[..split]);
                let second = scanner.scan(&prompt[split..]);
                assert!(
                    first ^ second,
                    "split at {} fired {} times",
                    split,
                    first as u8 + second as u8
                );
            }
        }

        #[test]
        fn test_passcode_token() {
            let mut scanner = PromptScanner::password();
            assert!(scanner.scan(b"Passcode or option: "));
        }

        #[test]
        fn test_plain_output_does_not_fire() {
            let mut scanner = PromptScanner::password();
            assert!(!scanner.scan(b"compiling 34 files\n"));
            assert!(!scanner.scan(b"done.\n"));
        }

        #[test]
        fn test_host_key_prompt() {
            let mut scanner = PromptScanner::host_key();
            assert!(scanner.scan(b"Are you sure you want to continue connecting (yes/no)? "));
        }
    }

    mod deadline {
        use super::*;

        #[test]
        fn test_unlimited_when_timeout_zero() {
            let config = ExecutorConfig::new().with_timeout_secs(0);
            let deadline = Deadline::new(&config);
            assert!(deadline.timeout().is_none());
        }

        #[tokio::test]
        async fn test_expires() {
            tokio::time::pause();
            let config = ExecutorConfig::new().with_timeout_secs(1);
            let deadline = Deadline::new(&config);

            let wait = deadline.wait();
            tokio::time::advance(Duration::from_millis(1100)).await;
            wait.await;
        }

        #[tokio::test]
        async fn test_bump_extends_deadline() {
            tokio::time::pause();
            let config = ExecutorConfig::new()
                .with_timeout_secs(1)
                .with_timeout_restart(true, false);
            let mut deadline = Deadline::new(&config);

            tokio::time::advance(Duration::from_millis(800)).await;
            deadline.bump_stdout();

            // The original deadline has passed, but the bump moved it.
            let wait = deadline.wait();
            tokio::time::advance(Duration::from_millis(500)).await;
            let expired = tokio::time::timeout(Duration::from_millis(1), wait).await;
            assert!(expired.is_err(), "deadline should not have fired yet");
        }

        #[tokio::test]
        async fn test_bump_on_unconfigured_stream_is_ignored() {
            tokio::time::pause();
            let config = ExecutorConfig::new()
                .with_timeout_secs(1)
                .with_timeout_restart(true, false);
            let mut deadline = Deadline::new(&config);

            tokio::time::advance(Duration::from_millis(800)).await;
            deadline.bump_stderr();

            let wait = deadline.wait();
            tokio::time::advance(Duration::from_millis(300)).await;
            wait.await; // original deadline unchanged, fires
        }
    }
}
