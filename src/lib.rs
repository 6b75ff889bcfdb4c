//! Local and remote command execution behind one interface.
//!
//! The crate runs one shell command or one file transfer per call, either
//! as a local OS process or over a cached, authenticated SSH session,
//! with timeout enforcement, credential-prompt injection, port forwarding
//! and a hand-rolled SCP implementation for transfers.
//!
//! The entry points:
//!
//! * [`ExecContext`] — constructor-injected bundle of the session store,
//!   credential cache and event bus; one per application (or per test).
//! * [`ExecTarget`] — the uniform executor contract, implemented by
//!   [`LocalExec`] and [`RemoteExec`].
//! * [`SessionStore`] / [`Session`] — at most one live SSH connection per
//!   `user@host:port`, reused by every executor with the same key.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rexec::{ExecContext, ExecTarget, RemoteExec};
//! use rexec::auth::StaticCredentials;
//!
//! # async fn demo() -> rexec::ExecResult<()> {
//! let ctx = ExecContext::new(Arc::new(StaticCredentials::new().with_password("s3cret")));
//! let mut exec = RemoteExec::new(ctx, "alice@node01:22".parse()?);
//! exec.set_timeout(60, true, false);
//!
//! let mut out = Vec::new();
//! let mut err = Vec::new();
//! let code = exec.execute_cmd("uname -a", &mut out, &mut err, None).await?;
//! # let _ = code;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod exec;
pub mod scp;
pub mod session;

pub use config::ExecutorConfig;
pub use context::ExecContext;
pub use error::{ConnectionError, ExecError, ExecResult};
pub use events::{ConnectionEvent, EventBus};
pub use exec::{ExecTarget, LocalExec, OutputSink, RemoteExec};
#[cfg(feature = "port_forward")]
pub use session::{ForwardDirection, ForwardSpec};
pub use session::{ConnectionKey, Session, SessionStore};
