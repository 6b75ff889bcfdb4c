//! The executor contract and its two implementations.
//!
//! [`LocalExec`] runs commands as OS processes and touches the filesystem
//! directly; [`RemoteExec`] does the same work through channels on a
//! shared SSH session. Both funnel wildcard expansion and path-safety
//! checks through the helpers in `path`, and both drive their output
//! pump with the prompt scanner and deadline from `pump`.

mod local;
pub(crate) mod path;
pub(crate) mod pump;
mod remote;
mod traits;

pub use local::LocalExec;
pub use remote::RemoteExec;
pub use traits::{ExecTarget, OutputSink};
