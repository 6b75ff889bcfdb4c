//! SSH authentication strategies and credential plumbing.
//!
//! Authentication is a chain of strategies tried in order (identity keys,
//! password, keyboard-interactive), each pulling secrets on demand from a
//! [`CredentialSource`] callback. Whatever secret succeeds is recorded in
//! the [`CredentialCache`] so that later consumers — most notably the
//! password-prompt injection in the executors — can reuse it without
//! prompting again.

pub(crate) mod chain;
pub(crate) mod interactive;
pub(crate) mod key;
pub(crate) mod password;
pub mod prompt;
pub(crate) mod traits;

pub(crate) use chain::AuthChain;
pub(crate) use interactive::InteractiveAuth;
pub(crate) use key::KeyAuth;
pub(crate) use password::PasswordAuth;
pub use prompt::{CredentialCache, CredentialSource, PromptMode, StaticCredentials};
pub(crate) use traits::AuthStrategy;
