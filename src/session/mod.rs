//! Session identity, lifecycle and the shared session cache.

#[cfg(feature = "port_forward")]
pub(crate) mod forward;
mod key;
#[allow(clippy::module_inception)]
mod session;
mod store;

#[cfg(feature = "port_forward")]
pub use forward::{ForwardDirection, ForwardSpec};
pub use key::{ConnectionKey, DEFAULT_SSH_PORT};
pub use session::{ClientHandler, Session};
pub use store::SessionStore;
