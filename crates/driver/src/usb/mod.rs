//! USB subsystem
//!
//! Handles amBX discovery, device sessions and packet transfers.
//!
//! - [`discovery`] enumerates the bus and opens a session per amBX
//! - [`session`] owns one device: context, handle, interface claim, teardown
//! - [`transport`] performs interrupt OUT writes with retry
//!
//! All USB access is blocking and happens on the caller's thread.

pub mod discovery;
pub mod session;
pub mod transport;

pub use discovery::{Discovery, DiscoveryReport};
pub use session::{ClaimPolicy, ClaimRetry, DeviceIdentity, DeviceSession};
pub use transport::{RetryPolicy, Transport};
