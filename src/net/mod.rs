//! Networked runtime over TCP.
//!
//! `codec` is always available; the tokio host and receiver runtimes need
//! the `server` feature.

pub mod codec;

#[cfg(feature = "server")]
pub mod host;
#[cfg(feature = "server")]
pub mod receiver;

#[cfg(feature = "server")]
pub use host::{HostServer, HostServerConfig};
#[cfg(feature = "server")]
pub use receiver::{ReceiverClient, ReceiverClientConfig};
