//! Connection plumbing: listeners, per-connection I/O tasks, outbound
//! dials, and TLS setup.
//!
//! Nothing in this module touches network state. Accepted and dialed
//! sockets are announced to the event loop as `Event::NewClient`; the
//! event loop owns the resulting client records and spawns the I/O pair.

pub mod conn;
pub mod dial;
pub mod listener;
pub mod tls;

use tokio::io::{AsyncRead, AsyncWrite};

/// A plaintext or TLS byte stream.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}
