//! Session engines for both ends of the tunnel.
//!
//! A session is one authenticated, TLS-wrapped connection carrying many
//! channels. The initiator ([`client::Tunnel`]) opens channels on behalf
//! of ingress adapters; the responder ([`server`]) dials the requested
//! destinations and pumps bytes back. Both sides speak the framing
//! protocol from [`crate::proto`] over the post-TLS byte stream.

pub mod client;
pub mod server;

pub use client::{Tunnel, TunnelReader};
pub use server::Server;

use std::time::Duration;

/// Deadline for the responder's outbound dials.
pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a channel-open waits for CONNECT_OK / CONNECT_FAIL.
pub(crate) const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a ping waits for its PONG.
pub(crate) const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Read buffer size for the byte pumps.
pub(crate) const READ_BUF_SIZE: usize = 32 * 1024;

/// Depth of the per-channel inbound queues.
pub(crate) const CHANNEL_QUEUE: usize = 64;
