//! # mailtun
//!
//! Covert TCP/UDP tunneling disguised as a mail-submission exchange.
//!
//! A local agent accepts application traffic through SOCKS5 and static
//! port-forward listeners and multiplexes it over one authenticated,
//! TLS-wrapped session to a remote agent, which dials the real
//! destinations. On the wire the session begins as an ordinary
//! submission-port dialog (greeting, STARTTLS, AUTH), so deep-packet
//! inspection sees opportunistic-TLS mail rather than a tunnel.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │          Applications (browser, ssh, anything)            │
//! ├──────────────────────────────────────────────────────────┤
//! │   Ingress adapters (SOCKS5, TCP/UDP port forwards)        │
//! ├──────────────────────────────────────────────────────────┤
//! │   Session engine (channel mux, waiters, ping, close)      │
//! ├──────────────────────────────────────────────────────────┤
//! │   Cover handshake (submission dialog → STARTTLS → AUTH)   │
//! ├──────────────────────────────────────────────────────────┤
//! │   TLS 1.2+ transport (rustls)                             │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The client side runs under a supervisor that reconnects with
//! exponential backoff; every channel rides the single session as
//! length-prefixed frames.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod ingress;
pub mod proto;
pub mod supervisor;
pub mod tls;
pub mod tunnel;

pub use error::{Error, Result};

/// Crate version, surfaced by the binaries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
