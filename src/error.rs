//! Error types for the tunnel.

use thiserror::Error;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during tunnel operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Network I/O error
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Malformed frame or payload
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unexpected line during the cover dialog
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Authentication failed (bad token, expired, unknown principal)
    #[error("authentication failed")]
    Auth,

    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// The peer refused or failed a channel open
    #[error("channel open failed: {0}")]
    ChannelOpen(String),

    /// Operation attempted without an active session
    #[error("tunnel not connected")]
    NotConnected,

    /// An operation exceeded its deadline
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a new TLS error
    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if this error indicates authentication failure
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Auth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Auth;
        assert_eq!(err.to_string(), "authentication failed");

        let err = Error::Timeout("connect");
        assert_eq!(err.to_string(), "connect timed out");

        let err = Error::protocol("frame too short");
        assert_eq!(err.to_string(), "protocol error: frame too short");
    }

    #[test]
    fn test_auth_predicate() {
        assert!(Error::Auth.is_auth_failure());
        assert!(!Error::NotConnected.is_auth_failure());
    }
}
