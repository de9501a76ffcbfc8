//! Cryptographic helpers for the tunnel.
//!
//! This module provides:
//! - Time-bounded HMAC authentication tokens for the cover dialog
//! - HKDF key derivation with directional key binding
//! - An optional ChaCha20-Poly1305 layer for defense-in-depth
//!
//! Derived key material is zeroized on drop.

mod aead;
mod keys;
pub mod token;

pub use aead::TunnelCipher;
pub use keys::{Side, TunnelKeys};
pub use token::{generate_secret, generate_token, verify_token, MAX_TOKEN_AGE_SECS};

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits for ChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;
