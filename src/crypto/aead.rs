//! Optional ChaCha20-Poly1305 layer.
//!
//! Defense-in-depth over the TLS envelope; the session engines do not
//! depend on it for correctness and no frame-level wrapping is
//! negotiated. Sealed form: nonce(12) + ciphertext + tag(16), where the
//! nonce is an 8-byte big-endian send counter followed by 4 random
//! bytes. Associated data is empty.

use std::sync::atomic::{AtomicU64, Ordering};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::{TunnelKeys, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// Directional AEAD cipher pair for one side of the tunnel.
pub struct TunnelCipher {
    sealer: ChaCha20Poly1305,
    opener: ChaCha20Poly1305,
    send_seq: AtomicU64,
}

impl TunnelCipher {
    /// Build the cipher pair from a derived key set.
    pub fn new(keys: &TunnelKeys) -> Self {
        Self {
            sealer: ChaCha20Poly1305::new(keys.send_key().into()),
            opener: ChaCha20Poly1305::new(keys.recv_key().into()),
            send_seq: AtomicU64::new(0),
        }
    }

    /// Encrypt plaintext with this side's send key.
    ///
    /// Returns nonce + ciphertext + tag.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let seq = self.send_seq.fetch_add(1, Ordering::SeqCst);

        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&seq.to_be_bytes());
        OsRng.fill_bytes(&mut nonce[8..]);

        let ciphertext = self
            .sealer
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::crypto("encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt data sealed by the peer's send key.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::crypto("ciphertext too short"));
        }

        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        self.opener
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::crypto("decryption/authentication failed"))
    }

    /// Number of messages sealed so far (for diagnostics).
    pub fn sealed_count(&self) -> u64 {
        self.send_seq.load(Ordering::SeqCst)
    }
}
