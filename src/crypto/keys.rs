//! Directional key schedule.
//!
//! HKDF-SHA256 expands the shared secret into 64 bytes of key material:
//! the first 32 bytes key the client→server direction, the last 32 the
//! server→client direction. Each side binds its send key to its own
//! outbound direction.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::KEY_SIZE;
use crate::error::{Error, Result};

const HKDF_SALT: &[u8] = b"smtp-tunnel-v1";
const HKDF_INFO: &[u8] = b"tunnel-keys";

/// Which end of the tunnel this key set belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Session initiator
    Client,
    /// Session responder
    Server,
}

/// Directional AEAD keys derived from the shared secret.
///
/// Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TunnelKeys {
    send: [u8; KEY_SIZE],
    recv: [u8; KEY_SIZE],
}

impl TunnelKeys {
    /// Derive the key set for one side of the tunnel.
    pub fn derive(secret: &[u8], side: Side) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), secret);
        let mut okm = [0u8; KEY_SIZE * 2];
        hkdf.expand(HKDF_INFO, &mut okm)
            .map_err(|_| Error::crypto("HKDF expansion failed"))?;

        let mut c2s = [0u8; KEY_SIZE];
        let mut s2c = [0u8; KEY_SIZE];
        c2s.copy_from_slice(&okm[..KEY_SIZE]);
        s2c.copy_from_slice(&okm[KEY_SIZE..]);
        okm.zeroize();

        Ok(match side {
            Side::Client => Self { send: c2s, recv: s2c },
            Side::Server => Self { send: s2c, recv: c2s },
        })
    }

    /// Key for this side's outbound direction.
    pub fn send_key(&self) -> &[u8; KEY_SIZE] {
        &self.send
    }

    /// Key for this side's inbound direction.
    pub fn recv_key(&self) -> &[u8; KEY_SIZE] {
        &self.recv
    }
}
