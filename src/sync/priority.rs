//! Connection priority nonces.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::core::PRIORITY_NONCE_BYTES;

/// A random nonce that breaks the tie when both peers open a connection at
/// the same time. The connection carrying the lower priority is redundant.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority {
    nonce: [u8; PRIORITY_NONCE_BYTES],
}

impl Priority {
    /// Generate a fresh priority for one connection attempt.
    pub fn generate() -> Self {
        let mut nonce = [0u8; PRIORITY_NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce);
        Self { nonce }
    }

    /// Rebuild a priority received from the peer.
    pub fn from_nonce(nonce: [u8; PRIORITY_NONCE_BYTES]) -> Self {
        Self { nonce }
    }

    /// The nonce.
    pub fn nonce(&self) -> &[u8; PRIORITY_NONCE_BYTES] {
        &self.nonce
    }
}

impl std::fmt::Debug for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Priority({:02x}{:02x}..)", self.nonce[0], self.nonce[1])
    }
}

/// Called by an incoming session with the priority the peer sent.
pub type PriorityHandler = Box<dyn Fn(Priority) + Send + Sync>;
