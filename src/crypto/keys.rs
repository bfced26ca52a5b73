//! Key types.
//!
//! Symmetric keys and private keys are zeroized on drop.

use std::fmt;

use rand::{rngs::OsRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::core::{PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE};

/// A 32-byte symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey {
    key: [u8; SECRET_KEY_SIZE],
}

impl SecretKey {
    /// Create a key from bytes.
    pub fn from_bytes(key: [u8; SECRET_KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Generate a random key.
    pub fn generate() -> Self {
        let mut key = [0u8; SECRET_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.key
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

/// A static X25519 keypair used for handshakes with contacts.
///
/// The private key is zeroized on drop.
#[derive(Clone)]
pub struct StaticKeypair {
    private: [u8; PRIVATE_KEY_SIZE],
    public: [u8; PUBLIC_KEY_SIZE],
}

impl StaticKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            private: secret.to_bytes(),
            public: public.to_bytes(),
        }
    }

    /// Rebuild a keypair from its private key.
    pub fn from_private(private: [u8; PRIVATE_KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);
        Self {
            private,
            public: public.to_bytes(),
        }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public
    }

    /// Get the private key.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn private_key(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.private
    }

    /// Compute the static DH shared secret with a remote public key.
    ///
    /// Both peers obtain the same value, which seeds their handshake-mode
    /// keys before any handshake has run.
    pub fn agree(&self, remote_public: &[u8; PUBLIC_KEY_SIZE]) -> [u8; 32] {
        let secret = StaticSecret::from(self.private);
        let public = PublicKey::from(*remote_public);
        let shared = secret.diffie_hellman(&public);
        *shared.as_bytes()
    }
}

impl Drop for StaticKeypair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeypair")
            .field("public", &format_args!("{:02x?}", &self.public[..4]))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Whether the local side is "Alice" for a pair of static public keys.
///
/// Alice is the side whose public key sorts lower. Both peers reach opposite
/// answers without exchanging anything.
pub fn is_alice(local_public: &[u8; PUBLIC_KEY_SIZE], remote_public: &[u8; PUBLIC_KEY_SIZE]) -> bool {
    local_public < remote_public
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp1 = StaticKeypair::generate();
        let kp2 = StaticKeypair::generate();

        assert_ne!(kp1.public_key(), kp2.public_key());
        assert_ne!(kp1.private_key(), kp2.private_key());
    }

    #[test]
    fn test_from_private_rebuilds_public() {
        let kp = StaticKeypair::generate();
        let rebuilt = StaticKeypair::from_private(*kp.private_key());
        assert_eq!(kp.public_key(), rebuilt.public_key());
    }

    #[test]
    fn test_agreement_is_symmetric() {
        let a = StaticKeypair::generate();
        let b = StaticKeypair::generate();
        assert_eq!(a.agree(b.public_key()), b.agree(a.public_key()));
    }

    #[test]
    fn test_exactly_one_alice() {
        let a = StaticKeypair::generate();
        let b = StaticKeypair::generate();
        assert_ne!(
            is_alice(a.public_key(), b.public_key()),
            is_alice(b.public_key(), a.public_key())
        );
    }

    #[test]
    fn test_secret_key_debug_is_redacted() {
        let key = SecretKey::from_bytes([7u8; SECRET_KEY_SIZE]);
        assert_eq!(format!("{:?}", key), "SecretKey([REDACTED])");
    }
}
